use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};

/// Random bytes per token (192 bits).
pub const TOKEN_BYTES: usize = 24;
/// Encoded length of a token: unpadded URL-safe base64 of `TOKEN_BYTES`.
pub const TOKEN_LEN: usize = 32;

/// Generate a new unguessable, URL-safe token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// True if `token` has the exact shape produced by [`generate_token`].
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Short prefix safe to put in logs.
pub fn hint(token: &str) -> &str {
    token.get(..6).unwrap_or(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_tokens_are_well_formed_and_unique() {
        let tokens: HashSet<String> = (0..1000).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 1000);
        assert!(tokens.iter().all(|t| is_well_formed(t)));
    }

    #[test]
    fn rejects_path_like_and_short_tokens() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("abc"));
        assert!(!is_well_formed("../../../../../../etc/passwd.rec"));
        assert!(!is_well_formed(&"a".repeat(TOKEN_LEN + 1)));
        assert!(!is_well_formed(&format!("{}/", "a".repeat(TOKEN_LEN - 1))));
    }

    #[test]
    fn hint_never_panics() {
        assert_eq!(hint("abcdefghij"), "abcdef");
        assert_eq!(hint("ab"), "ab");
        assert_eq!(hint("ééééé"), "ééé");
    }
}
