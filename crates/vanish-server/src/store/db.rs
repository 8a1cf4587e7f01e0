use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::time;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::backend::Backend;
use super::clock::{Clock, SystemClock};
use super::crypto::{Cipher, EncryptionKey};
use super::files::FileBackend;
use super::kv::RedbBackend;
use super::model::SecretRecord;
use super::token;
use crate::error::SecretError;

/// Marker byte for the v1 record layout: `[RECORD_V1_MARKER] + bincode(record)`.
const RECORD_V1_MARKER: u8 = 0x01;

/// Scratch files younger than this may belong to an in-flight put or take.
const SCRATCH_GRACE: Duration = Duration::from_secs(60);

/// Input limits enforced by [`SecretStore::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum secret length in characters.
    pub max_secret_length: usize,
    pub max_ttl_seconds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_secret_length: 5000,
            max_ttl_seconds: 7 * 86400,
        }
    }
}

/// Thread-safe handle to the secret lifecycle: create, consume once, expire.
#[derive(Clone)]
pub struct SecretStore {
    backend: Arc<dyn Backend>,
    cipher: Cipher,
    clock: Arc<dyn Clock>,
    limits: Limits,
    scratch_grace: Duration,
}

impl SecretStore {
    pub fn new(
        backend: Arc<dyn Backend>,
        cipher: Cipher,
        clock: Arc<dyn Clock>,
        limits: Limits,
    ) -> Self {
        Self {
            backend,
            cipher,
            clock,
            limits,
            scratch_grace: SCRATCH_GRACE,
        }
    }

    /// How old an orphaned scratch file must be before the sweep deletes it.
    pub fn with_scratch_grace(mut self, grace: Duration) -> Self {
        self.scratch_grace = grace;
        self
    }

    /// Store records as individual files under `dir`.
    pub fn open_files(dir: &Path, key: EncryptionKey, limits: Limits) -> anyhow::Result<Self> {
        let backend = FileBackend::open(dir).context("open file store")?;
        Ok(Self::new(
            Arc::new(backend),
            Cipher::new(key),
            Arc::new(SystemClock),
            limits,
        ))
    }

    /// Store records in a redb database at `path`.
    pub fn open_redb(path: &Path, key: EncryptionKey, limits: Limits) -> anyhow::Result<Self> {
        let backend = RedbBackend::open(path).context("open redb store")?;
        Ok(Self::new(
            Arc::new(backend),
            Cipher::new(key),
            Arc::new(SystemClock),
            limits,
        ))
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Encrypt and durably store `plaintext` for `ttl_seconds`, returning the
    /// token that retrieves it once.
    pub fn submit(&self, plaintext: &str, ttl_seconds: u64) -> Result<String, SecretError> {
        self.validate(plaintext, ttl_seconds)?;

        let token = token::generate_token();
        let now = self.clock.now();
        let ttl_ms = i64::try_from(ttl_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);

        let (ciphertext, nonce) = self.cipher.encrypt(plaintext.as_bytes(), token.as_bytes())?;

        let record = SecretRecord {
            ciphertext,
            nonce,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };

        let bytes = encode(&record)?;
        self.backend.put(&token, &bytes).context("persist secret")?;

        debug!(token = %token::hint(&token), expires_at = record.expires_at, "stored secret");
        Ok(token)
    }

    /// Remove the secret behind `token` and return its plaintext.
    ///
    /// The record is gone after this call whatever the outcome: a second call
    /// with the same token always fails with [`SecretError::NotFound`].
    pub fn consume(&self, token: &str) -> Result<String, SecretError> {
        if !token::is_well_formed(token) {
            return Err(SecretError::NotFound);
        }

        let bytes = Zeroizing::new(self.backend.take(token)?.ok_or(SecretError::NotFound)?);
        let record = decode(&bytes)?;

        if record.is_expired(self.clock.now()) {
            debug!(token = %token::hint(token), "discarded expired secret");
            return Err(SecretError::Expired);
        }

        let plaintext = self
            .cipher
            .decrypt(&record.ciphertext, &record.nonce, token.as_bytes())?;

        String::from_utf8(plaintext)
            .map_err(|_| SecretError::Decryption("secret is not valid UTF-8".into()))
    }

    /// Remove every expired record, then any scratch files an interrupted
    /// put or take left behind. Returns how many records were removed.
    ///
    /// Uses `take` for the removal, so a consumer racing the sweep still gets at
    /// most one delivery (and an expired record is never delivered anyway).
    pub fn prune(&self) -> Result<usize, SecretError> {
        let now = self.clock.now();
        let mut removed = 0usize;

        for token in self.backend.tokens()? {
            let Some(bytes) = self.backend.peek(&token)? else {
                continue;
            };
            match decode(&bytes) {
                Ok(record) if record.is_expired(now) => {
                    if self.backend.take(&token)?.is_some() {
                        removed += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(token = %token::hint(&token), error = %e, "skipping unreadable record");
                }
            }
        }

        if removed > 0 {
            info!(removed, "pruned expired secrets");
        }

        let orphans = self.backend.purge_scratch(self.scratch_grace)?;
        if orphans > 0 {
            warn!(orphans, "removed leftover scratch files");
        }
        Ok(removed)
    }

    /// Spawn a background Tokio task that calls `prune()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                let store = self.clone();
                match tokio::task::spawn_blocking(move || store.prune()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "background sweep error"),
                    Err(e) => warn!(error = %e, "background sweep panicked"),
                }
            }
        });
    }

    fn validate(&self, plaintext: &str, ttl_seconds: u64) -> Result<(), SecretError> {
        if plaintext.is_empty() {
            return Err(SecretError::Validation("no secret provided".into()));
        }
        let max = self.limits.max_secret_length;
        if plaintext.chars().count() > max {
            return Err(SecretError::Validation(format!(
                "secret must be at most {max} characters"
            )));
        }
        if ttl_seconds == 0 {
            return Err(SecretError::Validation(
                "expiry must be at least one second".into(),
            ));
        }
        if ttl_seconds > self.limits.max_ttl_seconds {
            return Err(SecretError::Validation(format!(
                "expiry must be at most {} seconds",
                self.limits.max_ttl_seconds
            )));
        }
        Ok(())
    }
}

fn encode(record: &SecretRecord) -> Result<Vec<u8>, SecretError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// A record that cannot be decoded is treated like a failed decryption: the
/// stored bytes are corrupt.
fn decode(bytes: &[u8]) -> Result<SecretRecord, SecretError> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _): (SecretRecord, usize) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .map_err(|e| SecretError::Decryption(format!("corrupt record: {e}")))?;
            Ok(record)
        }
        Some((marker, _)) => Err(SecretError::Decryption(format!(
            "unknown record format {marker:#04x}"
        ))),
        None => Err(SecretError::Decryption("empty record".into())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::clock::ManualClock;
    use super::super::crypto::generate_key;
    use super::*;
    use tempfile::tempdir;

    const T0: i64 = 1_700_000_000_000;

    fn make_store() -> (SecretStore, Arc<ManualClock>, Arc<FileBackend>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileBackend::open(&dir.path().join("records")).unwrap());
        let clock = Arc::new(ManualClock::new(T0));
        let store = SecretStore::new(
            backend.clone(),
            Cipher::new(generate_key()),
            clock.clone(),
            Limits::default(),
        );
        (store, clock, backend, dir)
    }

    #[test]
    fn submit_then_consume_returns_plaintext() {
        let (s, _clock, _b, _dir) = make_store();
        let token = s.submit("hello world", 300).unwrap();
        assert_eq!(s.consume(&token).unwrap(), "hello world");
    }

    #[test]
    fn second_consume_is_not_found() {
        let (s, _clock, _b, _dir) = make_store();
        let token = s.submit("hello world", 300).unwrap();
        s.consume(&token).unwrap();
        assert!(matches!(s.consume(&token), Err(SecretError::NotFound)));
    }

    #[test]
    fn expired_then_not_found() {
        let (s, clock, _b, _dir) = make_store();
        let token = s.submit("x", 1).unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(matches!(s.consume(&token), Err(SecretError::Expired)));
        assert!(matches!(s.consume(&token), Err(SecretError::NotFound)));
    }

    #[test]
    fn readable_up_to_the_deadline() {
        let (s, clock, _b, _dir) = make_store();
        let token = s.submit("edge", 60).unwrap();
        clock.advance(Duration::from_secs(60));
        assert_eq!(s.consume(&token).unwrap(), "edge");
    }

    #[test]
    fn expired_one_millisecond_past_the_deadline() {
        let (s, clock, _b, _dir) = make_store();
        let token = s.submit("edge", 1).unwrap();
        clock.advance(Duration::from_millis(1001));
        assert!(matches!(s.consume(&token), Err(SecretError::Expired)));
    }

    #[test]
    fn deadline_is_not_rounded_to_whole_seconds() {
        let (s, clock, b, _dir) = make_store();
        clock.advance(Duration::from_millis(999));
        let token = s.submit("sub-second", 1).unwrap();
        let bytes = b.peek(&token).unwrap().unwrap();
        let record = decode(&bytes).unwrap();
        assert_eq!(record.created_at, T0 + 999);
        assert_eq!(record.expires_at, T0 + 1999);

        clock.advance(Duration::from_millis(1700));
        assert!(matches!(s.consume(&token), Err(SecretError::Expired)));
    }

    #[test]
    fn too_long_secret_is_rejected_without_a_record() {
        let (s, _clock, b, _dir) = make_store();
        let long = "a".repeat(5001);
        assert!(matches!(s.submit(&long, 300), Err(SecretError::Validation(_))));
        assert!(b.tokens().unwrap().is_empty());
    }

    #[test]
    fn length_limit_counts_characters_not_bytes() {
        let (s, _clock, _b, _dir) = make_store();
        let wide = "é".repeat(5000);
        let token = s.submit(&wide, 300).unwrap();
        assert_eq!(s.consume(&token).unwrap(), wide);
    }

    #[test]
    fn empty_secret_and_bad_ttl_are_rejected() {
        let (s, _clock, b, _dir) = make_store();
        assert!(matches!(s.submit("", 300), Err(SecretError::Validation(_))));
        assert!(matches!(s.submit("x", 0), Err(SecretError::Validation(_))));
        assert!(matches!(
            s.submit("x", Limits::default().max_ttl_seconds + 1),
            Err(SecretError::Validation(_))
        ));
        assert!(b.tokens().unwrap().is_empty());
    }

    #[test]
    fn malformed_token_is_not_found() {
        let (s, _clock, _b, _dir) = make_store();
        assert!(matches!(s.consume("nope"), Err(SecretError::NotFound)));
        assert!(matches!(
            s.consume("../../../../../../../etc/passwd"),
            Err(SecretError::NotFound)
        ));
    }

    #[test]
    fn unknown_token_is_not_found() {
        let (s, _clock, _b, _dir) = make_store();
        let token = token::generate_token();
        assert!(matches!(s.consume(&token), Err(SecretError::NotFound)));
    }

    #[test]
    fn corrupt_record_is_a_decryption_error_and_is_removed() {
        let (s, _clock, b, _dir) = make_store();
        let token = token::generate_token();
        b.put(&token, &[RECORD_V1_MARKER, 0xff, 0xff]).unwrap();
        assert!(matches!(s.consume(&token), Err(SecretError::Decryption(_))));
        assert!(matches!(s.consume(&token), Err(SecretError::NotFound)));
    }

    #[test]
    fn record_moved_to_another_token_does_not_decrypt() {
        let (s, _clock, b, _dir) = make_store();
        let original = s.submit("bound", 300).unwrap();
        let bytes = b.take(&original).unwrap().unwrap();
        let other = token::generate_token();
        b.put(&other, &bytes).unwrap();
        assert!(matches!(s.consume(&other), Err(SecretError::Decryption(_))));
    }

    #[test]
    fn records_are_encrypted_at_rest() {
        let (s, _clock, b, _dir) = make_store();
        let token = s.submit("plain words on disk", 300).unwrap();
        let bytes = b.peek(&token).unwrap().unwrap();
        let needle = b"plain words on disk";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn concurrent_consume_delivers_once() {
        let (s, _clock, _b, _dir) = make_store();
        let token = s.submit("only once", 300).unwrap();
        let delivered = AtomicUsize::new(0);
        let not_found = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..16 {
                scope.spawn(|| match s.consume(&token) {
                    Ok(v) => {
                        assert_eq!(v, "only once");
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(SecretError::NotFound) => {
                        not_found.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                });
            }
        });

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(not_found.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn redb_store_round_trip_and_single_delivery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vanish.db");
        let s = SecretStore::open_redb(&path, generate_key(), Limits::default()).unwrap();
        let token = s.submit("via redb", 300).unwrap();
        assert_eq!(s.consume(&token).unwrap(), "via redb");
        assert!(matches!(s.consume(&token), Err(SecretError::NotFound)));
    }

    #[test]
    fn prune_removes_only_expired() {
        let (s, clock, b, _dir) = make_store();
        let short = s.submit("short", 10).unwrap();
        let long = s.submit("long", 3600).unwrap();
        clock.advance(Duration::from_secs(11));

        assert_eq!(s.prune().unwrap(), 1);
        assert_eq!(b.tokens().unwrap(), vec![long.clone()]);
        assert!(matches!(s.consume(&short), Err(SecretError::NotFound)));
        assert_eq!(s.consume(&long).unwrap(), "long");
    }

    #[test]
    fn prune_skips_corrupt_records() {
        let (s, clock, b, _dir) = make_store();
        b.put(&token::generate_token(), b"garbage").unwrap();
        s.submit("gone soon", 1).unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(s.prune().unwrap(), 1);
        assert_eq!(b.tokens().unwrap().len(), 1);
    }

    #[test]
    fn prune_clears_orphaned_scratch_files() {
        let (s, _clock, _b, dir) = make_store();
        let s = s.with_scratch_grace(Duration::ZERO);
        let records = dir.path().join("records");
        let live = s.submit("still here", 300).unwrap();
        let orphan = token::generate_token();
        std::fs::write(records.join(format!("{orphan}.claim-00000000deadbeef")), b"ct").unwrap();
        std::fs::write(records.join(format!("{orphan}.tmp-00000000deadbeef")), b"ct").unwrap();

        assert_eq!(s.prune().unwrap(), 0);

        let mut left: Vec<String> = std::fs::read_dir(&records)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(left, vec![format!("{live}.rec")]);
        assert_eq!(s.consume(&live).unwrap(), "still here");
    }

    #[test]
    fn prune_keeps_fresh_scratch_files() {
        let (s, _clock, _b, dir) = make_store();
        let records = dir.path().join("records");
        let in_flight = records.join(format!("{}.tmp-0000000000000001", token::generate_token()));
        std::fs::write(&in_flight, b"ct").unwrap();

        s.prune().unwrap();
        assert!(in_flight.exists());
    }
}
