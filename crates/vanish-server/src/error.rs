use thiserror::Error;

/// Outcomes of the secret lifecycle that are not a returned value.
///
/// `Validation`, `NotFound` and `Expired` are expected, user-facing results.
/// `Storage`, `Encryption` and `Decryption` are internal faults and must never
/// be shown to a client in detail.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("{0}")]
    Validation(String),

    #[error("secret not found")]
    NotFound,

    #[error("secret expired")]
    Expired,

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),
}

impl SecretError {
    /// True for faults that should be logged at error level.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Encryption(_) | Self::Decryption(_))
    }
}
