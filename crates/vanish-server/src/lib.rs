pub mod dirs;
pub mod error;
pub mod handlers;
pub mod server;
pub mod store;

pub use error::SecretError;
pub use server::{router, run, ServerConfig, StorageKind};

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::SecretStore,
    pub ttl: TtlPolicy,
}

/// Which expiry values the create endpoint accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Used when a request leaves `expire_seconds` out.
    pub default_seconds: u64,
    /// If set, only these values are accepted.
    pub allowed: Option<Vec<u64>>,
}

impl TtlPolicy {
    pub fn allows(&self, seconds: u64) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&seconds))
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_seconds: 3600,
            allowed: None,
        }
    }
}
