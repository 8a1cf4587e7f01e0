use std::time::Duration;

use anyhow::Result;

/// Durable token → record-bytes mapping with delete-on-read.
///
/// Implementations must make [`Backend::take`] atomic: when several callers
/// take the same token concurrently, at most one of them receives the bytes.
/// Operations on different tokens must not serialize behind a shared lock
/// held for longer than a single storage call.
pub trait Backend: Send + Sync {
    /// Durably store `record` under `token`. Fails if the token already exists;
    /// a failed call leaves no partial record visible.
    fn put(&self, token: &str, record: &[u8]) -> Result<()>;

    /// Remove and return the record for `token`, if any.
    fn take(&self, token: &str) -> Result<Option<Vec<u8>>>;

    /// Read the record for `token` without removing it.
    fn peek(&self, token: &str) -> Result<Option<Vec<u8>>>;

    /// All tokens currently stored.
    fn tokens(&self) -> Result<Vec<String>>;

    /// Delete working files left behind by an interrupted `put` or `take` that
    /// are at least `older_than` old. Returns how many were deleted.
    fn purge_scratch(&self, _older_than: Duration) -> Result<usize> {
        Ok(0)
    }
}
