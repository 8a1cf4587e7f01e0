use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use tracing::{info, warn};
use zeroize::ZeroizeOnDrop;

use crate::error::SecretError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// 32-byte ChaCha20Poly1305 key, loaded once at startup.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Generate a fresh random key.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Wrap raw key bytes. Returns `None` unless exactly `KEY_LEN` bytes are given.
pub fn load_key(bytes: &[u8]) -> Option<EncryptionKey> {
    let key: [u8; KEY_LEN] = bytes.try_into().ok()?;
    Some(EncryptionKey(key))
}

/// Load the key stored at `path`, generating and persisting a new one if the
/// file does not exist yet. Safe to call repeatedly: an existing key is never
/// replaced.
///
/// A new key is written and synced under a scratch name, then hard-linked into
/// place, so a concurrent reader never sees a partly written key file.
pub fn load_or_create_key(path: &Path) -> Result<EncryptionKey> {
    if !path.exists() {
        let key = generate_key();
        match publish_key_file(path, &key) {
            Ok(()) => {
                info!(path = %path.display(), "generated new encryption key");
                return Ok(key);
            }
            // Another process created it first; fall through and use theirs.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| format!("write key file {}", path.display()))
            }
        }
    }

    warn_if_readable_by_others(path);
    let bytes = std::fs::read(path).with_context(|| format!("read key file {}", path.display()))?;
    load_key(&bytes).ok_or_else(|| {
        anyhow::anyhow!(
            "key file {} is corrupt (expected {KEY_LEN} bytes, got {})",
            path.display(),
            bytes.len()
        )
    })
}

fn publish_key_file(path: &Path, key: &EncryptionKey) -> std::io::Result<()> {
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".tmp-{:016x}", rand::random::<u64>()));
    let staged = PathBuf::from(staged);

    let published = write_key_file(&staged, key).and_then(|()| std::fs::hard_link(&staged, path));
    if let Err(e) = std::fs::remove_file(&staged) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, path = %staged.display(), "failed to remove staged key file");
        }
    }
    published
}

fn write_key_file(path: &Path, key: &EncryptionKey) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key.as_bytes())?;
    file.sync_all()
}

#[cfg(unix)]
fn warn_if_readable_by_others(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mode = meta.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = %format!("{mode:o}"),
                "key file is accessible to other users"
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_readable_by_others(_path: &Path) {}

/// Authenticated encryption for secret values.
///
/// Every call to [`Cipher::encrypt`] draws a fresh random nonce, so encrypting
/// the same plaintext twice never yields the same ciphertext. The `aad` is
/// bound into the tag; the store passes the token so a record cannot be moved
/// under a different token and still decrypt.
#[derive(Clone)]
pub struct Cipher {
    key: Arc<EncryptionKey>,
}

impl Cipher {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Encrypt `plaintext`, returning `(ciphertext, nonce)`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(Vec<u8>, [u8; NONCE_LEN]), SecretError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| SecretError::Encryption(e.to_string()))?;

        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt `ciphertext` produced by [`Cipher::encrypt`] with the same `aad`.
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce_bytes: &[u8; NONCE_LEN],
        aad: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.key.as_bytes()));
        let nonce = Nonce::from(*nonce_bytes);

        cipher
            .decrypt(&nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| SecretError::Decryption(e.to_string()))
    }
}
