pub mod backend;
pub mod clock;
pub mod crypto;
pub mod db;
pub mod files;
pub mod kv;
pub mod model;
pub mod token;

pub use backend::Backend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::{load_or_create_key, Cipher, EncryptionKey};
pub use db::{Limits, SecretStore};
pub use files::FileBackend;
pub use kv::RedbBackend;
pub use model::SecretRecord;
