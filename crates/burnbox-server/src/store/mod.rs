pub mod crypto;
pub mod files;
pub mod model;

pub use crypto::{CryptoError, Envelope};
pub use files::{FileStore, StoreError, SweepStats};
pub use model::{EncryptedContent, SecretRecord, PART_DELIMITER};
