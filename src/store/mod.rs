pub mod b64;
pub mod credential;
pub mod device;
pub mod disk;
pub mod envelope;
pub mod index;

pub use credential::{CredentialSource, RelyingParty, SavedCredentialSource, User};
pub use device::DeviceConfig;
pub use disk::FileBlobStore;
pub use envelope::{decrypt_with_passphrase, encrypt_with_passphrase};
pub use index::IdentityVault;

use crate::cose::CoseError;
use crate::crypto::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialize: {0}")]
    Serialization(String),
    #[error("Crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Key: {0}")]
    Cose(#[from] CoseError),
    #[error("Corrupt: {0}")]
    Corrupt(String),
    #[error("Not found")]
    NotFound,
    #[error("Duplicate credential id {0}")]
    Duplicate(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
