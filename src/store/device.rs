use serde::{Deserialize, Serialize};

use super::{b64, envelope, IdentityVault, SavedCredentialSource, StoreError};
use crate::cose::PrivateKey;
use crate::crypto::{self, SYMMETRIC_KEY_SIZE};

pub const PIN_HASH_LEN: usize = 16;

/// Process-wide authenticator state, persisted as one JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Seals U2F key handles.
    pub encryption_key: [u8; SYMMETRIC_KEY_SIZE],
    pub attestation_certificate: Vec<u8>,
    pub attestation_private_key: p256::SecretKey,
    pub authentication_counter: u32,
    pub pin_enabled: bool,
    pub pin_hash: Option<[u8; PIN_HASH_LEN]>,
    pub vault: IdentityVault,
}

#[derive(Debug, Serialize, Deserialize)]
struct SavedDeviceConfig {
    #[serde(with = "b64")]
    encryption_key: Vec<u8>,
    #[serde(with = "b64")]
    attestation_certificate: Vec<u8>,
    #[serde(with = "b64")]
    attestation_private_key: Vec<u8>,
    authentication_counter: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pin_enabled: bool,
    #[serde(
        default,
        with = "b64::option",
        skip_serializing_if = "Option::is_none"
    )]
    pin_hash: Option<Vec<u8>>,
    #[serde(default)]
    sources: Vec<SavedCredentialSource>,
}

impl DeviceConfig {
    /// Fresh state for a first run: random sealing key and a new self-signed attestation CA.
    pub fn generate() -> Result<Self, StoreError> {
        let attestation_private_key = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let attestation_certificate = crypto::create_self_signed_ca(&attestation_private_key)?;
        Ok(Self {
            encryption_key: crypto::random_bytes(),
            attestation_certificate,
            attestation_private_key,
            authentication_counter: 1,
            pin_enabled: false,
            pin_hash: None,
            vault: IdentityVault::new(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, StoreError> {
        let saved = SavedDeviceConfig {
            encryption_key: self.encryption_key.to_vec(),
            attestation_certificate: self.attestation_certificate.clone(),
            attestation_private_key: PrivateKey::Es256(self.attestation_private_key.clone())
                .to_cose()?,
            authentication_counter: self.authentication_counter,
            pin_enabled: self.pin_enabled,
            pin_hash: self.pin_hash.map(|h| h.to_vec()),
            sources: self.vault.export()?,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, StoreError> {
        let saved: SavedDeviceConfig = serde_json::from_slice(data)?;
        let encryption_key = saved
            .encryption_key
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt("encryption_key not 32 bytes".into()))?;
        let attestation_private_key = match PrivateKey::from_stored(&saved.attestation_private_key)?
        {
            PrivateKey::Es256(key) => key,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "attestation key has algorithm {}",
                    other.algorithm()
                )))
            }
        };
        let pin_hash = saved
            .pin_hash
            .map(|h| {
                <[u8; PIN_HASH_LEN]>::try_from(h.as_slice())
                    .map_err(|_| StoreError::Corrupt("pin_hash not 16 bytes".into()))
            })
            .transpose()?;
        Ok(Self {
            encryption_key,
            attestation_certificate: saved.attestation_certificate,
            attestation_private_key,
            authentication_counter: saved.authentication_counter,
            pin_enabled: saved.pin_enabled,
            pin_hash,
            vault: IdentityVault::import(saved.sources)?,
        })
    }

    pub fn encrypt(&self, passphrase: &str) -> Result<Vec<u8>, StoreError> {
        envelope::encrypt_with_passphrase(&self.to_json()?, passphrase)
    }

    pub fn decrypt(blob: &[u8], passphrase: &str) -> Result<Self, StoreError> {
        Self::from_json(&envelope::decrypt_with_passphrase(blob, passphrase)?)
    }
}
