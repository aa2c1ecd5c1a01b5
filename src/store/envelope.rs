//! Passphrase envelope: a random data key encrypts the payload and is itself
//! wrapped under a scrypt-derived key.

use serde::{Deserialize, Serialize};

use super::{b64, StoreError};
use crate::crypto::{self, CryptoError, SYMMETRIC_KEY_SIZE};

const SALT_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct PassphraseEnvelope {
    #[serde(with = "b64")]
    salt: Vec<u8>,
    #[serde(with = "b64")]
    encryption_key: Vec<u8>,
    #[serde(with = "b64")]
    key_nonce: Vec<u8>,
    #[serde(with = "b64")]
    encrypted_data: Vec<u8>,
    #[serde(with = "b64")]
    data_nonce: Vec<u8>,
}

pub fn encrypt_with_passphrase(data: &[u8], passphrase: &str) -> Result<Vec<u8>, StoreError> {
    let salt = crypto::random_bytes::<SALT_LEN>();
    let kek = crypto::derive_passphrase_key(passphrase, &salt)?;
    let dek = crypto::random_bytes::<SYMMETRIC_KEY_SIZE>();

    let (encryption_key, key_nonce) = crypto::encrypt(&kek, &dek)?;
    let (encrypted_data, data_nonce) = crypto::encrypt(&dek, data)?;

    let envelope = PassphraseEnvelope {
        salt: salt.to_vec(),
        encryption_key,
        key_nonce: key_nonce.to_vec(),
        encrypted_data,
        data_nonce: data_nonce.to_vec(),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

pub fn decrypt_with_passphrase(blob: &[u8], passphrase: &str) -> Result<Vec<u8>, StoreError> {
    let envelope: PassphraseEnvelope = serde_json::from_slice(blob)
        .map_err(|e| StoreError::Corrupt(format!("envelope: {e}")))?;
    let kek = crypto::derive_passphrase_key(passphrase, &envelope.salt)?;
    let dek = crypto::decrypt(&kek, &envelope.encryption_key, &envelope.key_nonce)?;
    if dek.len() != SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::KeyLength.into());
    }
    Ok(crypto::decrypt(&dek, &envelope.encrypted_data, &envelope.data_nonce)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let blob = encrypt_with_passphrase(b"{\"hello\":1}", "p").unwrap();
        assert_eq!(decrypt_with_passphrase(&blob, "p").unwrap(), b"{\"hello\":1}");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let blob = encrypt_with_passphrase(b"secret", "p").unwrap();
        let err = decrypt_with_passphrase(&blob, "q").unwrap_err();
        assert!(matches!(err, StoreError::Crypto(CryptoError::Decrypt)));
    }

    #[test]
    fn test_tampered_field_fails() {
        let blob = encrypt_with_passphrase(b"secret", "p").unwrap();
        let mut envelope: PassphraseEnvelope = serde_json::from_slice(&blob).unwrap();
        envelope.encrypted_data[0] ^= 0x01;
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(decrypt_with_passphrase(&tampered, "p").is_err());

        let mut envelope: PassphraseEnvelope = serde_json::from_slice(&blob).unwrap();
        envelope.salt[0] ^= 0x01;
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(decrypt_with_passphrase(&tampered, "p").is_err());
    }

    #[test]
    fn test_envelope_is_json_with_base64_fields() {
        let blob = encrypt_with_passphrase(b"x", "p").unwrap();
        let value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
        for field in ["salt", "encryption_key", "key_nonce", "encrypted_data", "data_nonce"] {
            assert!(value[field].is_string(), "{field} should be a base64 string");
        }
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(
            decrypt_with_passphrase(b"not json", "p"),
            Err(StoreError::Corrupt(_))
        ));
    }
}
