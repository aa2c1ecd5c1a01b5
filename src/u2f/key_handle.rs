use ciborium::value::Value;

use super::U2fError;
use crate::cbor::{self, as_bytes, get, int};
use crate::cose::PrivateKey;
use crate::crypto::{self, EncryptedBox};

pub const APPLICATION_LEN: usize = 32;

/// A U2F private key bound to its application, handed to the host sealed
/// under the device key so the authenticator keeps no per-key state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    pub private_key: PrivateKey,
    pub application: [u8; APPLICATION_LEN],
}

impl KeyHandle {
    /// CBOR `{1: SEC1 DER key, 2: application}`, sealed and wrapped as an
    /// encrypted box.
    pub fn seal(&self, sealing_key: &[u8]) -> Result<Vec<u8>, U2fError> {
        let plaintext = cbor::encode(&Value::Map(vec![
            (int(1), Value::Bytes(self.private_key.to_sec1_der()?)),
            (int(2), Value::Bytes(self.application.to_vec())),
        ]))?;
        Ok(crypto::seal(sealing_key, &plaintext)?.to_cbor()?)
    }

    pub fn open(sealing_key: &[u8], sealed: &[u8]) -> Result<Self, U2fError> {
        let sealed = EncryptedBox::from_cbor(sealed)?;
        let plaintext = crypto::open(sealing_key, &sealed)?;
        let map = cbor::decode_map(&plaintext)?;

        let der = get(&map, 1).and_then(as_bytes).ok_or(U2fError::WrongData)?;
        let application = get(&map, 2)
            .and_then(as_bytes)
            .and_then(|b| <[u8; APPLICATION_LEN]>::try_from(b).ok())
            .ok_or(U2fError::WrongData)?;
        Ok(Self {
            private_key: PrivateKey::from_legacy_der(der)?,
            application,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> KeyHandle {
        KeyHandle {
            private_key: PrivateKey::generate_es256(),
            application: [0x42; APPLICATION_LEN],
        }
    }

    #[test]
    fn test_seal_then_open() {
        let key = [9u8; 32];
        let original = handle();
        let sealed = original.seal(&key).unwrap();
        assert!(sealed.len() <= 255, "key handle length must fit one byte");
        assert_eq!(KeyHandle::open(&key, &sealed).unwrap(), original);
    }

    #[test]
    fn test_tampering_is_detected() {
        let key = [9u8; 32];
        let sealed = handle().seal(&key).unwrap();
        let boxed = EncryptedBox::from_cbor(&sealed).unwrap();
        for i in 0..boxed.data.len() {
            let mut tampered = boxed.clone();
            tampered.data[i] ^= 0x01;
            let tampered = tampered.to_cbor().unwrap();
            assert!(KeyHandle::open(&key, &tampered).is_err(), "byte {i}");
        }
    }

    #[test]
    fn test_wrong_sealing_key() {
        let sealed = handle().seal(&[1u8; 32]).unwrap();
        assert!(KeyHandle::open(&[2u8; 32], &sealed).is_err());
        assert!(KeyHandle::open(&[1u8; 32], b"not cbor").is_err());
    }
}
