//! U2F (CTAP1) authenticator behind CTAPHID_MSG.

pub mod apdu;
pub mod key_handle;

use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::ReadBytesExt;

use apdu::*;
use key_handle::{KeyHandle, APPLICATION_LEN};

use crate::cbor::CborError;
use crate::client::{ApprovalContext, Approver, AttestationCapability, ClientAction, U2fCapability};
use crate::cose::{CoseError, PrivateKey};
use crate::crypto::CryptoError;
use crate::store::StoreError;

pub const VERSION: &[u8] = b"U2F_V2";

const CHALLENGE_LEN: usize = 32;
const REGISTER_RESERVED: u8 = 0x05;
const USER_PRESENT: u8 = 0x01;

#[derive(Debug, thiserror::Error)]
pub enum U2fError {
    #[error("wrong length")]
    WrongLength,
    #[error("wrong data")]
    WrongData,
    #[error("conditions not satisfied")]
    ConditionsNotSatisfied,
    #[error("instruction {0:#04x} not supported")]
    InsNotSupported(u8),
    #[error("key handle of {0} bytes does not fit its length byte")]
    KeyHandleLength(usize),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("cose: {0}")]
    Cose(#[from] CoseError),
    #[error("cbor: {0}")]
    Cbor(#[from] CborError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl U2fError {
    pub fn status_word(&self) -> u16 {
        match self {
            Self::WrongLength => SW_WRONG_LENGTH,
            Self::WrongData => SW_WRONG_DATA,
            Self::ConditionsNotSatisfied => SW_CONDITIONS_NOT_SATISFIED,
            Self::InsNotSupported(_) => SW_INS_NOT_SUPPORTED,
            Self::KeyHandleLength(_)
            | Self::Crypto(_)
            | Self::Cose(_)
            | Self::Cbor(_)
            | Self::Store(_) => SW_UNKNOWN,
        }
    }
}

pub struct U2fServer {
    device: Arc<dyn U2fCapability>,
    attestation: Arc<dyn AttestationCapability>,
    approver: Arc<dyn Approver>,
}

impl U2fServer {
    pub fn new(
        device: Arc<dyn U2fCapability>,
        attestation: Arc<dyn AttestationCapability>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        Self {
            device,
            attestation,
            approver,
        }
    }

    /// Response data followed by the status word.
    pub fn handle(&self, message: &[u8]) -> Vec<u8> {
        match Apdu::decode(message).and_then(|apdu| self.dispatch(&apdu)) {
            Ok(body) => with_status(body, SW_NO_ERROR),
            Err(e) => {
                tracing::warn!(sw = format!("{:#06x}", e.status_word()), "U2F error: {e}");
                e.status_word().to_be_bytes().to_vec()
            }
        }
    }

    fn dispatch(&self, apdu: &Apdu) -> Result<Vec<u8>, U2fError> {
        tracing::debug!(ins = format!("{:#04x}", apdu.ins), p1 = apdu.p1, len = apdu.data.len(), "U2F request");
        match apdu.ins {
            INS_VERSION => Ok(VERSION.to_vec()),
            INS_REGISTER => self.register(&apdu.data),
            INS_AUTHENTICATE => self.authenticate(apdu.p1, &apdu.data),
            ins => Err(U2fError::InsNotSupported(ins)),
        }
    }

    fn register(&self, data: &[u8]) -> Result<Vec<u8>, U2fError> {
        if data.len() != CHALLENGE_LEN + APPLICATION_LEN {
            return Err(U2fError::WrongLength);
        }
        let (challenge, application) = data.split_at(CHALLENGE_LEN);

        let private_key = PrivateKey::generate_es256();
        let public_key = private_key.public_key();
        let encoded_public_key = public_key.to_sec1_uncompressed()?;

        let mut app = [0u8; APPLICATION_LEN];
        app.copy_from_slice(application);
        let key_handle = KeyHandle {
            private_key: private_key.clone(),
            application: app,
        }
        .seal(&self.device.sealing_key())?;
        let key_handle_len =
            u8::try_from(key_handle.len()).map_err(|_| U2fError::KeyHandleLength(key_handle.len()))?;

        if !self
            .approver
            .approve(ClientAction::U2fRegister, &ApprovalContext::default())
        {
            return Err(U2fError::ConditionsNotSatisfied);
        }

        let certificate = self.attestation.create_attestation_certificate(&public_key)?;

        let mut signed = vec![0x00];
        signed.extend_from_slice(application);
        signed.extend_from_slice(challenge);
        signed.extend_from_slice(&key_handle);
        signed.extend_from_slice(&encoded_public_key);
        let signature = private_key.sign(&signed)?;

        let mut response = vec![REGISTER_RESERVED];
        response.extend_from_slice(&encoded_public_key);
        response.push(key_handle_len);
        response.extend_from_slice(&key_handle);
        response.extend_from_slice(&certificate);
        response.extend_from_slice(&signature);
        tracing::info!("U2F key registered");
        Ok(response)
    }

    fn authenticate(&self, control: u8, data: &[u8]) -> Result<Vec<u8>, U2fError> {
        let mut reader = Cursor::new(data);
        let mut challenge = [0u8; CHALLENGE_LEN];
        let mut application = [0u8; APPLICATION_LEN];
        reader
            .read_exact(&mut challenge)
            .and_then(|_| reader.read_exact(&mut application))
            .map_err(|_| U2fError::WrongLength)?;
        let key_handle_len = reader.read_u8().map_err(|_| U2fError::WrongLength)?;
        let mut sealed = vec![0u8; key_handle_len as usize];
        reader
            .read_exact(&mut sealed)
            .map_err(|_| U2fError::WrongLength)?;

        let key_handle = KeyHandle::open(&self.device.sealing_key(), &sealed).map_err(|e| {
            tracing::debug!("Invalid key handle: {e}");
            U2fError::WrongData
        })?;
        if key_handle.application != application {
            tracing::debug!("Key handle belongs to another application");
            return Err(U2fError::WrongData);
        }

        match control {
            AUTH_CHECK_ONLY => return Err(U2fError::ConditionsNotSatisfied),
            AUTH_ENFORCE => {
                if !self
                    .approver
                    .approve(ClientAction::U2fAuthenticate, &ApprovalContext::default())
                {
                    return Err(U2fError::ConditionsNotSatisfied);
                }
            }
            AUTH_DONT_ENFORCE => {}
            // no status word exists for a bad control byte
            _ => return Err(U2fError::WrongLength),
        }

        let counter = self.device.next_authentication_counter()?;
        let mut signed = application.to_vec();
        signed.push(USER_PRESENT);
        signed.extend_from_slice(&counter.to_be_bytes());
        signed.extend_from_slice(&challenge);
        let signature = key_handle.private_key.sign(&signed)?;

        let mut response = vec![USER_PRESENT];
        response.extend_from_slice(&counter.to_be_bytes());
        response.extend_from_slice(&signature);
        tracing::info!(counter, "U2F authentication signed");
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryBlobStore, StaticApprover, VirtualFidoClient};

    fn server(approve: bool) -> U2fServer {
        let client = Arc::new(
            VirtualFidoClient::load(Box::new(MemoryBlobStore::new("test"))).unwrap(),
        );
        U2fServer::new(client.clone(), client, Arc::new(StaticApprover(approve)))
    }

    #[test]
    fn test_version() {
        let response = server(true).handle(&[0, INS_VERSION, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(response, b"U2F_V2\x90\x00");
    }

    #[test]
    fn test_unknown_instruction() {
        assert_eq!(server(true).handle(&[0, 0x40, 0, 0]), vec![0x6D, 0x00]);
    }

    #[test]
    fn test_register_requires_sixty_four_bytes() {
        let mut apdu = vec![0, INS_REGISTER, 0, 0, 0, 0, 10];
        apdu.extend_from_slice(&[0; 10]);
        assert_eq!(server(true).handle(&apdu), vec![0x67, 0x00]);
    }

    #[test]
    fn test_denied_registration() {
        let mut apdu = vec![0, INS_REGISTER, 0, 0, 0, 0, 64];
        apdu.extend_from_slice(&[0; 64]);
        assert_eq!(server(false).handle(&apdu), vec![0x69, 0x85]);
    }

    #[test]
    fn test_error_status_words() {
        assert_eq!(U2fError::WrongData.status_word(), 0x6A80);
        assert_eq!(U2fError::KeyHandleLength(300).status_word(), 0x6F00);
    }
}
