//! PIN protocol v1: shared secret over ECDH P-256, AES-256-CBC with a zero IV
//! and left-truncated HMAC-SHA256 for pinAuth.

use ciborium::value::Value;

use super::types::*;
use super::{success, Ctap2Server};
use crate::cbor::{canonical_map, int};
use crate::config::{MIN_PIN_LENGTH, PIN_RETRIES_MAX};
use crate::cose;
use crate::crypto;
use crate::store::device::PIN_HASH_LEN;

pub(crate) fn handle_client_pin(server: &Ctap2Server, body: &[u8]) -> Result<Vec<u8>, Ctap2Error> {
    if !server.pin.supports_pin() {
        return Err(Ctap2Error::InvalidCommand);
    }
    let req = ClientPinRequest::try_from(body)?;
    if req.pin_protocol != Some(PIN_PROTOCOL_V1) {
        return Err(Ctap2Error::InvalidParameter);
    }
    tracing::debug!(sub_command = req.sub_command, "clientPIN");

    match req.sub_command {
        Some(PIN_SUBCMD_GET_RETRIES) => get_retries(server),
        Some(PIN_SUBCMD_GET_KEY_AGREEMENT) => get_key_agreement(server),
        Some(PIN_SUBCMD_SET_PIN) => set_pin(server, &req),
        Some(PIN_SUBCMD_CHANGE_PIN) => change_pin(server, &req),
        Some(PIN_SUBCMD_GET_PIN_TOKEN) => get_pin_token(server, &req),
        _ => Err(Ctap2Error::MissingParameter),
    }
}

fn get_retries(server: &Ctap2Server) -> Result<Vec<u8>, Ctap2Error> {
    let retries = server.pin.pin_retries();
    success(&canonical_map(vec![(int(3), int(i64::from(retries)))]))
}

fn get_key_agreement(server: &Ctap2Server) -> Result<Vec<u8>, Ctap2Error> {
    let key = cose::encode_key_agreement(&server.pin.key_agreement_public())?;
    success(&canonical_map(vec![(int(1), key)]))
}

fn set_pin(server: &Ctap2Server, req: &ClientPinRequest) -> Result<Vec<u8>, Ctap2Error> {
    if server.pin.pin_hash().is_some() {
        return Err(Ctap2Error::PinAuthInvalid);
    }
    let (Some(pin_auth), Some(new_pin_enc)) = (&req.pin_auth, &req.new_pin_enc) else {
        return Err(Ctap2Error::MissingParameter);
    };
    let shared = shared_secret(server, req.key_agreement.as_ref())?;
    verify_pin_auth(&shared, new_pin_enc, pin_auth)?;

    let pin = decrypt_pin(&shared, new_pin_enc)?;
    server.pin.set_pin_retries(PIN_RETRIES_MAX);
    server.pin.set_pin_hash(pin_hash(&pin))?;
    tracing::info!("PIN set");
    Ok(vec![STATUS_SUCCESS])
}

fn change_pin(server: &Ctap2Server, req: &ClientPinRequest) -> Result<Vec<u8>, Ctap2Error> {
    let (Some(pin_auth), Some(new_pin_enc), Some(pin_hash_enc)) =
        (&req.pin_auth, &req.new_pin_enc, &req.pin_hash_enc)
    else {
        return Err(Ctap2Error::MissingParameter);
    };
    let shared = shared_secret(server, req.key_agreement.as_ref())?;
    let stored = server.pin.pin_hash().ok_or(Ctap2Error::NoPinSet)?;
    if server.pin.pin_retries() == 0 {
        return Err(Ctap2Error::PinBlocked);
    }

    let mut authenticated = new_pin_enc.clone();
    authenticated.extend_from_slice(pin_hash_enc);
    verify_pin_auth(&shared, &authenticated, pin_auth)?;
    check_pin_hash(server, &shared, pin_hash_enc, &stored)?;

    let pin = decrypt_pin(&shared, new_pin_enc)?;
    server.pin.set_pin_hash(pin_hash(&pin))?;
    tracing::info!("PIN changed");
    Ok(vec![STATUS_SUCCESS])
}

fn get_pin_token(server: &Ctap2Server, req: &ClientPinRequest) -> Result<Vec<u8>, Ctap2Error> {
    let pin_hash_enc = req.pin_hash_enc.as_deref().ok_or(Ctap2Error::MissingParameter)?;
    let shared = shared_secret(server, req.key_agreement.as_ref())?;
    let stored = server.pin.pin_hash().ok_or(Ctap2Error::NoPinSet)?;
    if server.pin.pin_retries() == 0 {
        return Err(Ctap2Error::PinBlocked);
    }
    check_pin_hash(server, &shared, pin_hash_enc, &stored)?;

    let token = crypto::encrypt_aes_cbc(&shared, &server.pin.pin_token())?;
    success(&canonical_map(vec![(int(2), Value::Bytes(token))]))
}

fn shared_secret(server: &Ctap2Server, key_agreement: Option<&Value>) -> Result<[u8; 32], Ctap2Error> {
    let value = key_agreement.ok_or(Ctap2Error::MissingParameter)?;
    let platform_key = cose::decode_key_agreement(value).map_err(|e| {
        tracing::warn!("Bad platform key agreement key: {e}");
        Ctap2Error::InvalidParameter
    })?;
    Ok(server.pin.shared_secret(&platform_key))
}

fn verify_pin_auth(shared: &[u8], data: &[u8], pin_auth: &[u8]) -> Result<(), Ctap2Error> {
    if pin_auth.len() == PIN_AUTH_LEN && crypto::verify_hmac_prefix(shared, data, pin_auth) {
        Ok(())
    } else {
        Err(Ctap2Error::PinAuthInvalid)
    }
}

/// Consumes a retry before comparing. A mismatch also rotates the PIN token and
/// the key agreement key.
fn check_pin_hash(
    server: &Ctap2Server,
    shared: &[u8],
    pin_hash_enc: &[u8],
    stored: &[u8; PIN_HASH_LEN],
) -> Result<(), Ctap2Error> {
    let retries = server.pin.consume_pin_retry().ok_or(Ctap2Error::PinBlocked)?;
    let candidate = crypto::decrypt_aes_cbc(shared, pin_hash_enc)?;
    if candidate.as_slice() != stored.as_slice() {
        server.pin.rotate_pin_secrets();
        tracing::warn!(retries, "PIN mismatch");
        return Err(Ctap2Error::PinInvalid);
    }
    server.pin.set_pin_retries(PIN_RETRIES_MAX);
    Ok(())
}

/// The PIN is zero padded; everything from the first zero byte is dropped.
fn decrypt_pin(shared: &[u8], new_pin_enc: &[u8]) -> Result<Vec<u8>, Ctap2Error> {
    let mut pin = crypto::decrypt_aes_cbc(shared, new_pin_enc)?;
    if let Some(end) = pin.iter().position(|&b| b == 0) {
        pin.truncate(end);
    }
    if pin.len() < MIN_PIN_LENGTH {
        return Err(Ctap2Error::PinPolicyViolation);
    }
    Ok(pin)
}

fn pin_hash(pin: &[u8]) -> [u8; PIN_HASH_LEN] {
    let digest = crypto::sha256(pin);
    let mut hash = [0u8; PIN_HASH_LEN];
    hash.copy_from_slice(&digest[..PIN_HASH_LEN]);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypt_pin_strips_padding() {
        let key = [7u8; 32];
        let mut padded = b"1234".to_vec();
        padded.resize(64, 0);
        let enc = crypto::encrypt_aes_cbc(&key, &padded).unwrap();
        assert_eq!(decrypt_pin(&key, &enc).unwrap(), b"1234");
    }

    #[test]
    fn test_short_pin_violates_policy() {
        let key = [7u8; 32];
        let mut padded = b"123".to_vec();
        padded.resize(64, 0);
        let enc = crypto::encrypt_aes_cbc(&key, &padded).unwrap();
        assert!(matches!(
            decrypt_pin(&key, &enc),
            Err(Ctap2Error::PinPolicyViolation)
        ));
    }

    #[test]
    fn test_pin_auth_must_be_sixteen_bytes() {
        let key = [1u8; 32];
        let mac = crypto::hmac_sha256(&key, b"data").unwrap();
        assert!(verify_pin_auth(&key, b"data", &mac[..16]).is_ok());
        assert!(verify_pin_auth(&key, b"data", &mac[..8]).is_err());
        assert!(verify_pin_auth(&key, b"other", &mac[..16]).is_err());
    }
}
