//! CTAP2 authenticator behind CTAPHID_CBOR.

pub(crate) mod attestation;
pub(crate) mod authenticator_data;
pub(crate) mod client_pin;
pub(crate) mod get_assertion;
pub(crate) mod get_info;
pub(crate) mod make_credential;
pub mod types;

use std::sync::Arc;

use ciborium::value::Value;

pub use types::Ctap2Error;
use types::*;

use crate::cbor;
use crate::client::{
    ApprovalContext, Approver, AttestationCapability, CredentialCapability, PinCapability,
};
use crate::crypto;
use authenticator_data::FLAG_USER_VERIFIED;

pub struct Ctap2Server {
    credentials: Arc<dyn CredentialCapability>,
    attestation: Arc<dyn AttestationCapability>,
    pin: Arc<dyn PinCapability>,
    approver: Arc<dyn Approver>,
}

impl Ctap2Server {
    pub fn new(
        credentials: Arc<dyn CredentialCapability>,
        attestation: Arc<dyn AttestationCapability>,
        pin: Arc<dyn PinCapability>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        Self {
            credentials,
            attestation,
            pin,
            approver,
        }
    }

    /// Returns `status || cbor(response)`; errors collapse to their status byte.
    pub fn handle(&self, request: &[u8]) -> Vec<u8> {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(status = format!("{:#04x}", e.status_byte()), "CTAP2 error: {e}");
                vec![e.status_byte()]
            }
        }
    }

    fn dispatch(&self, request: &[u8]) -> Result<Vec<u8>, Ctap2Error> {
        let (&cmd, body) = request.split_first().ok_or(Ctap2Error::InvalidLength)?;
        tracing::debug!(cmd = format!("{cmd:#04x}"), len = body.len(), "CTAP2 command");
        match cmd {
            CMD_MAKE_CREDENTIAL => {
                make_credential::handle_make_credential(self, MakeCredentialRequest::try_from(body)?)
            }
            CMD_GET_ASSERTION => {
                get_assertion::handle_get_assertion(self, GetAssertionRequest::try_from(body)?)
            }
            CMD_GET_INFO => get_info::handle_get_info(self),
            CMD_CLIENT_PIN => client_pin::handle_client_pin(self, body),
            // reset and getNextAssertion are not offered
            _ => Err(Ctap2Error::InvalidCommand),
        }
    }

    /// Checks pinAuth over the client data hash. Returns the UV flag when the
    /// request proved possession of the PIN token.
    fn verify_pin_auth(
        &self,
        client_data_hash: &[u8],
        pin_auth: Option<&[u8]>,
        pin_protocol: Option<i64>,
        require_pin: bool,
    ) -> Result<u8, Ctap2Error> {
        if !self.pin.supports_pin() {
            return Ok(0);
        }
        match (pin_auth, pin_protocol) {
            (Some(param), Some(PIN_PROTOCOL_V1)) => {
                let token = self.pin.pin_token();
                if param.len() == PIN_AUTH_LEN
                    && crypto::verify_hmac_prefix(&token, client_data_hash, param)
                {
                    Ok(FLAG_USER_VERIFIED)
                } else {
                    Err(Ctap2Error::PinAuthInvalid)
                }
            }
            (Some(_), _) => Err(Ctap2Error::PinAuthInvalid),
            (None, _) if require_pin && self.pin.pin_hash().is_some() => {
                Err(Ctap2Error::PinRequired)
            }
            (None, _) => Ok(0),
        }
    }
}

/// Relying party label shown in approval prompts: its name, else its id.
fn approval_context(rp_name: &str, rp_id: &str, user_name: &str) -> ApprovalContext {
    let relying_party = if rp_name.is_empty() { rp_id } else { rp_name };
    ApprovalContext {
        relying_party: Some(relying_party.to_string()),
        user_name: (!user_name.is_empty()).then(|| user_name.to_string()),
    }
}

fn success(response: &Value) -> Result<Vec<u8>, Ctap2Error> {
    let mut buf = vec![STATUS_SUCCESS];
    buf.extend_from_slice(&cbor::encode(response)?);
    Ok(buf)
}
