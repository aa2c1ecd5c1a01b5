use ciborium::value::Value;

use super::authenticator_data::{build_auth_data, FLAG_USER_PRESENT};
use super::types::{Ctap2Error, GetAssertionRequest};
use super::{approval_context, success, Ctap2Server};
use crate::cbor::{canonical_map, int, text};
use crate::client::ClientAction;

pub(crate) fn handle_get_assertion(
    server: &Ctap2Server,
    req: GetAssertionRequest,
) -> Result<Vec<u8>, Ctap2Error> {
    let mut flags = server.verify_pin_auth(
        &req.client_data_hash,
        req.pin_auth.as_deref(),
        req.pin_protocol,
        false,
    )?;

    // Find credential
    let source = server
        .credentials
        .matching_credentials(&req.rp_id, &req.allow_list)
        .into_iter()
        .next()
        .ok_or(Ctap2Error::NoCredentials)?;

    // User presence
    if req.user_presence {
        let context = approval_context(
            &source.relying_party.name,
            &source.relying_party.id,
            &source.user.name,
        );
        if !server.approver.approve(ClientAction::GetAssertion, &context) {
            return Err(Ctap2Error::OperationDenied);
        }
        flags |= FLAG_USER_PRESENT;
        tracing::info!(cred_id = source.id_hex(), "Account login approved");
    }

    let counter = server.credentials.increment_signature_counter(&source.id)?;
    tracing::debug!(count = counter, "Signature counter incremented");

    let auth_data = build_auth_data(&req.rp_id, flags, counter, None);
    let mut to_sign = auth_data.clone();
    to_sign.extend_from_slice(&req.client_data_hash);
    let signature = source.private_key.sign(&to_sign)?;

    // Build response
    let mut entries = vec![
        (
            int(1),
            canonical_map(vec![
                (text("id"), Value::Bytes(source.id.clone())),
                (text("type"), text(&source.kind)),
            ]),
        ),
        (int(2), Value::Bytes(auth_data)),
        (int(3), Value::Bytes(signature)),
    ];

    // Discoverable lookup: the platform learns which account was chosen
    if req.allow_list.is_empty() {
        let mut user_map = vec![(text("id"), Value::Bytes(source.user.id.clone()))];
        if !source.user.name.is_empty() {
            user_map.push((text("name"), text(&source.user.name)));
        }
        if !source.user.display_name.is_empty() {
            user_map.push((text("displayName"), text(&source.user.display_name)));
        }
        entries.push((int(4), canonical_map(user_map)));
    }

    success(&canonical_map(entries))
}
