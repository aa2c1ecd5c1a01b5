use super::attestation::build_attestation_object;
use super::authenticator_data::{attested_credential_data, build_auth_data, FLAG_USER_PRESENT};
use super::types::{Ctap2Error, MakeCredentialRequest};
use super::{approval_context, success, Ctap2Server};
use crate::client::ClientAction;

pub(crate) fn handle_make_credential(
    server: &Ctap2Server,
    req: MakeCredentialRequest,
) -> Result<Vec<u8>, Ctap2Error> {
    // 1. Validate algorithm
    if !req.alg_ok {
        return Err(Ctap2Error::UnsupportedAlgorithm);
    }

    // 2. PIN
    let mut flags = server.verify_pin_auth(
        &req.client_data_hash,
        req.pin_auth.as_deref(),
        req.pin_protocol,
        true,
    )?;

    // 3. User presence
    let context = approval_context(
        &req.relying_party.name,
        &req.relying_party.id,
        &req.user.name,
    );
    if !server.approver.approve(ClientAction::MakeCredential, &context) {
        return Err(Ctap2Error::OperationDenied);
    }
    flags |= FLAG_USER_PRESENT;
    tracing::info!(rp_id = req.relying_party.id, "Account creation approved");

    // 4. excludeList
    if !req.exclude_list.is_empty()
        && !server
            .credentials
            .matching_credentials(&req.relying_party.id, &req.exclude_list)
            .is_empty()
    {
        return Err(Ctap2Error::CredentialExcluded);
    }

    // 5. New credential
    let rp_id = req.relying_party.id.clone();
    let source = server.credentials.new_credential(req.relying_party, req.user)?;
    tracing::info!(cred_id = source.id_hex(), "Credential stored");

    // 6. authData
    let public_key = source.private_key.public_key();
    let attested = attested_credential_data(&source.id, &public_key)?;
    let auth_data = build_auth_data(&rp_id, flags, source.signature_counter, Some(&attested));

    // 7. Self-issued packed attestation
    let mut to_sign = auth_data.clone();
    to_sign.extend_from_slice(&req.client_data_hash);
    let signature = source.private_key.sign(&to_sign)?;
    let certificate = server.attestation.create_attestation_certificate(&public_key)?;

    success(&build_attestation_object(
        &auth_data,
        source.private_key.algorithm(),
        &signature,
        &certificate,
    ))
}
