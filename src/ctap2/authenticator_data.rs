use crate::config::AAGUID;
use crate::cose::{CoseError, PublicKey};
use crate::crypto;

pub const FLAG_USER_PRESENT: u8 = 0x01;
pub const FLAG_USER_VERIFIED: u8 = 0x04;
pub const FLAG_ATTESTED_CREDENTIAL_DATA: u8 = 0x40;

/// aaguid || credIdLen (BE16) || credId || COSE public key.
pub(crate) fn attested_credential_data(
    credential_id: &[u8],
    public_key: &PublicKey,
) -> Result<Vec<u8>, CoseError> {
    let cose_key = public_key.to_cose()?;
    let mut data = Vec::with_capacity(AAGUID.len() + 2 + credential_id.len() + cose_key.len());
    data.extend_from_slice(&AAGUID);
    data.extend_from_slice(&(credential_id.len() as u16).to_be_bytes());
    data.extend_from_slice(credential_id);
    data.extend_from_slice(&cose_key);
    Ok(data)
}

/// SHA256(rpId) || flags || signCount (BE32) || attestedCredentialData?
///
/// The AT flag is derived from the presence of `attested`.
pub(crate) fn build_auth_data(
    rp_id: &str,
    flags: u8,
    sign_count: u32,
    attested: Option<&[u8]>,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(37 + attested.map_or(0, <[u8]>::len));
    data.extend_from_slice(&crypto::sha256(rp_id.as_bytes()));
    match attested {
        Some(_) => data.push(flags | FLAG_ATTESTED_CREDENTIAL_DATA),
        None => data.push(flags & !FLAG_ATTESTED_CREDENTIAL_DATA),
    }
    data.extend_from_slice(&sign_count.to_be_bytes());
    if let Some(attested) = attested {
        data.extend_from_slice(attested);
    }
    data
}
