use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Name, X509NameBuilder, X509};
use p256::pkcs8::EncodePrivateKey;

use super::CryptoError;

const ORGANIZATION: &str = "Self-Signed Virtual FIDO";
const ORGANIZATIONAL_UNIT: &str = "Authenticator Attestation";
const COUNTRY: &str = "US";
const VALIDITY_DAYS: u32 = 3650;

fn to_openssl_key(key: &p256::SecretKey) -> Result<PKey<Private>, CryptoError> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::KeyConversion(e.to_string()))?;
    Ok(PKey::private_key_from_pkcs8(der.as_bytes())?)
}

fn ca_name() -> Result<X509Name, CryptoError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", ORGANIZATION)?;
    name.append_entry_by_text("C", COUNTRY)?;
    Ok(name.build())
}

fn attestation_name() -> Result<X509Name, CryptoError> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("O", ORGANIZATION)?;
    name.append_entry_by_text("C", COUNTRY)?;
    name.append_entry_by_text("CN", ORGANIZATION)?;
    name.append_entry_by_text("OU", ORGANIZATIONAL_UNIT)?;
    Ok(name.build())
}

/// Self-signed attestation CA over `key`, returned as DER.
pub fn create_self_signed_ca(key: &p256::SecretKey) -> Result<Vec<u8>, CryptoError> {
    let ca_key = to_openssl_key(key)?;
    let name = ca_name()?;

    let mut builder = X509::builder()?;
    // 2 means X.509 v3
    builder.set_version(2)?;
    let serial = BigNum::from_u32(0)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_cert_sign()
            .build()?,
    )?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().server_auth().build()?)?;
    builder.set_pubkey(&ca_key)?;
    builder.sign(&ca_key, MessageDigest::sha256())?;

    Ok(builder.build().to_der()?)
}

/// Leaf attestation certificate for the key in `subject_public_key` (SubjectPublicKeyInfo DER),
/// issued by the CA. Serial 0, no subject key identifier.
pub fn create_attestation_certificate(
    ca_certificate: &[u8],
    ca_key: &p256::SecretKey,
    subject_public_key: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ca = X509::from_der(ca_certificate)?;
    let signing_key = to_openssl_key(ca_key)?;
    let subject_key = PKey::public_key_from_der(subject_public_key)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(0)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    let subject = attestation_name()?;
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(ca.subject_name())?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().client_auth().server_auth().build()?)?;
    builder.set_pubkey(&subject_key)?;
    builder.sign(&signing_key, MessageDigest::sha256())?;

    Ok(builder.build().to_der()?)
}
