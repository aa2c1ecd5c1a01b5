//! COSE_Key codec for the key types credentials may hold, plus the PIN key-agreement key.

use ciborium::value::Value;
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::cbor::{self, CborError};

pub const KTY_OKP: i64 = 1;
pub const KTY_EC2: i64 = 2;
pub const KTY_RSA: i64 = 3;

pub const ALG_ES256: i64 = -7;
pub const ALG_EDDSA: i64 = -8;
pub const ALG_ECDH_ES_HKDF_256: i64 = -25;
pub const ALG_PS256: i64 = -37;
pub const ALG_RS256: i64 = -257;

pub const CRV_P256: i64 = 1;
pub const CRV_ED25519: i64 = 6;

const LABEL_KTY: i64 = 1;
const LABEL_ALG: i64 = 3;
// EC2 / OKP labels
const LABEL_CRV: i64 = -1;
const LABEL_X: i64 = -2;
const LABEL_Y: i64 = -3;
const LABEL_D: i64 = -4;
// RSA labels
const LABEL_N: i64 = -1;
const LABEL_E: i64 = -2;
const LABEL_RSA_D: i64 = -3;
const LABEL_P: i64 = -4;
const LABEL_Q: i64 = -5;
const LABEL_DP: i64 = -6;
const LABEL_DQ: i64 = -7;
const LABEL_QINV: i64 = -8;

#[derive(Debug, thiserror::Error)]
pub enum CoseError {
    #[error("CBOR: {0}")]
    Cbor(#[from] CborError),
    #[error("missing label {0}")]
    MissingLabel(i64),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(i64),
    #[error("key type {kty} does not match algorithm {alg}")]
    KeyTypeMismatch { kty: i64, alg: i64 },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

fn invalid(e: impl std::fmt::Display) -> CoseError {
    CoseError::InvalidKey(e.to_string())
}

fn bytes_field(map: &[(Value, Value)], label: i64) -> Result<&[u8], CoseError> {
    cbor::get(map, label)
        .and_then(cbor::as_bytes)
        .ok_or(CoseError::MissingLabel(label))
}

fn int_field(map: &[(Value, Value)], label: i64) -> Result<i64, CoseError> {
    cbor::get(map, label)
        .and_then(cbor::as_int)
        .ok_or(CoseError::MissingLabel(label))
}

/// Reads a big-endian field element, left-padding encoders that strip leading zeros.
fn field_element(map: &[(Value, Value)], label: i64) -> Result<[u8; 32], CoseError> {
    let raw = bytes_field(map, label)?;
    if raw.len() > 32 {
        return Err(CoseError::InvalidKey(format!(
            "label {label} is {} bytes",
            raw.len()
        )));
    }
    let mut out = [0u8; 32];
    out[32 - raw.len()..].copy_from_slice(raw);
    Ok(out)
}

fn signing(e: impl std::fmt::Display) -> CoseError {
    CoseError::Signing(e.to_string())
}

fn biguint_field(map: &[(Value, Value)], label: i64) -> Result<BigUint, CoseError> {
    Ok(BigUint::from_bytes_be(bytes_field(map, label)?))
}

fn expect_kty(map: &[(Value, Value)], alg: i64, expected: i64) -> Result<(), CoseError> {
    let kty = int_field(map, LABEL_KTY)?;
    if kty != expected {
        return Err(CoseError::KeyTypeMismatch { kty, alg });
    }
    Ok(())
}

fn ec2_coordinates(key: &p256::PublicKey) -> Result<(Vec<u8>, Vec<u8>), CoseError> {
    let point = key.to_encoded_point(false);
    let x = point.x().ok_or_else(|| invalid("point at infinity"))?;
    let y = point.y().ok_or_else(|| invalid("point at infinity"))?;
    Ok((x.to_vec(), y.to_vec()))
}

fn ec2_public_from_map(map: &[(Value, Value)]) -> Result<p256::PublicKey, CoseError> {
    if let Some(crv) = cbor::get(map, LABEL_CRV).and_then(cbor::as_int) {
        if crv != CRV_P256 {
            return Err(CoseError::InvalidKey(format!("unsupported curve {crv}")));
        }
    }
    let x = field_element(map, LABEL_X)?;
    let y = field_element(map, LABEL_Y)?;
    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );
    Option::from(p256::PublicKey::from_encoded_point(&point))
        .ok_or_else(|| invalid("point is not on P-256"))
}

fn rsa_public_entries(key: &RsaPublicKey, alg: i64) -> Vec<(Value, Value)> {
    vec![
        (cbor::int(LABEL_KTY), cbor::int(KTY_RSA)),
        (cbor::int(LABEL_ALG), cbor::int(alg)),
        (cbor::int(LABEL_N), Value::Bytes(key.n().to_bytes_be())),
        (cbor::int(LABEL_E), Value::Bytes(key.e().to_bytes_be())),
    ]
}

/// A credential private key.
#[derive(Clone, PartialEq, Eq)]
pub enum PrivateKey {
    Es256(p256::SecretKey),
    Ed25519(ed25519_dalek::SigningKey),
    Ps256(Box<RsaPrivateKey>),
    Rs256(Box<RsaPrivateKey>),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrivateKey").field(&self.algorithm()).finish()
    }
}

impl PrivateKey {
    pub fn generate_es256() -> Self {
        Self::Es256(p256::SecretKey::random(&mut rand::rngs::OsRng))
    }

    pub fn generate_ed25519() -> Self {
        Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng))
    }

    pub fn algorithm(&self) -> i64 {
        match self {
            Self::Es256(_) => ALG_ES256,
            Self::Ed25519(_) => ALG_EDDSA,
            Self::Ps256(_) => ALG_PS256,
            Self::Rs256(_) => ALG_RS256,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::Es256(key) => PublicKey::Es256(key.public_key()),
            Self::Ed25519(key) => PublicKey::Ed25519(key.verifying_key()),
            Self::Ps256(key) => PublicKey::Ps256(key.to_public_key()),
            Self::Rs256(key) => PublicKey::Rs256(key.to_public_key()),
        }
    }

    /// ES256 signatures are ASN.1 DER encoded; the others are raw.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CoseError> {
        match self {
            Self::Es256(key) => {
                let signer = p256::ecdsa::SigningKey::from(key);
                let sig: p256::ecdsa::Signature =
                    p256::ecdsa::signature::Signer::try_sign(&signer, data).map_err(signing)?;
                Ok(sig.to_der().as_bytes().to_vec())
            }
            Self::Ed25519(key) => {
                let sig = ed25519_dalek::Signer::try_sign(key, data)
                    .map_err(signing)?;
                Ok(sig.to_bytes().to_vec())
            }
            Self::Ps256(key) => {
                let signer = rsa::pss::BlindedSigningKey::<Sha256>::new((**key).clone());
                let sig = rsa::signature::RandomizedSigner::try_sign_with_rng(
                    &signer,
                    &mut rand::thread_rng(),
                    data,
                )
                .map_err(signing)?;
                Ok(rsa::signature::SignatureEncoding::to_vec(&sig))
            }
            Self::Rs256(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new((**key).clone());
                let sig = rsa::signature::Signer::try_sign(&signer, data).map_err(signing)?;
                Ok(rsa::signature::SignatureEncoding::to_vec(&sig))
            }
        }
    }

    pub fn to_cose_value(&self) -> Result<Value, CoseError> {
        let entries = match self {
            Self::Es256(key) => {
                let (x, y) = ec2_coordinates(&key.public_key())?;
                vec![
                    (cbor::int(LABEL_KTY), cbor::int(KTY_EC2)),
                    (cbor::int(LABEL_ALG), cbor::int(ALG_ES256)),
                    (cbor::int(LABEL_CRV), cbor::int(CRV_P256)),
                    (cbor::int(LABEL_X), Value::Bytes(x)),
                    (cbor::int(LABEL_Y), Value::Bytes(y)),
                    (cbor::int(LABEL_D), Value::Bytes(key.to_bytes().to_vec())),
                ]
            }
            Self::Ed25519(key) => vec![
                (cbor::int(LABEL_KTY), cbor::int(KTY_OKP)),
                (cbor::int(LABEL_ALG), cbor::int(ALG_EDDSA)),
                (cbor::int(LABEL_CRV), cbor::int(CRV_ED25519)),
                (
                    cbor::int(LABEL_X),
                    Value::Bytes(key.verifying_key().to_bytes().to_vec()),
                ),
                (cbor::int(LABEL_D), Value::Bytes(key.to_bytes().to_vec())),
            ],
            Self::Ps256(key) | Self::Rs256(key) => {
                let mut entries = rsa_public_entries(&key.to_public_key(), self.algorithm());
                entries.push((cbor::int(LABEL_RSA_D), Value::Bytes(key.d().to_bytes_be())));
                let primes = key.primes();
                if primes.len() != 2 {
                    return Err(CoseError::InvalidKey(format!(
                        "{} RSA primes, expected 2",
                        primes.len()
                    )));
                }
                entries.push((cbor::int(LABEL_P), Value::Bytes(primes[0].to_bytes_be())));
                entries.push((cbor::int(LABEL_Q), Value::Bytes(primes[1].to_bytes_be())));
                if let (Some(dp), Some(dq), Some(qinv)) = (key.dp(), key.dq(), key.qinv()) {
                    entries.push((cbor::int(LABEL_DP), Value::Bytes(dp.to_bytes_be())));
                    entries.push((cbor::int(LABEL_DQ), Value::Bytes(dq.to_bytes_be())));
                    entries.push((cbor::int(LABEL_QINV), Value::Bytes(qinv.to_bytes_be().1)));
                }
                entries
            }
        };
        Ok(cbor::canonical_map(entries))
    }

    pub fn to_cose(&self) -> Result<Vec<u8>, CoseError> {
        Ok(cbor::encode(&self.to_cose_value()?)?)
    }

    pub fn from_cose(data: &[u8]) -> Result<Self, CoseError> {
        let map = cbor::decode_map(data)?;
        let alg = int_field(&map, LABEL_ALG)?;
        match alg {
            ALG_ES256 => {
                expect_kty(&map, alg, KTY_EC2)?;
                let d = field_element(&map, LABEL_D)?;
                let key = p256::SecretKey::from_bytes(p256::FieldBytes::from_slice(&d))
                    .map_err(invalid)?;
                Ok(Self::Es256(key))
            }
            ALG_EDDSA => {
                expect_kty(&map, alg, KTY_OKP)?;
                let seed = field_element(&map, LABEL_D)?;
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
            }
            ALG_PS256 | ALG_RS256 => {
                expect_kty(&map, alg, KTY_RSA)?;
                let mut key = RsaPrivateKey::from_components(
                    biguint_field(&map, LABEL_N)?,
                    biguint_field(&map, LABEL_E)?,
                    biguint_field(&map, LABEL_RSA_D)?,
                    vec![biguint_field(&map, LABEL_P)?, biguint_field(&map, LABEL_Q)?],
                )
                .map_err(invalid)?;
                key.precompute().map_err(invalid)?;
                if alg == ALG_PS256 {
                    Ok(Self::Ps256(Box::new(key)))
                } else {
                    Ok(Self::Rs256(Box::new(key)))
                }
            }
            other => Err(CoseError::UnsupportedAlgorithm(other)),
        }
    }

    /// Pre-COSE vaults stored P-256 keys as SEC1 or PKCS#8 DER.
    pub fn from_legacy_der(der: &[u8]) -> Result<Self, CoseError> {
        p256::SecretKey::from_sec1_der(der)
            .or_else(|_| p256::SecretKey::from_pkcs8_der(der))
            .map(Self::Es256)
            .map_err(invalid)
    }

    /// Tries COSE first, then the legacy DER encodings.
    pub fn from_stored(data: &[u8]) -> Result<Self, CoseError> {
        Self::from_cose(data).or_else(|cose_err| {
            Self::from_legacy_der(data).map_err(|_| cose_err)
        })
    }

    /// SEC1 `ECPrivateKey` DER, only defined for ES256 keys.
    pub fn to_sec1_der(&self) -> Result<Vec<u8>, CoseError> {
        match self {
            Self::Es256(key) => Ok(key.to_sec1_der().map_err(invalid)?.to_vec()),
            other => Err(CoseError::UnsupportedAlgorithm(other.algorithm())),
        }
    }
}

/// A credential public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    Es256(p256::PublicKey),
    Ed25519(ed25519_dalek::VerifyingKey),
    Ps256(RsaPublicKey),
    Rs256(RsaPublicKey),
}

impl PublicKey {
    pub fn algorithm(&self) -> i64 {
        match self {
            Self::Es256(_) => ALG_ES256,
            Self::Ed25519(_) => ALG_EDDSA,
            Self::Ps256(_) => ALG_PS256,
            Self::Rs256(_) => ALG_RS256,
        }
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match self {
            Self::Es256(key) => {
                let Ok(sig) = p256::ecdsa::Signature::from_der(signature) else {
                    return false;
                };
                let verifier = p256::ecdsa::VerifyingKey::from(key);
                p256::ecdsa::signature::Verifier::verify(&verifier, data, &sig).is_ok()
            }
            Self::Ed25519(key) => {
                let Ok(sig) = ed25519_dalek::Signature::from_slice(signature) else {
                    return false;
                };
                ed25519_dalek::Verifier::verify(key, data, &sig).is_ok()
            }
            Self::Ps256(key) => {
                let Ok(sig) = rsa::pss::Signature::try_from(signature) else {
                    return false;
                };
                let verifier = rsa::pss::VerifyingKey::<Sha256>::new(key.clone());
                rsa::signature::Verifier::verify(&verifier, data, &sig).is_ok()
            }
            Self::Rs256(key) => {
                let Ok(sig) = rsa::pkcs1v15::Signature::try_from(signature) else {
                    return false;
                };
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                rsa::signature::Verifier::verify(&verifier, data, &sig).is_ok()
            }
        }
    }

    pub fn to_cose_value(&self) -> Result<Value, CoseError> {
        let entries = match self {
            Self::Es256(key) => {
                let (x, y) = ec2_coordinates(key)?;
                vec![
                    (cbor::int(LABEL_KTY), cbor::int(KTY_EC2)),
                    (cbor::int(LABEL_ALG), cbor::int(ALG_ES256)),
                    (cbor::int(LABEL_CRV), cbor::int(CRV_P256)),
                    (cbor::int(LABEL_X), Value::Bytes(x)),
                    (cbor::int(LABEL_Y), Value::Bytes(y)),
                ]
            }
            Self::Ed25519(key) => vec![
                (cbor::int(LABEL_KTY), cbor::int(KTY_OKP)),
                (cbor::int(LABEL_ALG), cbor::int(ALG_EDDSA)),
                (cbor::int(LABEL_CRV), cbor::int(CRV_ED25519)),
                (cbor::int(LABEL_X), Value::Bytes(key.to_bytes().to_vec())),
            ],
            Self::Ps256(key) | Self::Rs256(key) => rsa_public_entries(key, self.algorithm()),
        };
        Ok(cbor::canonical_map(entries))
    }

    pub fn to_cose(&self) -> Result<Vec<u8>, CoseError> {
        Ok(cbor::encode(&self.to_cose_value()?)?)
    }

    pub fn from_cose(data: &[u8]) -> Result<Self, CoseError> {
        let map = cbor::decode_map(data)?;
        let alg = int_field(&map, LABEL_ALG)?;
        match alg {
            ALG_ES256 => {
                expect_kty(&map, alg, KTY_EC2)?;
                Ok(Self::Es256(ec2_public_from_map(&map)?))
            }
            ALG_EDDSA => {
                expect_kty(&map, alg, KTY_OKP)?;
                let x = field_element(&map, LABEL_X)?;
                Ok(Self::Ed25519(
                    ed25519_dalek::VerifyingKey::from_bytes(&x).map_err(invalid)?,
                ))
            }
            ALG_PS256 | ALG_RS256 => {
                expect_kty(&map, alg, KTY_RSA)?;
                let key = RsaPublicKey::new(
                    biguint_field(&map, LABEL_N)?,
                    biguint_field(&map, LABEL_E)?,
                )
                .map_err(invalid)?;
                if alg == ALG_PS256 {
                    Ok(Self::Ps256(key))
                } else {
                    Ok(Self::Rs256(key))
                }
            }
            other => Err(CoseError::UnsupportedAlgorithm(other)),
        }
    }

    /// SubjectPublicKeyInfo DER, as embedded in attestation certificates.
    pub fn to_spki_der(&self) -> Result<Vec<u8>, CoseError> {
        let document = match self {
            Self::Es256(key) => key.to_public_key_der(),
            Self::Ed25519(key) => key.to_public_key_der(),
            Self::Ps256(key) | Self::Rs256(key) => key.to_public_key_der(),
        }
        .map_err(invalid)?;
        Ok(document.as_bytes().to_vec())
    }

    /// 65-byte uncompressed SEC1 point, only defined for ES256 keys.
    pub fn to_sec1_uncompressed(&self) -> Result<Vec<u8>, CoseError> {
        match self {
            Self::Es256(key) => Ok(key.to_encoded_point(false).as_bytes().to_vec()),
            other => Err(CoseError::UnsupportedAlgorithm(other.algorithm())),
        }
    }
}

/// The authenticator's PIN key-agreement key: EC2, P-256, alg ECDH-ES+HKDF-256.
pub fn encode_key_agreement(key: &p256::PublicKey) -> Result<Value, CoseError> {
    let (x, y) = ec2_coordinates(key)?;
    Ok(cbor::canonical_map(vec![
        (cbor::int(LABEL_KTY), cbor::int(KTY_EC2)),
        (cbor::int(LABEL_ALG), cbor::int(ALG_ECDH_ES_HKDF_256)),
        (cbor::int(LABEL_CRV), cbor::int(CRV_P256)),
        (cbor::int(LABEL_X), Value::Bytes(x)),
        (cbor::int(LABEL_Y), Value::Bytes(y)),
    ]))
}

pub fn decode_key_agreement(value: &Value) -> Result<p256::PublicKey, CoseError> {
    let map = cbor::as_map(value).ok_or(CborError::NotAMap)?;
    let kty = int_field(map, LABEL_KTY)?;
    if kty != KTY_EC2 {
        return Err(CoseError::KeyTypeMismatch {
            kty,
            alg: ALG_ECDH_ES_HKDF_256,
        });
    }
    ec2_public_from_map(map)
}
