pub mod certificate;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ciborium::value::Value;
use hmac::{Hmac, Mac};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::cbor;

pub use certificate::{create_attestation_certificate, create_self_signed_ca};

pub const NONCE_SIZE: usize = 12;
pub const AES_BLOCK_SIZE: usize = 16;
pub const SYMMETRIC_KEY_SIZE: usize = 32;

// scrypt N = 2^15, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    KeyLength,
    #[error("invalid nonce length: {0}")]
    NonceLength(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("authenticated decryption failed")]
    Decrypt,
    #[error("data length {0} is not a multiple of the AES block size")]
    BlockLength(usize),
    #[error("key derivation: {0}")]
    Kdf(String),
    #[error("encrypted box: {0}")]
    Encoding(String),
    #[error("certificate: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),
    #[error("key conversion: {0}")]
    KeyConversion(String),
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::thread_rng().fill_bytes(&mut out);
    out
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// AES-256-GCM under a fresh random 12-byte nonce.
pub fn encrypt(key: &[u8], data: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let nonce_bytes: [u8; NONCE_SIZE] = random_bytes();
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), data)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((ciphertext, nonce_bytes))
}

pub fn decrypt(key: &[u8], data: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::NonceLength(nonce.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), data)
        .map_err(|_| CryptoError::Decrypt)
}

/// Ciphertext plus nonce, serialized as the CBOR map `{1: data, 2: iv}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBox {
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
}

impl EncryptedBox {
    pub fn to_cbor(&self) -> Result<Vec<u8>, CryptoError> {
        let value = Value::Map(vec![
            (cbor::int(1), Value::Bytes(self.data.clone())),
            (cbor::int(2), Value::Bytes(self.iv.clone())),
        ]);
        cbor::encode(&value).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, CryptoError> {
        let map = cbor::decode_map(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let data = cbor::get(&map, 1)
            .and_then(cbor::as_bytes)
            .ok_or_else(|| CryptoError::Encoding("missing data".into()))?;
        let iv = cbor::get(&map, 2)
            .and_then(cbor::as_bytes)
            .ok_or_else(|| CryptoError::Encoding("missing iv".into()))?;
        Ok(Self {
            data: data.to_vec(),
            iv: iv.to_vec(),
        })
    }
}

pub fn seal(key: &[u8], data: &[u8]) -> Result<EncryptedBox, CryptoError> {
    let (data, iv) = encrypt(key, data)?;
    Ok(EncryptedBox {
        data,
        iv: iv.to_vec(),
    })
}

pub fn open(key: &[u8], sealed: &EncryptedBox) -> Result<Vec<u8>, CryptoError> {
    decrypt(key, &sealed.data, &sealed.iv)
}

/// AES-256-CBC with an all-zero IV and no padding, as PIN protocol 1 requires.
pub fn encrypt_aes_cbc(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockLength(data.len()));
    }
    let encryptor = Aes256CbcEnc::new_from_slices(key, &[0u8; AES_BLOCK_SIZE])
        .map_err(|_| CryptoError::KeyLength)?;
    let mut buf = data.to_vec();
    encryptor
        .encrypt_padded_mut::<NoPadding>(&mut buf, data.len())
        .map_err(|_| CryptoError::BlockLength(data.len()))?;
    Ok(buf)
}

pub fn decrypt_aes_cbc(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockLength(data.len()));
    }
    let decryptor = Aes256CbcDec::new_from_slices(key, &[0u8; AES_BLOCK_SIZE])
        .map_err(|_| CryptoError::KeyLength)?;
    let mut buf = data.to_vec();
    decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CryptoError::BlockLength(data.len()))?;
    Ok(buf)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| CryptoError::KeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time check that `tag` is a non-empty prefix of HMAC-SHA256(key, data).
pub fn verify_hmac_prefix(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_truncated_left(tag).is_ok()
}

/// scrypt(N=32768, r=8, p=1) stretched to a 32-byte key.
pub fn derive_passphrase_key(
    passphrase: &str,
    salt: &[u8],
) -> Result<[u8; SYMMETRIC_KEY_SIZE], CryptoError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SYMMETRIC_KEY_SIZE)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let mut out = [0u8; SYMMETRIC_KEY_SIZE];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}

/// P-256 key pair used for the PIN protocol key agreement.
#[derive(Clone)]
pub struct EcdhKey {
    secret: p256::SecretKey,
}

impl EcdhKey {
    pub fn generate() -> Self {
        Self {
            secret: p256::SecretKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn public_key(&self) -> p256::PublicKey {
        self.secret.public_key()
    }

    /// SHA-256 over the x-coordinate of the shared point.
    pub fn shared_secret(&self, peer: &p256::PublicKey) -> [u8; 32] {
        let shared =
            p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        sha256(shared.raw_secret_bytes())
    }
}

impl std::fmt::Debug for EcdhKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let point = self.public_key().to_encoded_point(true);
        f.debug_struct("EcdhKey")
            .field("public", &hex::encode(point.as_bytes()))
            .finish_non_exhaustive()
    }
}
