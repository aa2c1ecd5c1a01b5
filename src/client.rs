//! Collaborator contracts the authenticators depend on, and `VirtualFidoClient`,
//! the single owner of persisted device state.

use std::io::{BufRead, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::PIN_RETRIES_MAX;
use crate::cose::PublicKey;
use crate::crypto::{self, EcdhKey};
use crate::store::device::PIN_HASH_LEN;
use crate::store::{CredentialSource, DeviceConfig, RelyingParty, StoreError, User};

pub const PIN_TOKEN_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    MakeCredential,
    GetAssertion,
    U2fRegister,
    U2fAuthenticate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalContext {
    pub relying_party: Option<String>,
    pub user_name: Option<String>,
}

/// Asks the user to allow an operation. May block.
pub trait Approver: Send + Sync {
    fn approve(&self, action: ClientAction, context: &ApprovalContext) -> bool;
}

/// Opaque persistence for the encrypted vault.
pub trait BlobStore: Send + Sync {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;
    fn save(&self, data: &[u8]) -> Result<(), StoreError>;
    fn passphrase(&self) -> &str;
}

pub trait CredentialCapability: Send + Sync {
    fn new_credential(&self, relying_party: RelyingParty, user: User)
        -> Result<CredentialSource, StoreError>;
    fn matching_credentials(&self, rp_id: &str, allow_list: &[Vec<u8>]) -> Vec<CredentialSource>;
    /// Bumps the counter of credential `id` and returns the new value.
    fn increment_signature_counter(&self, id: &[u8]) -> Result<u32, StoreError>;
    fn delete_credential(&self, id: &[u8]) -> Result<bool, StoreError>;
    fn credentials(&self) -> Vec<CredentialSource>;
}

pub trait AttestationCapability: Send + Sync {
    /// Certificate over `public_key`, issued by the device attestation CA.
    fn create_attestation_certificate(&self, public_key: &PublicKey)
        -> Result<Vec<u8>, StoreError>;
}

pub trait PinCapability: Send + Sync {
    fn supports_pin(&self) -> bool;
    fn pin_hash(&self) -> Option<[u8; PIN_HASH_LEN]>;
    fn set_pin_hash(&self, hash: [u8; PIN_HASH_LEN]) -> Result<(), StoreError>;
    fn pin_retries(&self) -> u8;
    fn set_pin_retries(&self, retries: u8);
    /// Takes one retry and returns how many are left, or None when none remain.
    fn consume_pin_retry(&self) -> Option<u8>;
    fn pin_token(&self) -> [u8; PIN_TOKEN_LEN];
    fn key_agreement_public(&self) -> p256::PublicKey;
    fn shared_secret(&self, platform_key: &p256::PublicKey) -> [u8; 32];
    /// Replaces the PIN token and the key-agreement key.
    fn rotate_pin_secrets(&self);
}

pub trait U2fCapability: Send + Sync {
    fn sealing_key(&self) -> [u8; crypto::SYMMETRIC_KEY_SIZE];
    /// Returns the current device counter and persists its successor.
    fn next_authentication_counter(&self) -> Result<u32, StoreError>;
}

/// Answers every request the same way.
#[derive(Debug, Clone, Copy)]
pub struct StaticApprover(pub bool);

impl Approver for StaticApprover {
    fn approve(&self, action: ClientAction, context: &ApprovalContext) -> bool {
        tracing::info!(?action, rp = ?context.relying_party, approved = self.0, "Auto-approval");
        self.0
    }
}

/// Prompts on the controlling terminal; `y` or `yes` approves.
#[derive(Debug, Default)]
pub struct TerminalApprover {
    prompt_lock: Mutex<()>,
}

impl TerminalApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn approval_prompt(action: ClientAction, context: &ApprovalContext) -> String {
    let site = context.relying_party.as_deref().unwrap_or("(unknown)");
    match action {
        ClientAction::MakeCredential => {
            format!("Register new passkey for {site}? [y/N] ")
        }
        ClientAction::GetAssertion => {
            let account = context.user_name.as_deref().unwrap_or("(unknown)");
            format!("Sign in to {site} as '{account}'? [y/N] ")
        }
        ClientAction::U2fRegister => "Register U2F key? [y/N] ".to_string(),
        ClientAction::U2fAuthenticate => "Authenticate with U2F key? [y/N] ".to_string(),
    }
}

impl Approver for TerminalApprover {
    fn approve(&self, action: ClientAction, context: &ApprovalContext) -> bool {
        let _serialized = self.prompt_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stdout = std::io::stdout().lock();
        if write!(stdout, "{}", approval_prompt(action, context))
            .and_then(|_| stdout.flush())
            .is_err()
        {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// In-memory PIN protocol state; regenerated every start.
struct PinState {
    retries: u8,
    token: [u8; PIN_TOKEN_LEN],
    key_agreement: EcdhKey,
}

impl PinState {
    fn new() -> Self {
        Self {
            retries: PIN_RETRIES_MAX,
            token: crypto::random_bytes(),
            key_agreement: EcdhKey::generate(),
        }
    }
}

struct ClientState {
    config: DeviceConfig,
    pin: PinState,
}

/// Owns the device configuration and vault; every mutation is written back
/// through the blob store before the call returns.
pub struct VirtualFidoClient {
    state: Mutex<ClientState>,
    blob_store: Box<dyn BlobStore>,
}

impl VirtualFidoClient {
    /// Decrypts the stored vault, or creates and saves a fresh one.
    pub fn load(blob_store: Box<dyn BlobStore>) -> Result<Self, StoreError> {
        let config = match blob_store.load()? {
            Some(blob) => DeviceConfig::decrypt(&blob, blob_store.passphrase())?,
            None => {
                tracing::info!("No vault found, creating a new device");
                let config = DeviceConfig::generate()?;
                blob_store.save(&config.encrypt(blob_store.passphrase())?)?;
                config
            }
        };
        tracing::info!(identities = config.vault.len(), "Vault loaded");
        Ok(Self {
            state: Mutex::new(ClientState {
                config,
                pin: PinState::new(),
            }),
            blob_store,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.blob_store
            .save(&config.encrypt(self.blob_store.passphrase())?)
    }

    pub fn identities(&self) -> Vec<CredentialSource> {
        self.credentials()
    }

    pub fn delete_identity(&self, id: &[u8]) -> Result<bool, StoreError> {
        self.delete_credential(id)
    }

    /// Disabling also forgets the stored PIN.
    pub fn set_pin_enabled(&self, enabled: bool) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.config.pin_enabled = enabled;
        if !enabled {
            state.config.pin_hash = None;
        }
        self.persist(&state.config)
    }

    pub fn set_pin(&self, pin: &str) -> Result<(), StoreError> {
        let digest = crypto::sha256(pin.as_bytes());
        let mut hash = [0u8; PIN_HASH_LEN];
        hash.copy_from_slice(&digest[..PIN_HASH_LEN]);
        self.set_pin_hash(hash)
    }

    pub fn pin_enabled(&self) -> bool {
        self.lock().config.pin_enabled
    }

    pub fn attestation_certificate(&self) -> Vec<u8> {
        self.lock().config.attestation_certificate.clone()
    }
}

impl CredentialCapability for VirtualFidoClient {
    fn new_credential(
        &self,
        relying_party: RelyingParty,
        user: User,
    ) -> Result<CredentialSource, StoreError> {
        let mut state = self.lock();
        let source = state.config.vault.new_identity(relying_party, user).clone();
        self.persist(&state.config)?;
        Ok(source)
    }

    fn matching_credentials(&self, rp_id: &str, allow_list: &[Vec<u8>]) -> Vec<CredentialSource> {
        self.lock()
            .config
            .vault
            .matching(rp_id, allow_list)
            .into_iter()
            .cloned()
            .collect()
    }

    fn increment_signature_counter(&self, id: &[u8]) -> Result<u32, StoreError> {
        let mut state = self.lock();
        let source = state.config.vault.get_mut(id).ok_or(StoreError::NotFound)?;
        source.signature_counter = source.signature_counter.wrapping_add(1);
        let counter = source.signature_counter;
        self.persist(&state.config)?;
        Ok(counter)
    }

    fn delete_credential(&self, id: &[u8]) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if !state.config.vault.delete(id) {
            return Ok(false);
        }
        self.persist(&state.config)?;
        Ok(true)
    }

    fn credentials(&self) -> Vec<CredentialSource> {
        self.lock().config.vault.sources().to_vec()
    }
}

impl AttestationCapability for VirtualFidoClient {
    fn create_attestation_certificate(
        &self,
        public_key: &PublicKey,
    ) -> Result<Vec<u8>, StoreError> {
        let spki = public_key.to_spki_der()?;
        let state = self.lock();
        Ok(crypto::create_attestation_certificate(
            &state.config.attestation_certificate,
            &state.config.attestation_private_key,
            &spki,
        )?)
    }
}

impl PinCapability for VirtualFidoClient {
    fn supports_pin(&self) -> bool {
        self.lock().config.pin_enabled
    }

    fn pin_hash(&self) -> Option<[u8; PIN_HASH_LEN]> {
        self.lock().config.pin_hash
    }

    fn set_pin_hash(&self, hash: [u8; PIN_HASH_LEN]) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.config.pin_hash = Some(hash);
        self.persist(&state.config)
    }

    fn pin_retries(&self) -> u8 {
        self.lock().pin.retries
    }

    fn set_pin_retries(&self, retries: u8) {
        self.lock().pin.retries = retries.min(PIN_RETRIES_MAX);
    }

    fn consume_pin_retry(&self) -> Option<u8> {
        let mut state = self.lock();
        state.pin.retries = state.pin.retries.checked_sub(1)?;
        Some(state.pin.retries)
    }

    fn pin_token(&self) -> [u8; PIN_TOKEN_LEN] {
        self.lock().pin.token
    }

    fn key_agreement_public(&self) -> p256::PublicKey {
        self.lock().pin.key_agreement.public_key()
    }

    fn shared_secret(&self, platform_key: &p256::PublicKey) -> [u8; 32] {
        self.lock().pin.key_agreement.shared_secret(platform_key)
    }

    fn rotate_pin_secrets(&self) {
        let mut state = self.lock();
        state.pin.token = crypto::random_bytes();
        state.pin.key_agreement = EcdhKey::generate();
        tracing::debug!("PIN token and key agreement key rotated");
    }
}

impl U2fCapability for VirtualFidoClient {
    fn sealing_key(&self) -> [u8; crypto::SYMMETRIC_KEY_SIZE] {
        self.lock().config.encryption_key
    }

    fn next_authentication_counter(&self) -> Result<u32, StoreError> {
        let mut state = self.lock();
        let counter = state.config.authentication_counter;
        state.config.authentication_counter = counter.wrapping_add(1);
        self.persist(&state.config)?;
        Ok(counter)
    }
}

/// Keeps the vault blob in memory. Useful for tests and ephemeral devices.
#[derive(Debug)]
pub struct MemoryBlobStore {
    blob: Mutex<Option<Vec<u8>>>,
    passphrase: String,
}

impl MemoryBlobStore {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(None),
            passphrase: passphrase.into(),
        }
    }

    pub fn with_blob(blob: Vec<u8>, passphrase: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob)),
            passphrase: passphrase.into(),
        }
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl BlobStore for MemoryBlobStore {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blob())
    }

    fn save(&self, data: &[u8]) -> Result<(), StoreError> {
        *self.blob.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.to_vec());
        Ok(())
    }

    fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

impl<T: BlobStore + ?Sized> BlobStore for std::sync::Arc<T> {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load()
    }

    fn save(&self, data: &[u8]) -> Result<(), StoreError> {
        (**self).save(data)
    }

    fn passphrase(&self) -> &str {
        (**self).passphrase()
    }
}
