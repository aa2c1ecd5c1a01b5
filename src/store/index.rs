use super::credential::{CREDENTIAL_ID_LEN, PUBLIC_KEY_TYPE};
use super::{CredentialSource, RelyingParty, SavedCredentialSource, StoreError, User};
use crate::cose::PrivateKey;
use crate::crypto;

/// In-memory set of credential sources. Insertion order is preserved so
/// exports are stable and the oldest matching credential is found first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityVault {
    sources: Vec<CredentialSource>,
}

impl IdentityVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an ES256 credential with a fresh random id that no stored source uses.
    pub fn new_identity(&mut self, relying_party: RelyingParty, user: User) -> &CredentialSource {
        let id = loop {
            let candidate = crypto::random_bytes::<CREDENTIAL_ID_LEN>().to_vec();
            if self.get(&candidate).is_none() {
                break candidate;
            }
        };
        tracing::debug!(rp = %relying_party.id, id = %hex::encode(&id), "New identity");
        let index = self.sources.len();
        self.sources.push(CredentialSource {
            kind: PUBLIC_KEY_TYPE.to_string(),
            id,
            private_key: PrivateKey::generate_es256(),
            relying_party,
            user,
            signature_counter: 0,
        });
        &self.sources[index]
    }

    pub fn add(&mut self, source: CredentialSource) -> Result<(), StoreError> {
        if self.get(&source.id).is_some() {
            return Err(StoreError::Duplicate(source.id_hex()));
        }
        self.sources.push(source);
        Ok(())
    }

    /// Sources for `rp_id`; a non-empty `allow_list` further restricts them to the listed ids.
    pub fn matching(&self, rp_id: &str, allow_list: &[Vec<u8>]) -> Vec<&CredentialSource> {
        self.sources
            .iter()
            .filter(|s| s.relying_party.id == rp_id)
            .filter(|s| allow_list.is_empty() || allow_list.iter().any(|id| *id == s.id))
            .collect()
    }

    pub fn get(&self, id: &[u8]) -> Option<&CredentialSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn get_mut(&mut self, id: &[u8]) -> Option<&mut CredentialSource> {
        self.sources.iter_mut().find(|s| s.id == id)
    }

    pub fn delete(&mut self, id: &[u8]) -> bool {
        let before = self.sources.len();
        self.sources.retain(|s| s.id != id);
        self.sources.len() != before
    }

    pub fn sources(&self) -> &[CredentialSource] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn export(&self) -> Result<Vec<SavedCredentialSource>, StoreError> {
        self.sources.iter().map(CredentialSource::to_saved).collect()
    }

    pub fn import(saved: Vec<SavedCredentialSource>) -> Result<Self, StoreError> {
        let mut vault = Self::new();
        for source in saved {
            vault.add(CredentialSource::try_from(source)?)?;
        }
        Ok(vault)
    }
}
