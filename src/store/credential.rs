use serde::{Deserialize, Serialize};

use super::{b64, StoreError};
use crate::cose::PrivateKey;

pub const PUBLIC_KEY_TYPE: &str = "public-key";
pub const CREDENTIAL_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelyingParty {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "b64")]
    pub id: Vec<u8>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// A resident credential: key material plus the entities it was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSource {
    pub kind: String,
    pub id: Vec<u8>,
    pub private_key: PrivateKey,
    pub relying_party: RelyingParty,
    pub user: User,
    pub signature_counter: u32,
}

/// On-disk form of [`CredentialSource`], private key COSE-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedCredentialSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "b64")]
    pub id: Vec<u8>,
    #[serde(with = "b64")]
    pub private_key: Vec<u8>,
    pub relying_party: RelyingParty,
    pub user: User,
    #[serde(default)]
    pub signature_counter: u32,
}

impl CredentialSource {
    pub fn id_hex(&self) -> String {
        hex::encode(&self.id)
    }

    pub fn to_saved(&self) -> Result<SavedCredentialSource, StoreError> {
        Ok(SavedCredentialSource {
            kind: self.kind.clone(),
            id: self.id.clone(),
            private_key: self.private_key.to_cose()?,
            relying_party: self.relying_party.clone(),
            user: self.user.clone(),
            signature_counter: self.signature_counter,
        })
    }
}

impl TryFrom<SavedCredentialSource> for CredentialSource {
    type Error = StoreError;

    fn try_from(saved: SavedCredentialSource) -> Result<Self, Self::Error> {
        let private_key = PrivateKey::from_stored(&saved.private_key)?;
        Ok(Self {
            kind: saved.kind,
            id: saved.id,
            private_key,
            relying_party: saved.relying_party,
            user: saved.user,
            signature_counter: saved.signature_counter,
        })
    }
}
