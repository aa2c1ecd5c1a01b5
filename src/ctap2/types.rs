use ciborium::value::Value;

use crate::cbor::{self, as_array, as_bool, as_bytes, as_int, as_map, as_text, get, get_str, CborError};
use crate::cose::{CoseError, ALG_ES256};
use crate::crypto::CryptoError;
use crate::store::credential::PUBLIC_KEY_TYPE;
use crate::store::{RelyingParty, StoreError, User};

pub const CMD_MAKE_CREDENTIAL: u8 = 0x01;
pub const CMD_GET_ASSERTION: u8 = 0x02;
pub const CMD_GET_INFO: u8 = 0x04;
pub const CMD_CLIENT_PIN: u8 = 0x06;
pub const CMD_RESET: u8 = 0x07;
pub const CMD_GET_NEXT_ASSERTION: u8 = 0x08;

pub const STATUS_SUCCESS: u8 = 0x00;

pub const PIN_PROTOCOL_V1: i64 = 1;
pub const PIN_AUTH_LEN: usize = 16;

pub const PIN_SUBCMD_GET_RETRIES: i64 = 1;
pub const PIN_SUBCMD_GET_KEY_AGREEMENT: i64 = 2;
pub const PIN_SUBCMD_SET_PIN: i64 = 3;
pub const PIN_SUBCMD_CHANGE_PIN: i64 = 4;
pub const PIN_SUBCMD_GET_PIN_TOKEN: i64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum Ctap2Error {
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid cbor: {0}")]
    InvalidCbor(String),
    #[error("missing parameter")]
    MissingParameter,
    #[error("credential excluded")]
    CredentialExcluded,
    #[error("unsupported algorithm")]
    UnsupportedAlgorithm,
    #[error("operation denied")]
    OperationDenied,
    #[error("keepalive cancel")]
    KeepaliveCancel,
    #[error("no credentials")]
    NoCredentials,
    #[error("pin invalid")]
    PinInvalid,
    #[error("pin blocked")]
    PinBlocked,
    #[error("pin auth invalid")]
    PinAuthInvalid,
    #[error("no pin set")]
    NoPinSet,
    #[error("pin required")]
    PinRequired,
    #[error("pin policy violation")]
    PinPolicyViolation,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("cose: {0}")]
    Cose(#[from] CoseError),
    #[error("encoding: {0}")]
    Encoding(String),
}

impl Ctap2Error {
    pub fn status_byte(&self) -> u8 {
        match self {
            Self::InvalidCommand => 0x01,
            Self::InvalidParameter => 0x02,
            Self::InvalidLength => 0x03,
            Self::InvalidCbor(_) => 0x12,
            Self::MissingParameter => 0x14,
            Self::CredentialExcluded => 0x19,
            Self::UnsupportedAlgorithm => 0x26,
            Self::OperationDenied => 0x27,
            Self::KeepaliveCancel => 0x2D,
            Self::NoCredentials => 0x2E,
            Self::PinInvalid => 0x31,
            Self::PinBlocked => 0x32,
            Self::PinAuthInvalid => 0x33,
            Self::NoPinSet => 0x35,
            Self::PinRequired => 0x36,
            Self::PinPolicyViolation => 0x37,
            Self::Store(_) | Self::Crypto(_) | Self::Cose(_) | Self::Encoding(_) => 0x7F,
        }
    }
}

impl From<CborError> for Ctap2Error {
    fn from(e: CborError) -> Self {
        match e {
            CborError::Encode(msg) => Self::Encoding(msg),
            other => Self::InvalidCbor(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct MakeCredentialRequest {
    pub client_data_hash: Vec<u8>,
    pub relying_party: RelyingParty,
    pub user: User,
    pub alg_ok: bool, // an entry {alg: -7, type: "public-key"} is present
    pub exclude_list: Vec<Vec<u8>>,
    pub pin_auth: Option<Vec<u8>>,
    pub pin_protocol: Option<i64>,
}

#[derive(Debug)]
pub struct GetAssertionRequest {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    pub allow_list: Vec<Vec<u8>>,
    pub user_presence: bool,
    pub pin_auth: Option<Vec<u8>>,
    pub pin_protocol: Option<i64>,
}

/// Fields are validated by the sub-command that needs them.
#[derive(Debug)]
pub struct ClientPinRequest {
    pub pin_protocol: Option<i64>,
    pub sub_command: Option<i64>,
    pub key_agreement: Option<Value>,
    pub pin_auth: Option<Vec<u8>>,
    pub new_pin_enc: Option<Vec<u8>>,
    pub pin_hash_enc: Option<Vec<u8>>,
}

fn required_bytes(map: &[(Value, Value)], key: i64) -> Result<Vec<u8>, Ctap2Error> {
    get(map, key)
        .and_then(as_bytes)
        .map(<[u8]>::to_vec)
        .ok_or(Ctap2Error::MissingParameter)
}

fn optional_text(map: &[(Value, Value)], key: &str) -> String {
    get_str(map, key)
        .and_then(as_text)
        .unwrap_or_default()
        .to_string()
}

/// Ids of a list of PublicKeyCredentialDescriptors; malformed entries are skipped.
fn descriptor_ids(value: Option<&Value>) -> Vec<Vec<u8>> {
    value.and_then(as_array).map_or(vec![], |arr| {
        arr.iter()
            .filter_map(|item| {
                let m = as_map(item)?;
                let id = get_str(m, "id").and_then(as_bytes)?;
                Some(id.to_vec())
            })
            .collect()
    })
}

impl TryFrom<&[u8]> for MakeCredentialRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = cbor::decode_map(data)?;

        // 1: clientDataHash
        let client_data_hash = required_bytes(&map, 1)?;

        // 2: rp
        let rp_map = get(&map, 2)
            .and_then(as_map)
            .ok_or(Ctap2Error::MissingParameter)?;
        let rp_id = get_str(rp_map, "id")
            .and_then(as_text)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_string();
        let relying_party = RelyingParty {
            id: rp_id,
            name: optional_text(rp_map, "name"),
        };

        // 3: user
        let user_map = get(&map, 3)
            .and_then(as_map)
            .ok_or(Ctap2Error::MissingParameter)?;
        let user_id = get_str(user_map, "id")
            .and_then(as_bytes)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_vec();
        let user = User {
            id: user_id,
            name: optional_text(user_map, "name"),
            display_name: optional_text(user_map, "displayName"),
        };

        // 4: pubKeyCredParams
        let alg_ok = get(&map, 4).and_then(as_array).is_some_and(|arr| {
            arr.iter().filter_map(as_map).any(|m| {
                get_str(m, "alg").and_then(as_int) == Some(ALG_ES256)
                    && get_str(m, "type").and_then(as_text) == Some(PUBLIC_KEY_TYPE)
            })
        });

        // 5: excludeList
        let exclude_list = descriptor_ids(get(&map, 5));

        // 8, 9: pinAuth, pinProtocol
        let pin_auth = get(&map, 8).and_then(as_bytes).map(<[u8]>::to_vec);
        let pin_protocol = get(&map, 9).and_then(as_int);

        Ok(MakeCredentialRequest {
            client_data_hash,
            relying_party,
            user,
            alg_ok,
            exclude_list,
            pin_auth,
            pin_protocol,
        })
    }
}

impl TryFrom<&[u8]> for GetAssertionRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = cbor::decode_map(data)?;

        // 1: rpId
        let rp_id = get(&map, 1)
            .and_then(as_text)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_string();

        // 2: clientDataHash
        let client_data_hash = required_bytes(&map, 2)?;

        // 3: allowList (optional)
        let allow_list = descriptor_ids(get(&map, 3));

        // 5: options.up defaults to true
        let user_presence = get(&map, 5)
            .and_then(as_map)
            .and_then(|m| get_str(m, "up"))
            .and_then(as_bool)
            .unwrap_or(true);

        let pin_auth = get(&map, 6).and_then(as_bytes).map(<[u8]>::to_vec);
        let pin_protocol = get(&map, 7).and_then(as_int);

        Ok(GetAssertionRequest {
            rp_id,
            client_data_hash,
            allow_list,
            user_presence,
            pin_auth,
            pin_protocol,
        })
    }
}

impl TryFrom<&[u8]> for ClientPinRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = cbor::decode_map(data)?;
        Ok(ClientPinRequest {
            pin_protocol: get(&map, 1).and_then(as_int),
            sub_command: get(&map, 2).and_then(as_int),
            key_agreement: get(&map, 3).cloned(),
            pin_auth: get(&map, 4).and_then(as_bytes).map(<[u8]>::to_vec),
            new_pin_enc: get(&map, 5).and_then(as_bytes).map(<[u8]>::to_vec),
            pin_hash_enc: get(&map, 6).and_then(as_bytes).map(<[u8]>::to_vec),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- helpers ----

    fn bv(b: &[u8]) -> Value { Value::Bytes(b.to_vec()) }
    fn tv(s: &str)  -> Value { Value::Text(s.to_string()) }
    fn iv(i: i64)   -> Value { Value::Integer(i.into()) }
    fn mv(v: Vec<(Value, Value)>) -> Value { Value::Map(v) }
    fn av(v: Vec<Value>)          -> Value { Value::Array(v) }

    fn encode(v: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(&v, &mut buf).unwrap();
        buf
    }

    fn es256_param() -> Value {
        mv(vec![(tv("alg"), iv(-7)), (tv("type"), tv("public-key"))])
    }

    /// Minimal valid MakeCredential body with all required fields.
    fn make_cred_minimal() -> Vec<u8> {
        encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),                                      // clientDataHash
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),             // rp
            (iv(3), mv(vec![(tv("id"), bv(b"user1"))])),                  // user
            (iv(4), av(vec![es256_param()])),                             // pubKeyCredParams
        ]))
    }

    /// Minimal valid GetAssertion body.
    fn get_assertion_minimal() -> Vec<u8> {
        encode(mv(vec![
            (iv(1), tv("example.com")),   // rpId
            (iv(2), bv(&[0u8; 32])),      // clientDataHash
        ]))
    }

    // ---- MakeCredentialRequest parsing ----

    #[test]
    fn test_make_cred_minimal_valid() {
        let req = MakeCredentialRequest::try_from(make_cred_minimal().as_slice()).unwrap();
        assert_eq!(req.relying_party.id, "example.com");
        assert_eq!(req.relying_party.name, "");
        assert_eq!(req.client_data_hash, vec![0u8; 32]);
        assert_eq!(req.user.id, b"user1");
        assert!(req.alg_ok);
        assert!(req.exclude_list.is_empty());
        assert!(req.pin_auth.is_none());
    }

    #[test]
    fn test_make_cred_entity_names() {
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("id"), tv("example.com")), (tv("name"), tv("Example"))])),
            (iv(3), mv(vec![
                (tv("id"), bv(b"u")),
                (tv("name"), tv("alice")),
                (tv("displayName"), tv("Alice")),
            ])),
            (iv(4), av(vec![es256_param()])),
        ]));
        let req = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap();
        assert_eq!(req.relying_party.name, "Example");
        assert_eq!(req.user.name, "alice");
        assert_eq!(req.user.display_name, "Alice");
    }

    #[test]
    fn test_make_cred_missing_client_data_hash() {
        let cbor = encode(mv(vec![
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),
            (iv(3), mv(vec![(tv("id"), bv(b"u"))])),
        ]));
        let err = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::MissingParameter));
    }

    #[test]
    fn test_make_cred_rp_missing_id_field() {
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("name"), tv("Example"))])),   // no "id"
            (iv(3), mv(vec![(tv("id"), bv(b"u"))])),
        ]));
        let err = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::MissingParameter));
    }

    #[test]
    fn test_make_cred_missing_user() {
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),
        ]));
        let err = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::MissingParameter));
    }

    #[test]
    fn test_make_cred_alg_ok_false_when_only_rs256() {
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),
            (iv(3), mv(vec![(tv("id"), bv(b"u"))])),
            (iv(4), av(vec![mv(vec![
                (tv("alg"), iv(-257)),
                (tv("type"), tv("public-key")),
            ])])),
        ]));
        let req = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap();
        assert!(!req.alg_ok, "alg_ok must be false when ES256 is absent");
    }

    #[test]
    fn test_make_cred_alg_requires_public_key_type() {
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),
            (iv(3), mv(vec![(tv("id"), bv(b"u"))])),
            (iv(4), av(vec![mv(vec![(tv("alg"), iv(-7))])])),
        ]));
        let req = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap();
        assert!(!req.alg_ok);
    }

    #[test]
    fn test_make_cred_exclude_list_and_pin_fields() {
        let cred_id = vec![0xAAu8; 16];
        let cbor = encode(mv(vec![
            (iv(1), bv(&[0u8; 32])),
            (iv(2), mv(vec![(tv("id"), tv("example.com"))])),
            (iv(3), mv(vec![(tv("id"), bv(b"u"))])),
            (iv(4), av(vec![es256_param()])),
            (iv(5), av(vec![mv(vec![
                (tv("type"), tv("public-key")),
                (tv("id"), bv(&cred_id)),
            ])])),
            (iv(8), bv(&[0x55; 16])),
            (iv(9), iv(1)),
        ]));
        let req = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap();
        assert_eq!(req.exclude_list, vec![cred_id]);
        assert_eq!(req.pin_auth.as_deref(), Some(&[0x55; 16][..]));
        assert_eq!(req.pin_protocol, Some(1));
    }

    #[test]
    fn test_make_cred_malformed_cbor() {
        let err = MakeCredentialRequest::try_from(b"\xff\xff".as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::InvalidCbor(_)));
        assert_eq!(err.status_byte(), 0x12);
    }

    #[test]
    fn test_make_cred_cbor_not_a_map() {
        let cbor = encode(av(vec![iv(1), iv(2)]));
        let err = MakeCredentialRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::InvalidCbor(_)));
    }

    // ---- GetAssertionRequest parsing ----

    #[test]
    fn test_get_assertion_minimal_valid() {
        let req = GetAssertionRequest::try_from(get_assertion_minimal().as_slice()).unwrap();
        assert_eq!(req.rp_id, "example.com");
        assert_eq!(req.client_data_hash, vec![0u8; 32]);
        assert!(req.allow_list.is_empty());
        assert!(req.user_presence);
    }

    #[test]
    fn test_get_assertion_missing_rp_id() {
        let cbor = encode(mv(vec![(iv(2), bv(&[0u8; 32]))]));
        let err = GetAssertionRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::MissingParameter));
    }

    #[test]
    fn test_get_assertion_missing_client_data_hash() {
        let cbor = encode(mv(vec![(iv(1), tv("example.com"))]));
        let err = GetAssertionRequest::try_from(cbor.as_slice()).unwrap_err();
        assert!(matches!(err, Ctap2Error::MissingParameter));
    }

    #[test]
    fn test_get_assertion_allow_list_and_up_option() {
        let cred_id = vec![0x11u8; 16];
        let cbor = encode(mv(vec![
            (iv(1), tv("example.com")),
            (iv(2), bv(&[0u8; 32])),
            (iv(3), av(vec![mv(vec![
                (tv("type"), tv("public-key")),
                (tv("id"), bv(&cred_id)),
            ])])),
            (iv(5), mv(vec![(tv("up"), Value::Bool(false))])),
        ]));
        let req = GetAssertionRequest::try_from(cbor.as_slice()).unwrap();
        assert_eq!(req.allow_list, vec![cred_id]);
        assert!(!req.user_presence);
    }

    // ---- ClientPinRequest parsing ----

    #[test]
    fn test_client_pin_fields() {
        let cbor = encode(mv(vec![
            (iv(1), iv(1)),
            (iv(2), iv(5)),
            (iv(3), mv(vec![(iv(1), iv(2))])),
            (iv(6), bv(&[9; 16])),
        ]));
        let req = ClientPinRequest::try_from(cbor.as_slice()).unwrap();
        assert_eq!(req.pin_protocol, Some(1));
        assert_eq!(req.sub_command, Some(PIN_SUBCMD_GET_PIN_TOKEN));
        assert!(req.key_agreement.is_some());
        assert!(req.pin_auth.is_none());
        assert_eq!(req.pin_hash_enc, Some(vec![9; 16]));
    }

    // ---- Ctap2Error::status_byte ----

    #[test]
    fn test_status_byte_mapping() {
        assert_eq!(Ctap2Error::InvalidCommand.status_byte(),       0x01);
        assert_eq!(Ctap2Error::InvalidParameter.status_byte(),     0x02);
        assert_eq!(Ctap2Error::MissingParameter.status_byte(),     0x14);
        assert_eq!(Ctap2Error::CredentialExcluded.status_byte(),   0x19);
        assert_eq!(Ctap2Error::UnsupportedAlgorithm.status_byte(), 0x26);
        assert_eq!(Ctap2Error::OperationDenied.status_byte(),      0x27);
        assert_eq!(Ctap2Error::KeepaliveCancel.status_byte(),      0x2D);
        assert_eq!(Ctap2Error::NoCredentials.status_byte(),        0x2E);
        assert_eq!(Ctap2Error::PinInvalid.status_byte(),           0x31);
        assert_eq!(Ctap2Error::PinBlocked.status_byte(),           0x32);
        assert_eq!(Ctap2Error::PinAuthInvalid.status_byte(),       0x33);
        assert_eq!(Ctap2Error::NoPinSet.status_byte(),             0x35);
        assert_eq!(Ctap2Error::PinRequired.status_byte(),          0x36);
        assert_eq!(Ctap2Error::PinPolicyViolation.status_byte(),   0x37);
        assert_eq!(Ctap2Error::Encoding("x".into()).status_byte(), 0x7F);
    }
}
