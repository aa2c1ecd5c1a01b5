use ciborium::value::Value;

use crate::cbor::{canonical_map, int, text};

pub const FORMAT_PACKED: &str = "packed";

/// "packed" attestation object with a single-certificate x5c chain.
pub(crate) fn build_attestation_object(
    auth_data: &[u8],
    alg: i64,
    signature: &[u8],
    certificate: &[u8],
) -> Value {
    let statement = canonical_map(vec![
        (text("alg"), int(alg)),
        (text("sig"), Value::Bytes(signature.to_vec())),
        (
            text("x5c"),
            Value::Array(vec![Value::Bytes(certificate.to_vec())]),
        ),
    ]);
    canonical_map(vec![
        (int(1), text(FORMAT_PACKED)),
        (int(2), Value::Bytes(auth_data.to_vec())),
        (int(3), statement),
    ])
}
