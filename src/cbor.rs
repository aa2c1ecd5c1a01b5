//! Accessors over `ciborium::value::Value` shared by the COSE, CTAP2 and U2F layers.

use ciborium::value::Value;

pub type CborMap = Vec<(Value, Value)>;

#[derive(Debug, thiserror::Error)]
pub enum CborError {
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("expected a map")]
    NotAMap,
}

pub fn int(i: i64) -> Value {
    Value::Integer(i.into())
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn encode(value: &Value) -> Result<Vec<u8>, CborError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::Encode(e.to_string()))?;
    Ok(buf)
}

pub fn decode(data: &[u8]) -> Result<Value, CborError> {
    ciborium::from_reader(data).map_err(|e| CborError::Decode(e.to_string()))
}

pub fn decode_map(data: &[u8]) -> Result<CborMap, CborError> {
    match decode(data)? {
        Value::Map(map) => Ok(map),
        _ => Err(CborError::NotAMap),
    }
}

/// Builds a map whose keys follow the CTAP2 canonical order: shorter encodings first,
/// then bytewise. Integers sort 0, 1, .., -1, -2, .. and text keys by length.
pub fn canonical_map(mut entries: CborMap) -> Value {
    entries.sort_by_cached_key(|(key, _)| {
        let encoded = encode(key).unwrap_or_default();
        (encoded.len(), encoded)
    });
    Value::Map(entries)
}

pub fn get(map: &[(Value, Value)], key: i64) -> Option<&Value> {
    map.iter()
        .find(|(k, _)| as_int(k) == Some(key))
        .map(|(_, v)| v)
}

pub fn get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(s) if s == key))
        .map(|(_, v)| v)
}

pub fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Integer(i) => i64::try_from(i128::from(*i)).ok(),
        _ => None,
    }
}

pub fn as_bytes(v: &Value) -> Option<&[u8]> {
    match v {
        Value::Bytes(b) => Some(b),
        _ => None,
    }
}

pub fn as_text(v: &Value) -> Option<&str> {
    match v {
        Value::Text(s) => Some(s),
        _ => None,
    }
}

pub fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

pub fn as_map(v: &Value) -> Option<&[(Value, Value)]> {
    match v {
        Value::Map(m) => Some(m),
        _ => None,
    }
}

pub fn as_array(v: &Value) -> Option<&[Value]> {
    match v {
        Value::Array(a) => Some(a),
        _ => None,
    }
}
