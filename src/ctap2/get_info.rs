use ciborium::value::Value;

use super::types::{Ctap2Error, PIN_PROTOCOL_V1};
use super::{success, Ctap2Server};
use crate::cbor::{canonical_map, int, text};

pub const VERSION_FIDO_2_0: &str = "FIDO_2_0";
pub const VERSION_U2F_V2: &str = "U2F_V2";

/// `clientPin` and pinProtocols are only advertised while PIN support is on.
pub(crate) fn handle_get_info(server: &Ctap2Server) -> Result<Vec<u8>, Ctap2Error> {
    let mut options = vec![
        (text("plat"), Value::Bool(false)),
        (text("rk"), Value::Bool(true)),
        (text("up"), Value::Bool(true)),
    ];
    let supports_pin = server.pin.supports_pin();
    if supports_pin {
        options.push((text("clientPin"), Value::Bool(server.pin.pin_hash().is_some())));
    }

    let mut entries = vec![
        (
            int(1),
            Value::Array(vec![text(VERSION_FIDO_2_0), text(VERSION_U2F_V2)]),
        ),
        (int(3), Value::Bytes(crate::config::AAGUID.to_vec())),
        (int(4), canonical_map(options)),
    ];
    if supports_pin {
        entries.push((int(6), Value::Array(vec![int(PIN_PROTOCOL_V1)])));
    }
    success(&canonical_map(entries))
}
