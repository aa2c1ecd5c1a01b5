use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use super::U2fError;

pub const INS_REGISTER: u8 = 0x01;
pub const INS_AUTHENTICATE: u8 = 0x02;
pub const INS_VERSION: u8 = 0x03;

pub const SW_NO_ERROR: u16 = 0x9000;
pub const SW_WRONG_LENGTH: u16 = 0x6700;
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;
pub const SW_WRONG_DATA: u16 = 0x6A80;
pub const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;
pub const SW_UNKNOWN: u16 = 0x6F00;

pub const AUTH_ENFORCE: u8 = 0x03; // Enforce user presence and sign
pub const AUTH_CHECK_ONLY: u8 = 0x07; // Check only
pub const AUTH_DONT_ENFORCE: u8 = 0x08; // Sign without user presence

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
    /// Ne; zero when the request carries no Le.
    pub max_response_len: usize,
}

fn truncated(_: std::io::Error) -> U2fError {
    U2fError::WrongLength
}

impl Apdu {
    /// Only supports extended length encoding.
    pub fn decode(message: &[u8]) -> Result<Self, U2fError> {
        let mut reader = Cursor::new(message);
        let remaining = |reader: &Cursor<&[u8]>| message.len() - reader.position() as usize;

        let cla = reader.read_u8().map_err(truncated)?;
        let ins = reader.read_u8().map_err(truncated)?;
        let p1 = reader.read_u8().map_err(truncated)?;
        let p2 = reader.read_u8().map_err(truncated)?;
        let mut apdu = Apdu {
            cla,
            ins,
            p1,
            p2,
            data: vec![],
            max_response_len: 0,
        };
        if remaining(&reader) == 0 {
            return Ok(apdu);
        }

        // Extended length encoding always begins with a zero byte
        if reader.read_u8().map_err(truncated)? != 0 {
            return Err(U2fError::WrongLength);
        }
        let length = reader.read_u16::<BigEndian>().map_err(truncated)? as usize;
        if remaining(&reader) == 0 {
            // No request data, so the length was Le
            apdu.max_response_len = length;
            return Ok(apdu);
        }

        apdu.data = vec![0u8; length];
        reader.read_exact(&mut apdu.data).map_err(truncated)?;
        match remaining(&reader) {
            0 => {}
            2 => apdu.max_response_len = reader.read_u16::<BigEndian>().map_err(truncated)? as usize,
            _ => return Err(U2fError::WrongLength),
        }
        Ok(apdu)
    }
}

pub fn with_status(mut body: Vec<u8>, status: u16) -> Vec<u8> {
    body.extend_from_slice(&status.to_be_bytes());
    body
}
