//! USB device model of the virtual key: descriptors, endpoint 0 control
//! requests and the two HID interrupt endpoints.

pub mod descriptors;
pub mod device;

pub use device::FidoUsbDevice;

use byteorder::{ByteOrder, LittleEndian};

pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;

pub const HID_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const HID_REQUEST_SET_IDLE: u8 = 0x0A;
pub const HID_REQUEST_SET_PROTOCOL: u8 = 0x0B;

pub const RECIPIENT_DEVICE: u8 = 0;
pub const RECIPIENT_INTERFACE: u8 = 1;

pub const ENDPOINT_CONTROL: u32 = 0;
pub const ENDPOINT_IN: u32 = 1;
pub const ENDPOINT_OUT: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("Unsupported request {request:#04x} for recipient {recipient}")]
    UnsupportedRequest { recipient: u8, request: u8 },
    #[error("Unsupported descriptor type {0:#04x}")]
    UnsupportedDescriptor(u8),
    #[error("No string descriptor at index {0}")]
    UnknownString(u8),
    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(u32),
}

/// The 8-byte control transfer setup stage, little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn parse(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: LittleEndian::read_u16(&bytes[2..4]),
            index: LittleEndian::read_u16(&bytes[4..6]),
            length: LittleEndian::read_u16(&bytes[6..8]),
        }
    }

    pub fn recipient(&self) -> u8 {
        self.request_type & 0x1F
    }

    pub fn device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn descriptor_type(&self) -> u8 {
        (self.value >> 8) as u8
    }

    pub fn descriptor_index(&self) -> u8 {
        (self.value & 0xFF) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get_device_descriptor() {
        let setup = SetupPacket::parse(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);
        assert!(setup.device_to_host());
        assert_eq!(setup.recipient(), RECIPIENT_DEVICE);
        assert_eq!(setup.request, REQUEST_GET_DESCRIPTOR);
        assert_eq!(setup.descriptor_type(), descriptors::DESCRIPTOR_DEVICE);
        assert_eq!(setup.descriptor_index(), 0);
        assert_eq!(setup.length, 18);
    }

    #[test]
    fn test_parse_interface_request() {
        let setup = SetupPacket::parse(&[0x21, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert!(!setup.device_to_host());
        assert_eq!(setup.recipient(), RECIPIENT_INTERFACE);
        assert_eq!(setup.request, HID_REQUEST_SET_IDLE);
    }
}
