//! Fixed little-endian descriptors of the single-interface FIDO HID device.

use super::UsbError;

pub const DESCRIPTOR_DEVICE: u8 = 0x01;
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
pub const DESCRIPTOR_STRING: u8 = 0x03;
pub const DESCRIPTOR_INTERFACE: u8 = 0x04;
pub const DESCRIPTOR_ENDPOINT: u8 = 0x05;
pub const DESCRIPTOR_HID: u8 = 0x21;
pub const DESCRIPTOR_HID_REPORT: u8 = 0x22;

pub const MAX_PACKET_SIZE: u16 = 64;
pub const LANGID_EN_US: u16 = 0x0409;
pub const INTERFACE_CLASS_HID: u8 = 0x03;

const CONFIG_ATTRIBUTE_BASE: u8 = 0x80;
const CONFIG_ATTRIBUTE_SELF_POWERED: u8 = 0x40;
const ENDPOINT_INTERRUPT: u8 = 0x03;
const ENDPOINT_INTERVAL: u8 = 255;

/// String descriptors 1 to 5.
pub const STRINGS: [&str; 5] = [
    "No Company",
    "Virtual FIDO",
    "No Serial Number",
    "String 4",
    "Default Interface",
];

pub const FIDO_HID_REPORT_DESCRIPTOR: &[u8] = &[
    0x06, 0xD0, 0xF1, // Usage Page (FIDO Alliance, 0xF1D0)
    0x09, 0x01,       // Usage (CTAP HID)
    0xA1, 0x01,       // Collection (Application)
    0x09, 0x20,       //   Usage (Data In)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8 bits)
    0x95, 0x40,       //   Report Count (64)
    0x81, 0x02,       //   Input (Data, Variable, Absolute)
    0x09, 0x21,       //   Usage (Data Out)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8 bits)
    0x95, 0x40,       //   Report Count (64)
    0x91, 0x02,       //   Output (Data, Variable, Absolute)
    0xC0,             // End Collection
];

pub fn device_descriptor() -> Vec<u8> {
    let mut d = vec![18, DESCRIPTOR_DEVICE];
    d.extend_from_slice(&0x0110u16.to_le_bytes()); // bcdUSB
    d.extend_from_slice(&[0, 0, 0]); // class, subclass, protocol
    d.push(MAX_PACKET_SIZE as u8); // bMaxPacketSize0
    d.extend_from_slice(&0u16.to_le_bytes()); // idVendor
    d.extend_from_slice(&0u16.to_le_bytes()); // idProduct
    d.extend_from_slice(&0x0001u16.to_le_bytes()); // bcdDevice
    d.extend_from_slice(&[1, 2, 3]); // manufacturer, product, serial
    d.push(1); // bNumConfigurations
    d
}

fn interface_descriptor() -> [u8; 9] {
    [9, DESCRIPTOR_INTERFACE, 0, 0, 2, INTERFACE_CLASS_HID, 0, 0, 5]
}

fn hid_descriptor() -> Vec<u8> {
    let mut d = vec![9, DESCRIPTOR_HID];
    d.extend_from_slice(&0x0101u16.to_le_bytes()); // bcdHID
    d.extend_from_slice(&[0, 1, DESCRIPTOR_HID_REPORT]);
    d.extend_from_slice(&(FIDO_HID_REPORT_DESCRIPTOR.len() as u16).to_le_bytes());
    d
}

fn endpoint_descriptor(address: u8) -> Vec<u8> {
    let mut d = vec![7, DESCRIPTOR_ENDPOINT, address, ENDPOINT_INTERRUPT];
    d.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    d.push(ENDPOINT_INTERVAL);
    d
}

/// Configuration descriptor followed by the interface, HID and endpoint
/// descriptors it covers.
pub fn configuration_descriptor() -> Vec<u8> {
    let mut body = interface_descriptor().to_vec();
    body.extend_from_slice(&hid_descriptor());
    body.extend_from_slice(&endpoint_descriptor(0x81));
    body.extend_from_slice(&endpoint_descriptor(0x02));

    let total_len = (9 + body.len()) as u16;
    let mut d = vec![9, DESCRIPTOR_CONFIGURATION];
    d.extend_from_slice(&total_len.to_le_bytes());
    d.extend_from_slice(&[
        1, // bNumInterfaces
        0, // bConfigurationValue
        4, // iConfiguration
        CONFIG_ATTRIBUTE_BASE | CONFIG_ATTRIBUTE_SELF_POWERED,
        0, // bMaxPower
    ]);
    d.extend_from_slice(&body);
    d
}

pub fn string_descriptor(index: u8) -> Result<Vec<u8>, UsbError> {
    let payload: Vec<u8> = match index {
        0 => LANGID_EN_US.to_le_bytes().to_vec(),
        i => STRINGS
            .get(usize::from(i) - 1)
            .ok_or(UsbError::UnknownString(i))?
            .encode_utf16()
            .flat_map(u16::to_le_bytes)
            .collect(),
    };
    let mut d = vec![(2 + payload.len()) as u8, DESCRIPTOR_STRING];
    d.extend_from_slice(&payload);
    Ok(d)
}

/// GET_DESCRIPTOR addressed to the device.
pub fn descriptor(descriptor_type: u8, index: u8) -> Result<Vec<u8>, UsbError> {
    match descriptor_type {
        DESCRIPTOR_DEVICE => Ok(device_descriptor()),
        DESCRIPTOR_CONFIGURATION => Ok(configuration_descriptor()),
        DESCRIPTOR_STRING => string_descriptor(index),
        other => Err(UsbError::UnsupportedDescriptor(other)),
    }
}
