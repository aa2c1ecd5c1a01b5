//! USB/IP wire structures. Every field is big-endian.

use byteorder::{BigEndian, ByteOrder};

pub const USBIP_VERSION: u16 = 0x0111;

pub const OP_REQ_DEVLIST: u16 = 0x8005;
pub const OP_REP_DEVLIST: u16 = 0x0005;
pub const OP_REQ_IMPORT: u16 = 0x8003;
pub const OP_REP_IMPORT: u16 = 0x0003;

pub const USBIP_CMD_SUBMIT: u32 = 0x0001;
pub const USBIP_CMD_UNLINK: u32 = 0x0002;
pub const USBIP_RET_SUBMIT: u32 = 0x0003;
pub const USBIP_RET_UNLINK: u32 = 0x0004;

pub const USBIP_DIR_OUT: u32 = 0;
pub const USBIP_DIR_IN: u32 = 1;

pub const ST_OK: u32 = 0;
pub const ST_NA: u32 = 1;

pub const ECONNRESET: i32 = 104;
pub const ENOENT: i32 = 2;

pub const OP_HEADER_LEN: usize = 8;
pub const BUS_ID_LEN: usize = 32;
pub const PATH_LEN: usize = 256;
pub const DEVICE_SUMMARY_LEN: usize = 312;
pub const INTERFACE_SUMMARY_LEN: usize = 4;
pub const MESSAGE_HEADER_LEN: usize = 20;
pub const MESSAGE_BODY_LEN: usize = 28;

/// Operation header of the control phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub version: u16,
    pub command: u16,
    pub status: u32,
}

impl OpHeader {
    pub fn reply(command: u16, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            command,
            status,
        }
    }

    pub fn decode(raw: &[u8; OP_HEADER_LEN]) -> Self {
        Self {
            version: BigEndian::read_u16(&raw[0..2]),
            command: BigEndian::read_u16(&raw[2..4]),
            status: BigEndian::read_u32(&raw[4..8]),
        }
    }

    pub fn encode(&self) -> [u8; OP_HEADER_LEN] {
        let mut raw = [0u8; OP_HEADER_LEN];
        BigEndian::write_u16(&mut raw[0..2], self.version);
        BigEndian::write_u16(&mut raw[2..4], self.command);
        BigEndian::write_u32(&mut raw[4..8], self.status);
        raw
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub path: String,
    pub bus_id: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub interfaces: Vec<InterfaceSummary>,
}

fn copy_c_string(dest: &mut [u8], value: &str) {
    // keep a terminating NUL
    let len = value.len().min(dest.len() - 1);
    dest[..len].copy_from_slice(&value.as_bytes()[..len]);
}

impl DeviceSummary {
    /// The fixed-size part shared by DEVLIST and IMPORT replies.
    pub fn encode_header(&self) -> [u8; DEVICE_SUMMARY_LEN] {
        let mut raw = [0u8; DEVICE_SUMMARY_LEN];
        copy_c_string(&mut raw[..PATH_LEN], &self.path);
        copy_c_string(&mut raw[PATH_LEN..PATH_LEN + BUS_ID_LEN], &self.bus_id);
        let rest = &mut raw[PATH_LEN + BUS_ID_LEN..];
        BigEndian::write_u32(&mut rest[0..4], self.busnum);
        BigEndian::write_u32(&mut rest[4..8], self.devnum);
        BigEndian::write_u32(&mut rest[8..12], self.speed);
        BigEndian::write_u16(&mut rest[12..14], self.vendor_id);
        BigEndian::write_u16(&mut rest[14..16], self.product_id);
        BigEndian::write_u16(&mut rest[16..18], self.bcd_device);
        rest[18] = self.device_class;
        rest[19] = self.device_subclass;
        rest[20] = self.device_protocol;
        rest[21] = self.configuration_value;
        rest[22] = self.num_configurations;
        rest[23] = self.interfaces.len() as u8;
        raw
    }

    /// `{class, subclass, protocol, padding}` per interface, DEVLIST only.
    pub fn encode_interfaces(&self) -> Vec<u8> {
        self.interfaces
            .iter()
            .flat_map(|i| [i.class, i.subclass, i.protocol, 0])
            .collect()
    }
}

/// Bus ids arrive as NUL padded 32-byte fields.
pub fn parse_bus_id(raw: &[u8; BUS_ID_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(BUS_ID_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// `OP_REP_DEVLIST` for `devices`.
pub fn encode_devlist(devices: &[DeviceSummary]) -> Vec<u8> {
    let mut reply = OpHeader::reply(OP_REP_DEVLIST, ST_OK).encode().to_vec();
    reply.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    for device in devices {
        reply.extend_from_slice(&device.encode_header());
        reply.extend_from_slice(&device.encode_interfaces());
    }
    reply
}

/// Header common to every command-phase message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub command: u32,
    pub seq: u32,
    pub devid: u32,
    pub direction: u32,
    pub endpoint: u32,
}

impl MessageHeader {
    pub fn decode(raw: &[u8; MESSAGE_HEADER_LEN]) -> Self {
        Self {
            command: BigEndian::read_u32(&raw[0..4]),
            seq: BigEndian::read_u32(&raw[4..8]),
            devid: BigEndian::read_u32(&raw[8..12]),
            direction: BigEndian::read_u32(&raw[12..16]),
            endpoint: BigEndian::read_u32(&raw[16..20]),
        }
    }

    pub fn encode(&self) -> [u8; MESSAGE_HEADER_LEN] {
        let mut raw = [0u8; MESSAGE_HEADER_LEN];
        BigEndian::write_u32(&mut raw[0..4], self.command);
        BigEndian::write_u32(&mut raw[4..8], self.seq);
        BigEndian::write_u32(&mut raw[8..12], self.devid);
        BigEndian::write_u32(&mut raw[12..16], self.direction);
        BigEndian::write_u32(&mut raw[16..20], self.endpoint);
        raw
    }

    /// Replies keep seq and devid; direction and endpoint are zeroed.
    pub fn reply(&self, command: u32) -> Self {
        Self {
            command,
            seq: self.seq,
            devid: self.devid,
            direction: USBIP_DIR_OUT,
            endpoint: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitBody {
    pub transfer_flags: u32,
    pub transfer_len: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: [u8; 8],
}

impl SubmitBody {
    pub fn decode(raw: &[u8; MESSAGE_BODY_LEN]) -> Self {
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&raw[20..28]);
        Self {
            transfer_flags: BigEndian::read_u32(&raw[0..4]),
            transfer_len: BigEndian::read_u32(&raw[4..8]),
            start_frame: BigEndian::read_u32(&raw[8..12]),
            number_of_packets: BigEndian::read_u32(&raw[12..16]),
            interval: BigEndian::read_u32(&raw[16..20]),
            setup,
        }
    }
}

/// Body of `CMD_UNLINK`: the seq of the URB to cancel, then padding.
pub fn decode_unlink_seq(raw: &[u8; MESSAGE_BODY_LEN]) -> u32 {
    BigEndian::read_u32(&raw[0..4])
}

/// `RET_SUBMIT` for `request`. `data` is only present for IN transfers.
pub fn encode_ret_submit(request: &MessageHeader, actual_length: u32, data: &[u8]) -> Vec<u8> {
    let mut body = [0u8; MESSAGE_BODY_LEN];
    // status 0
    BigEndian::write_u32(&mut body[4..8], actual_length);
    // start_frame 0
    BigEndian::write_u32(&mut body[12..16], 0xFFFF_FFFF); // number_of_packets
    // error_count 0, padding

    let mut reply = Vec::with_capacity(MESSAGE_HEADER_LEN + MESSAGE_BODY_LEN + data.len());
    reply.extend_from_slice(&request.reply(USBIP_RET_SUBMIT).encode());
    reply.extend_from_slice(&body);
    reply.extend_from_slice(data);
    reply
}

pub fn encode_ret_unlink(request: &MessageHeader, status: i32) -> Vec<u8> {
    let mut body = [0u8; MESSAGE_BODY_LEN];
    BigEndian::write_i32(&mut body[0..4], status);

    let mut reply = request.reply(USBIP_RET_UNLINK).encode().to_vec();
    reply.extend_from_slice(&body);
    reply
}
