use super::types::*;

pub enum Packet {
    Init(InitPacket),
    Cont(ContPacket),
}

pub struct InitPacket {
    pub cid: u32,
    pub cmd: u8,
    pub bcnt: u16,
    pub data: Vec<u8>,
}

pub struct ContPacket {
    pub cid: u32,
    pub seq: u8,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn cid(&self) -> u32 {
        match self {
            Packet::Init(init) => init.cid,
            Packet::Cont(cont) => cont.cid,
        }
    }
}

/// Distinguish init vs cont by bit 7 of byte 4.
pub fn parse_packet(report: &Report) -> Packet {
    let cid = u32::from_be_bytes([report[0], report[1], report[2], report[3]]);
    let byte4 = report[4];

    if byte4 & 0x80 != 0 {
        let cmd = byte4 & 0x7F;
        let bcnt = u16::from_be_bytes([report[5], report[6]]);
        let take = (bcnt as usize).min(INIT_DATA_SIZE);
        Packet::Init(InitPacket {
            cid,
            cmd,
            bcnt,
            data: report[7..7 + take].to_vec(),
        })
    } else {
        Packet::Cont(ContPacket {
            cid,
            seq: byte4,
            data: report[5..5 + CONT_DATA_SIZE].to_vec(),
        })
    }
}

/// Encode response message into >=1 HID reports.
pub fn encode_response(cid: u32, cmd: u8, payload: &[u8]) -> Vec<Report> {
    let mut packets = Vec::new();
    let bcnt = payload.len() as u16;
    let cid_bytes = cid.to_be_bytes();

    let mut pkt = [0u8; PACKET_SIZE];
    pkt[0..4].copy_from_slice(&cid_bytes);
    pkt[4] = cmd | 0x80;
    pkt[5..7].copy_from_slice(&bcnt.to_be_bytes());
    let first_chunk = payload.len().min(INIT_DATA_SIZE);
    pkt[7..7 + first_chunk].copy_from_slice(&payload[..first_chunk]);
    packets.push(pkt);

    let mut seq: u8 = 0;
    for chunk in payload[first_chunk..].chunks(CONT_DATA_SIZE) {
        let mut cpkt = [0u8; PACKET_SIZE];
        cpkt[0..4].copy_from_slice(&cid_bytes);
        cpkt[4] = seq;
        cpkt[5..5 + chunk.len()].copy_from_slice(chunk);
        packets.push(cpkt);
        seq = seq.wrapping_add(1);
    }

    packets
}

/// Single-packet ERROR response.
pub fn encode_error(cid: u32, error_code: u8) -> Report {
    let mut pkt = [0u8; PACKET_SIZE];
    pkt[0..4].copy_from_slice(&cid.to_be_bytes());
    pkt[4] = CMD_ERROR | 0x80;
    pkt[6] = 1;
    pkt[7] = error_code;
    pkt
}

pub fn encode_keepalive(cid: u32, status: u8) -> Report {
    let mut pkt = [0u8; PACKET_SIZE];
    pkt[0..4].copy_from_slice(&cid.to_be_bytes());
    pkt[4] = CMD_KEEPALIVE | 0x80;
    pkt[6] = 1;
    pkt[7] = status;
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctaphid::transaction::Transaction;

    fn reassemble(packets: &[Report]) -> (u32, u8, Vec<u8>) {
        let Packet::Init(init) = parse_packet(&packets[0]) else {
            panic!("first packet must be an init packet");
        };
        let mut transaction = Transaction::new(init.cid, init.cmd, init.bcnt as usize, &init.data);
        for report in &packets[1..] {
            let Packet::Cont(cont) = parse_packet(report) else {
                panic!("expected continuation packet");
            };
            transaction.add_continuation(cont.seq, &cont.data).unwrap();
        }
        assert!(transaction.is_complete());
        (init.cid, init.cmd, transaction.into_payload())
    }

    #[test]
    fn test_single_packet_layout() {
        let packets = encode_response(0x0102_0304, CMD_PING, b"hi");
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0][0..4], &[1, 2, 3, 4]);
        assert_eq!(packets[0][4], 0x81);
        assert_eq!(&packets[0][5..7], &[0, 2]);
        assert_eq!(&packets[0][7..9], b"hi");
        assert!(packets[0][9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_packetize_then_reassemble() {
        for len in [0usize, 1, 57, 58, 116, 117, 1000, 7609] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let packets = encode_response(7, CMD_CBOR, &payload);
            let expected = 1 + len.saturating_sub(INIT_DATA_SIZE).div_ceil(CONT_DATA_SIZE);
            assert_eq!(packets.len(), expected, "len {len}");
            assert_eq!(reassemble(&packets), (7, CMD_CBOR, payload));
        }
    }

    #[test]
    fn test_continuation_sequence_numbers() {
        let packets = encode_response(9, CMD_MSG, &[0xAB; 200]);
        let seqs: Vec<u8> = packets[1..].iter().map(|p| p[4]).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_error_and_keepalive_packets() {
        let err = encode_error(BROADCAST_CID, ERR_INVALID_CHANNEL);
        assert_eq!(&err[0..7], &[0xFF, 0xFF, 0xFF, 0xFF, 0xBF, 0x00, 0x01]);
        assert_eq!(err[7], 0x0B);

        let ka = encode_keepalive(1, KEEPALIVE_STATUS_UPNEEDED);
        assert_eq!(&ka[0..8], &[0, 0, 0, 1, 0xBB, 0, 1, 0x02]);
    }
}
