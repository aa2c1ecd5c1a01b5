use ciborium::value::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use virtual_fido::client::{MemoryBlobStore, StaticApprover, VirtualFidoClient};
use virtual_fido::ctap2::Ctap2Server;
use virtual_fido::ctaphid::{run_ctaphid_loop, types::*, Authenticators};
use virtual_fido::u2f::U2fServer;

fn make_init_packet(cid: u32, cmd: u8, payload: &[u8]) -> [u8; 64] {
    let mut pkt = [0u8; 64];
    pkt[0..4].copy_from_slice(&cid.to_be_bytes());
    pkt[4] = cmd | 0x80;
    let bcnt = payload.len() as u16;
    pkt[5] = (bcnt >> 8) as u8;
    pkt[6] = (bcnt & 0xFF) as u8;
    let copy = payload.len().min(57);
    pkt[7..7 + copy].copy_from_slice(&payload[..copy]);
    pkt
}

fn cbor_map_get<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| {
        if let Value::Integer(i) = k {
            if i128::from(*i) == key as i128 {
                return Some(v);
            }
        }
        None
    })
}

fn make_client(pin_enabled: bool) -> Arc<VirtualFidoClient> {
    let client = VirtualFidoClient::load(Box::new(MemoryBlobStore::new("passphrase"))).unwrap();
    client.set_pin_enabled(pin_enabled).unwrap();
    Arc::new(client)
}

async fn run_loop_and_get_response(client: Arc<VirtualFidoClient>, payload: &[u8]) -> Vec<u8> {
    let approver = Arc::new(StaticApprover(true));
    let handler = Arc::new(Authenticators {
        ctap2: Ctap2Server::new(client.clone(), client.clone(), client.clone(), approver.clone()),
        u2f: U2fServer::new(client.clone(), client, approver),
    });

    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_ctaphid_loop(incoming_rx, outgoing_tx, handler));

    // Allocate a channel with INIT
    incoming_tx
        .send(make_init_packet(BROADCAST_CID, CMD_INIT, &[1, 2, 3, 4, 5, 6, 7, 8]))
        .unwrap();
    let init_resp = timeout(Duration::from_secs(2), outgoing_rx.recv())
        .await
        .expect("INIT timeout")
        .unwrap();
    let init_resp = init_resp[0];
    let cid = u32::from_be_bytes([init_resp[15], init_resp[16], init_resp[17], init_resp[18]]);

    incoming_tx
        .send(make_init_packet(cid, CMD_CBOR, payload))
        .unwrap();

    // Skip keep-alives, then reassemble the response
    let packets = loop {
        let packets = timeout(Duration::from_secs(2), outgoing_rx.recv())
            .await
            .expect("CBOR response timeout")
            .unwrap();
        if packets[0][4] != CMD_KEEPALIVE | 0x80 {
            break packets;
        }
    };

    let first = packets[0];
    assert_eq!(first[4], CMD_CBOR | 0x80);
    let bcnt = u16::from_be_bytes([first[5], first[6]]) as usize;
    let mut body: Vec<u8> = first[7..7 + bcnt.min(57)].to_vec();
    for (seq, cont) in packets[1..].iter().enumerate() {
        assert_eq!(cont[4] as usize, seq, "continuation sequence mismatch");
        let chunk = (bcnt - body.len()).min(59);
        body.extend_from_slice(&cont[5..5 + chunk]);
    }
    assert_eq!(body.len(), bcnt);
    body
}

fn decode_info(body: &[u8]) -> Vec<(Value, Value)> {
    assert_eq!(body[0], 0x00, "GetInfo must return CTAP2_OK (0x00)");
    let val: Value = ciborium::from_reader(&body[1..]).unwrap();
    let Value::Map(map) = val else { panic!("GetInfo response is not a CBOR map") };
    map
}

#[tokio::test]
async fn test_get_info_versions() {
    let body = run_loop_and_get_response(make_client(false), &[0x04]).await;
    let map = decode_info(&body);

    let versions = cbor_map_get(&map, 0x01).expect("key 0x01 (versions) missing");
    let Value::Array(arr) = versions else { panic!("versions is not an array") };
    let names: Vec<&str> = arr.iter().filter_map(Value::as_text).collect();
    assert_eq!(names, vec!["FIDO_2_0", "U2F_V2"]);
}

#[tokio::test]
async fn test_get_info_aaguid() {
    let body = run_loop_and_get_response(make_client(false), &[0x04]).await;
    let map = decode_info(&body);

    let aaguid_val = cbor_map_get(&map, 0x03).expect("key 0x03 (aaguid) missing");
    let Value::Bytes(aaguid) = aaguid_val else { panic!("aaguid is not bytes") };
    assert_eq!(aaguid.as_slice(), &virtual_fido::config::AAGUID, "AAGUID must match config");
}

#[tokio::test]
async fn test_get_info_options_without_pin() {
    let body = run_loop_and_get_response(make_client(false), &[0x04]).await;
    let map = decode_info(&body);

    let opts_val = cbor_map_get(&map, 0x04).expect("key 0x04 (options) missing");
    let Value::Map(opts) = opts_val else { panic!("options is not a map") };
    let keys: Vec<&str> = opts.iter().filter_map(|(k, _)| k.as_text()).collect();
    assert_eq!(keys, vec!["rk", "up", "plat"], "options must be canonically ordered");
    assert!(opts.iter().all(|(k, _)| k.as_text() != Some("clientPin")));
    assert!(cbor_map_get(&map, 0x06).is_none(), "pinProtocols only with PIN support");
}

#[tokio::test]
async fn test_get_info_options_with_pin() {
    let body = run_loop_and_get_response(make_client(true), &[0x04]).await;
    let map = decode_info(&body);

    let Some(Value::Map(opts)) = cbor_map_get(&map, 0x04) else { panic!("options missing") };
    let client_pin = opts
        .iter()
        .find_map(|(k, v)| (k.as_text() == Some("clientPin")).then(|| v.as_bool()))
        .flatten();
    assert_eq!(client_pin, Some(false), "no PIN has been set yet");

    let Some(Value::Array(protocols)) = cbor_map_get(&map, 0x06) else {
        panic!("pinProtocols missing")
    };
    assert_eq!(protocols, &vec![Value::Integer(1.into())]);
}

#[tokio::test]
async fn test_unknown_ctap2_cmd_returns_error() {
    let body = run_loop_and_get_response(make_client(false), &[0x7F]).await;
    assert_eq!(body, vec![0x01], "Unknown command must return CTAP1_ERR_INVALID_COMMAND");
}
