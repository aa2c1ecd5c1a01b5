use std::sync::Arc;

use virtual_fido::client::{MemoryBlobStore, StaticApprover, VirtualFidoClient};
use virtual_fido::cose::PublicKey;
use virtual_fido::crypto;
use virtual_fido::u2f::U2fServer;

const CHALLENGE: [u8; 32] = [0xC1; 32];

fn application(origin: &str) -> [u8; 32] {
    crypto::sha256(origin.as_bytes())
}

/// Extended-length APDU without Le.
fn apdu(ins: u8, p1: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0x00, ins, p1, 0x00, 0x00];
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
    buf
}

fn split_status(response: &[u8]) -> (&[u8], u16) {
    let (body, sw) = response.split_at(response.len() - 2);
    (body, u16::from_be_bytes([sw[0], sw[1]]))
}

/// Length of the DER element at the start of `der`.
fn der_len(der: &[u8]) -> usize {
    if der[1] & 0x80 == 0 {
        return 2 + der[1] as usize;
    }
    let n = (der[1] & 0x7F) as usize;
    let len = der[2..2 + n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
    2 + n + len
}

struct Registration {
    public_key: PublicKey,
    key_handle: Vec<u8>,
}

fn make_client() -> Arc<VirtualFidoClient> {
    Arc::new(VirtualFidoClient::load(Box::new(MemoryBlobStore::new("passphrase"))).unwrap())
}

fn make_server_for(client: &Arc<VirtualFidoClient>, approve: bool) -> U2fServer {
    U2fServer::new(client.clone(), client.clone(), Arc::new(StaticApprover(approve)))
}

fn make_server(approve: bool) -> U2fServer {
    make_server_for(&make_client(), approve)
}

fn register(server: &U2fServer, app: &[u8; 32]) -> Registration {
    let mut data = CHALLENGE.to_vec();
    data.extend_from_slice(app);
    let response = server.handle(&apdu(0x01, 0x00, &data));
    let (body, sw) = split_status(&response);
    assert_eq!(sw, 0x9000);

    assert_eq!(body[0], 0x05, "reserved byte");
    let encoded_key = &body[1..66];
    assert_eq!(encoded_key[0], 0x04, "uncompressed point");
    let handle_len = body[66] as usize;
    let key_handle = body[67..67 + handle_len].to_vec();
    let rest = &body[67 + handle_len..];
    let cert_len = der_len(rest);
    let signature = &rest[cert_len..];

    let public_key = PublicKey::Es256(p256::PublicKey::from_sec1_bytes(encoded_key).unwrap());
    let mut signed = vec![0x00];
    signed.extend_from_slice(app);
    signed.extend_from_slice(&CHALLENGE);
    signed.extend_from_slice(&key_handle);
    signed.extend_from_slice(encoded_key);
    assert!(public_key.verify(&signed, signature), "registration signature must verify");

    Registration {
        public_key,
        key_handle,
    }
}

fn authenticate_request(control: u8, app: &[u8; 32], key_handle: &[u8]) -> Vec<u8> {
    let mut data = CHALLENGE.to_vec();
    data.extend_from_slice(app);
    data.push(key_handle.len() as u8);
    data.extend_from_slice(key_handle);
    apdu(0x02, control, &data)
}

#[test]
fn test_register_then_authenticate() {
    let server = make_server(true);
    let app = application("https://example.com");
    let registration = register(&server, &app);

    let mut last_counter = 0;
    for _ in 0..2 {
        let response = server.handle(&authenticate_request(0x03, &app, &registration.key_handle));
        let (body, sw) = split_status(&response);
        assert_eq!(sw, 0x9000);
        assert_eq!(body[0], 0x01, "user presence byte");
        let counter = u32::from_be_bytes(body[1..5].try_into().unwrap());
        assert!(counter > last_counter, "counter must increase");
        last_counter = counter;

        let mut signed = app.to_vec();
        signed.push(0x01);
        signed.extend_from_slice(&body[1..5]);
        signed.extend_from_slice(&CHALLENGE);
        assert!(registration.public_key.verify(&signed, &body[5..]));
    }
}

#[test]
fn test_first_counter_is_one() {
    let server = make_server(true);
    let app = application("https://example.com");
    let registration = register(&server, &app);
    let response = server.handle(&authenticate_request(0x03, &app, &registration.key_handle));
    let (body, _) = split_status(&response);
    assert_eq!(&body[1..5], &[0, 0, 0, 1]);
}

#[test]
fn test_check_only_reports_known_handle() {
    let server = make_server(true);
    let app = application("https://example.com");
    let registration = register(&server, &app);

    let response = server.handle(&authenticate_request(0x07, &app, &registration.key_handle));
    assert_eq!(response, vec![0x69, 0x85]);

    let other = application("https://evil.example");
    let response = server.handle(&authenticate_request(0x07, &other, &registration.key_handle));
    assert_eq!(response, vec![0x6A, 0x80], "handle bound to another application");
}

#[test]
fn test_dont_enforce_signs_without_approval() {
    let client = make_client();
    let app = application("https://example.com");
    let registration = register(&make_server_for(&client, true), &app);

    let denying = make_server_for(&client, false);
    let response = denying.handle(&authenticate_request(0x08, &app, &registration.key_handle));
    let (body, sw) = split_status(&response);
    assert_eq!(sw, 0x9000);
    assert_eq!(body[0], 0x01);
}

#[test]
fn test_denied_authentication() {
    let client = make_client();
    let app = application("https://example.com");
    let registration = register(&make_server_for(&client, true), &app);

    let denying = make_server_for(&client, false);
    let response = denying.handle(&authenticate_request(0x03, &app, &registration.key_handle));
    assert_eq!(response, vec![0x69, 0x85]);
}

#[test]
fn test_key_handle_from_another_device() {
    let app = application("https://example.com");
    let registration = register(&make_server(true), &app);

    let other_device = make_server(true);
    let response = other_device.handle(&authenticate_request(0x03, &app, &registration.key_handle));
    assert_eq!(response, vec![0x6A, 0x80]);
}

#[test]
fn test_tampered_key_handle_is_wrong_data() {
    let server = make_server(true);
    let app = application("https://example.com");
    let mut registration = register(&server, &app);
    let last = registration.key_handle.len() - 1;
    registration.key_handle[last] ^= 0x01;

    let response = server.handle(&authenticate_request(0x03, &app, &registration.key_handle));
    assert_eq!(response, vec![0x6A, 0x80]);
}

#[test]
fn test_bad_control_byte_and_short_request() {
    let server = make_server(true);
    let app = application("https://example.com");
    let registration = register(&server, &app);

    let response = server.handle(&authenticate_request(0x05, &app, &registration.key_handle));
    assert_eq!(response, vec![0x67, 0x00]);

    let response = server.handle(&apdu(0x02, 0x03, &CHALLENGE));
    assert_eq!(response, vec![0x67, 0x00]);
}

#[test]
fn test_version_with_short_and_extended_encoding() {
    let server = make_server(true);
    assert_eq!(server.handle(&[0x00, 0x03, 0x00, 0x00]), b"U2F_V2\x90\x00".to_vec());
    assert_eq!(server.handle(&apdu(0x03, 0x00, &[])), b"U2F_V2\x90\x00".to_vec());
}
