//! Cipher Tests
//!
//! Covers:
//! - encrypt/decrypt round trips at the boundary sizes
//! - byte-for-byte compatibility between two keyed instances
//! - keystream continuity across split applies

use muxnet::codec::cipher::Rc4;
use muxnet::codec::header::HeaderMode;
use muxnet::core::conn::Channel;

#[test]
fn test_round_trip_boundary_sizes() {
    for size in [0usize, 1, 255, 4096] {
        let original: Vec<u8> = (0..size).map(|i| (i * 13 + 7) as u8).collect();
        let mut wire = original.clone();
        Rc4::new(b"k").apply(&mut wire);
        Rc4::new(b"k").apply(&mut wire);
        assert_eq!(wire, original, "size {size}");
    }
}

#[test]
fn test_keystream_survives_split_applies() {
    // One instance enciphering in chunks must match a single pass.
    let data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
    let mut whole = data.clone();
    Rc4::new(b"split-key").apply(&mut whole);

    let mut chunked = data.clone();
    let mut cipher = Rc4::new(b"split-key");
    for chunk in chunked.chunks_mut(7) {
        cipher.apply(chunk);
    }
    assert_eq!(chunked, whole);
}

#[test]
fn test_channel_directions_use_independent_keys() {
    // a→b uses one key, b→a another; both round-trip concurrently.
    let mut a = Channel::new(HeaderMode::WordLsb);
    let mut b = Channel::new(HeaderMode::WordLsb);
    a.set_send_key(b"a-to-b");
    b.set_recv_key(b"a-to-b");
    b.set_send_key(b"b-to-a");
    a.set_recv_key(b"b-to-a");

    a.send(b"ping", 0).unwrap();
    b.feed(&a.take_outgoing()).unwrap();
    b.send(b"pong", 0).unwrap();
    a.feed(&b.take_outgoing()).unwrap();

    let mut out = [0u8; 16];
    let n = b.recv(Some(&mut out)).unwrap();
    assert_eq!(&out[..n], b"ping");
    let n = a.recv(Some(&mut out)).unwrap();
    assert_eq!(&out[..n], b"pong");
}

#[test]
fn test_wire_bytes_are_actually_obfuscated() {
    let mut plain = Channel::new(HeaderMode::WordLsb);
    let mut keyed = Channel::new(HeaderMode::WordLsb);
    keyed.set_send_key(b"key");
    plain.send(b"visible payload", 0).unwrap();
    keyed.send(b"visible payload", 0).unwrap();
    let plain_wire = plain.take_outgoing();
    let keyed_wire = keyed.take_outgoing();
    // Same header (length is not ciphered), different payload bytes.
    assert_eq!(plain_wire[..2], keyed_wire[..2]);
    assert_ne!(plain_wire[2..], keyed_wire[2..]);
}

#[test]
fn test_many_messages_stay_in_lockstep() {
    let mut tx = Channel::new(HeaderMode::EwordLsb);
    let mut rx = Channel::new(HeaderMode::EwordLsb);
    tx.set_send_key(b"stream");
    rx.set_recv_key(b"stream");
    let messages: Vec<Vec<u8>> =
        (0..50).map(|i| vec![i as u8; (i * 7) % 97]).collect();
    for message in &messages {
        tx.send(message, 0).unwrap();
    }
    rx.feed(&tx.take_outgoing()).unwrap();
    for message in &messages {
        let (got, _) = rx.next_message().unwrap().unwrap();
        assert_eq!(&got, message);
    }
}
