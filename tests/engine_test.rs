//! Engine Integration Tests
//!
//! Real loopback sockets driven through the poll cycle:
//! - connect/accept/data/close life-cycle and event ordering
//! - handle generation safety across slot reuse
//! - firewall silent rejection
//! - per-connection options and status queries
//! - cross-thread postbox delivery and wait wakeup
//! - message ceilings end to end

use muxnet::base::neterror::NetError;
use muxnet::codec::header::HeaderMode;
use muxnet::core::engine::{Engine, SockOpt, SockStatus};
use muxnet::core::event::{close_code, Event, EventKind};
use muxnet::core::Hid;

/// Drive the engine until `pred` matches a queued event or the cycle
/// budget runs out. Matched and unmatched events all accumulate in
/// `log`.
fn pump_until(
    engine: &mut Engine,
    log: &mut Vec<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> bool {
    if log.iter().any(|e| pred(e)) {
        return true;
    }
    for _ in 0..300 {
        engine.wait(10).unwrap();
        let mut matched = false;
        while let Some(event) = engine.poll_event() {
            if pred(&event) {
                matched = true;
            }
            log.push(event);
        }
        if matched {
            return true;
        }
    }
    false
}

fn exit_code(event: &Event) -> u32 {
    u32::from_le_bytes(event.data[..4].try_into().unwrap())
}

/// Listener + established pair, driven inside one engine.
fn connected_pair(engine: &mut Engine, mode: HeaderMode) -> (Hid, Hid, Hid) {
    let listener = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), mode)
        .unwrap();
    let addr = engine.sockname(listener).unwrap();
    let client = engine.new_connect(addr, mode).unwrap();

    let mut log = Vec::new();
    assert!(
        pump_until(engine, &mut log, |e| e.kind == EventKind::Estab
            && e.wparam == client.raw() as i64),
        "client never established"
    );
    let mut accepted = log
        .iter()
        .find(|e| e.kind == EventKind::New && e.lparam == listener.raw() as i64)
        .map(|e| Hid::from_raw(e.wparam as u32));
    if accepted.is_none() {
        assert!(
            pump_until(engine, &mut log, |e| e.kind == EventKind::New
                && e.lparam == listener.raw() as i64),
            "no accept event"
        );
        accepted = log
            .iter()
            .find(|e| e.kind == EventKind::New && e.lparam == listener.raw() as i64)
            .map(|e| Hid::from_raw(e.wparam as u32));
    }
    (listener, client, accepted.unwrap())
}

#[test]
fn test_connect_accept_data_close() {
    let mut engine = Engine::new().unwrap();
    let (listener, client, accepted) = connected_pair(&mut engine, HeaderMode::WordLsb);

    // Accepted side reports established immediately.
    assert_eq!(engine.status(accepted, SockStatus::Estab).unwrap(), 1);
    assert_eq!(engine.status(client, SockStatus::Estab).unwrap(), 1);

    // Client → server message.
    engine.send(client, b"hello over loopback").unwrap();
    let mut log = Vec::new();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Data
            && e.wparam == accepted.raw() as i64
            && e.data == b"hello over loopback"
    }));

    // Server → client, vectorized into one frame.
    engine
        .send_vector(accepted, &[b"a", b"b", b"c"], 0)
        .unwrap();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Data && e.wparam == client.raw() as i64 && e.data == b"abc"
    }));

    // Local close delivers a coded Close; the peer sees EOF.
    engine.close(client, 0).unwrap();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Close
            && e.wparam == client.raw() as i64
            && exit_code(e) == close_code::LOCAL
    }));
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Close
            && e.wparam == accepted.raw() as i64
            && exit_code(e) == close_code::EOF
    }));
    assert_eq!(engine.status(client, SockStatus::State).unwrap_err(), NetError::NotFound);

    engine.close(listener, 0).unwrap();
}

#[test]
fn test_message_boundaries_preserved_in_order() {
    let mut engine = Engine::new().unwrap();
    let (_listener, client, accepted) = connected_pair(&mut engine, HeaderMode::EwordMsb);

    let messages: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 1 + i as usize * 17]).collect();
    for message in &messages {
        engine.send(client, message).unwrap();
    }
    let mut got = Vec::new();
    let mut log = Vec::new();
    let expected = messages.len();
    assert!(pump_until(&mut engine, &mut log, |e| {
        if e.kind == EventKind::Data && e.wparam == accepted.raw() as i64 {
            got.push(e.data.clone());
        }
        got.len() == expected
    }));
    assert_eq!(got, messages);
}

#[test]
fn test_handle_value_never_reissued() {
    let mut engine = Engine::new().unwrap();
    let listener = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), HeaderMode::Raw)
        .unwrap();
    let addr = engine.sockname(listener).unwrap();

    let first = engine.new_connect(addr, HeaderMode::Raw).unwrap();
    engine.close(first, 0).unwrap();
    // The Close event for `first` is still queued; a new handle may
    // reuse the slot but never the numeric value.
    let second = engine.new_connect(addr, HeaderMode::Raw).unwrap();
    assert_ne!(first.raw(), second.raw());
    assert_eq!(engine.remain(first).unwrap_err(), NetError::NotFound);
    assert!(engine.remain(second).is_ok());
}

#[test]
fn test_firewall_rejects_silently() {
    let mut engine = Engine::new().unwrap();
    engine.firewall(Some(Box::new(|_peer, _listener| false)));
    let listener = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), HeaderMode::WordLsb)
        .unwrap();
    let addr = engine.sockname(listener).unwrap();
    let client = engine.new_connect(addr, HeaderMode::WordLsb).unwrap();

    // The client handle dies (accept side dropped it); crucially the
    // listener never surfaces an accepted New event.
    let mut log = Vec::new();
    pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Close && e.wparam == client.raw() as i64
    });
    assert!(!log
        .iter()
        .any(|e| e.kind == EventKind::New && e.lparam == listener.raw() as i64));
    assert_eq!(engine.nfds(), 1); // listener only
}

#[test]
fn test_option_and_status_surface() {
    let mut engine = Engine::new().unwrap();
    let (_listener, client, accepted) = connected_pair(&mut engine, HeaderMode::DwordLsb);

    engine.option(client, SockOpt::NoDelay(true)).unwrap();
    engine
        .option(client, SockOpt::Keepalive { idle_secs: 30, interval_secs: 10, count: 3 })
        .unwrap();
    engine.option(client, SockOpt::SysSndBuf(64 * 1024)).unwrap();
    engine.option(client, SockOpt::SysRcvBuf(64 * 1024)).unwrap();
    engine.option(client, SockOpt::Limited(1 << 20)).unwrap();
    engine.option(client, SockOpt::MaxSize(512)).unwrap();
    engine.option(client, SockOpt::Progress(true)).unwrap();

    assert_eq!(engine.status(client, SockStatus::State).unwrap(), 2);
    assert_eq!(engine.status(client, SockStatus::Ipv6).unwrap(), 0);
    assert_eq!(
        engine.status(client, SockStatus::Header).unwrap(),
        HeaderMode::DwordLsb.as_u8() as i64
    );
    assert_eq!(engine.status(client, SockStatus::Protocol).unwrap(), 0);
    assert_eq!(engine.status(accepted, SockStatus::MaskGet).unwrap(), 3);
    #[cfg(unix)]
    assert!(engine.status(client, SockStatus::Fd).unwrap() > 0);

    // Ceiling applies per connection now.
    assert_eq!(engine.send(client, &[0u8; 600]).unwrap_err(), NetError::OverLimit);
    assert!(engine.send(client, &[0u8; 400]).is_ok());

    // Tags echo through events.
    engine.set_tag(accepted, 77).unwrap();
    assert_eq!(engine.tag(accepted).unwrap(), 77);
    engine.send(client, b"tagged").unwrap();
    let mut log = Vec::new();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Data && e.wparam == accepted.raw() as i64 && e.lparam == 77
    }));
}

#[test]
fn test_engine_default_limits_apply_to_new_connections() {
    let mut engine = Engine::new().unwrap();
    engine.set_limit(0, 1024);
    let (_listener, client, accepted) = connected_pair(&mut engine, HeaderMode::WordLsb);

    assert_eq!(engine.send(client, &[1u8; 2000]).unwrap_err(), NetError::OverLimit);
    let payload = vec![9u8; 1000];
    engine.send(client, &payload).unwrap();
    let mut log = Vec::new();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Data && e.wparam == accepted.raw() as i64 && e.data == payload
    }));
}

#[test]
fn test_oversized_peer_frame_force_closes() {
    let mut engine = Engine::new().unwrap();
    let (_listener, client, accepted) = connected_pair(&mut engine, HeaderMode::WordLsb);
    // Receiver ceiling far below what the sender will claim.
    engine.option(accepted, SockOpt::MaxSize(16)).unwrap();
    engine.send(client, &[5u8; 200]).unwrap();

    let mut log = Vec::new();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Close
            && e.wparam == accepted.raw() as i64
            && exit_code(e) == close_code::OVERFLOW
    }));
}

#[test]
fn test_post_and_push_from_driving_thread() {
    let mut engine = Engine::new().unwrap();
    engine.post(11, 22, b"payload");
    engine.push(EventKind::Extend, 1, 2, b"x");
    let first = engine.poll_event().unwrap();
    assert_eq!(first.kind, EventKind::Post);
    assert_eq!((first.wparam, first.lparam), (11, 22));
    assert_eq!(first.data, b"payload");
    let second = engine.poll_event().unwrap();
    assert_eq!(second.kind, EventKind::Extend);
}

#[test]
fn test_postbox_wakes_wait() {
    let mut engine = Engine::new().unwrap();
    let postbox = engine.postbox();
    let sender = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        postbox.post(5, 6, b"cross-thread");
    });
    let start = std::time::Instant::now();
    // A 10s budget that must be cut short by the postbox wake.
    engine.wait(10_000).unwrap();
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    sender.join().unwrap();
    let event = engine.poll_event().unwrap();
    assert_eq!(event.kind, EventKind::Post);
    assert_eq!(event.data, b"cross-thread");
}

#[test]
fn test_read_event_buffer_conventions() {
    let mut engine = Engine::new().unwrap();
    engine.post(1, 2, b"four");
    // Size query.
    let info = engine.read_event(None).unwrap();
    assert_eq!(info.len, 4);
    // Too small: stays queued.
    let mut small = [0u8; 2];
    assert_eq!(
        engine.read_event(Some(&mut small)).unwrap_err(),
        NetError::BufferTooSmall { need: 4 }
    );
    let mut buf = [0u8; 16];
    let info = engine.read_event(Some(&mut buf)).unwrap();
    assert_eq!(&buf[..info.len], b"four");
    assert_eq!(engine.read_event(None).unwrap_err(), NetError::NotEnoughData);
}

#[test]
fn test_node_iteration_follows_creation_order() {
    let mut engine = Engine::new().unwrap();
    let a = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), HeaderMode::Raw)
        .unwrap();
    let b = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), HeaderMode::Raw)
        .unwrap();
    let c = engine
        .new_listen("127.0.0.1:0".parse().unwrap(), HeaderMode::Raw)
        .unwrap();

    assert_eq!(engine.node_head(), Some(a));
    assert_eq!(engine.node_next(a), Some(b));
    assert_eq!(engine.node_next(b), Some(c));
    assert_eq!(engine.node_next(c), None);
    assert_eq!(engine.node_prev(b), Some(a));

    engine.close(b, 0).unwrap();
    assert_eq!(engine.node_next(a), Some(c));
    assert_eq!(engine.node_prev(c), Some(a));
    assert_eq!(engine.nfds(), 2);
}

#[test]
fn test_ciphered_connection_end_to_end() {
    let mut engine = Engine::new().unwrap();
    let (_listener, client, accepted) = connected_pair(&mut engine, HeaderMode::WordLsb);
    engine.set_send_key(client, b"shared").unwrap();
    engine.set_recv_key(accepted, b"shared").unwrap();

    engine.send(client, b"enciphered hello").unwrap();
    let mut log = Vec::new();
    assert!(pump_until(&mut engine, &mut log, |e| {
        e.kind == EventKind::Data
            && e.wparam == accepted.raw() as i64
            && e.data == b"enciphered hello"
    }));
}
