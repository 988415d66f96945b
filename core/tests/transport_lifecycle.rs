//! Ownership and timing properties of the BLE stream.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use divelog_transfer::ble_mock::{MockBleCentral, MockLink, MockScript};
use divelog_transfer::config::TransportConfig;
use divelog_transfer::engine_mock::{MockEngine, MockEngineConfig};
use divelog_transfer::{
    BleTransport, ConnectionSession, HandshakeError, NotificationBuffer, SessionState, Status,
    Stream,
};

fn transport_config(partial_ms: u64) -> TransportConfig {
    TransportConfig {
        full_read_timeout_ms: 10_000,
        partial_read_timeout_ms: partial_ms,
        poll_interval_ms: 10,
    }
}

#[test]
fn test_forty_of_hundred_bytes_is_a_partial_read() {
    let link = MockLink::new();
    let mut central = MockBleCentral::new();
    central.add_device("AA:BB", "Perdix 2", MockScript::with_link(link.clone()));
    let mut transport =
        BleTransport::connect(&mut central, "AA:BB", transport_config(1_000)).unwrap();
    transport.set_timeout(5_000).unwrap();

    let feeder = {
        let link = link.clone();
        thread::spawn(move || {
            for chunk in [[0xA5u8; 20], [0x5A; 20]] {
                thread::sleep(Duration::from_millis(50));
                link.notify(&chunk);
            }
        })
    };

    let mut buf = [0u8; 100];
    let started = Instant::now();
    let actual = transport.read(&mut buf).unwrap();
    feeder.join().unwrap();

    assert_eq!(actual, 40);
    assert_eq!(&buf[..20], &[0xA5; 20]);
    assert_eq!(&buf[20..40], &[0x5A; 20]);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_close_twice_disconnects_once() {
    let link = MockLink::new();
    let mut central = MockBleCentral::new();
    central.add_device("AA:BB", "Perdix 2", MockScript::with_link(link.clone()));
    let mut transport = BleTransport::connect(&mut central, "AA:BB", transport_config(100)).unwrap();

    assert_eq!(transport.close(), Ok(()));
    assert_eq!(transport.close(), Ok(()));
    drop(transport);
    assert_eq!(link.disconnect_count(), 1);
}

#[test]
fn test_failed_handshake_releases_everything_once() {
    let link = MockLink::new();
    let engine_config = MockEngineConfig {
        handshake_reply: b"ERR".to_vec(),
        ..MockEngineConfig::default()
    };
    let mut central = MockBleCentral::new();
    central.add_device(
        "AA:BB",
        "Perdix 2",
        MockEngine::handshake_script(&engine_config, link.clone()),
    );
    let engine = Arc::new(MockEngine::new(engine_config));
    let descriptor = divelog_transfer::Engine::descriptors(&*engine)[0].clone();

    let mut session = ConnectionSession::new(Arc::clone(&engine), descriptor, transport_config(100));
    let err = session.open(&mut central, "AA:BB").unwrap_err();

    assert_eq!(err, HandshakeError::DeviceOpen(Status::Protocol));
    assert_eq!(session.state(), SessionState::OpenFailed);
    assert_eq!(link.disconnect_count(), 1);
    assert_eq!(engine.counters().contexts_live(), 0);

    assert_eq!(session.close(), Ok(()));
    drop(session);
    assert_eq!(link.disconnect_count(), 1);
}

#[test]
fn test_buffer_preserves_order_across_threads() {
    let buffer = Arc::new(NotificationBuffer::new());
    let producer = {
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            for i in 0..=255u8 {
                buffer.append(&[i]);
            }
        })
    };

    let mut drained = Vec::new();
    while drained.len() < 256 {
        drained.extend(buffer.take_up_to(7));
    }
    producer.join().unwrap();

    assert_eq!(drained, (0..=255u8).collect::<Vec<_>>());
    assert!(buffer.is_empty());
}
