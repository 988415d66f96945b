//! Scripted in-process BLE peripheral.
//!
//! Responses produced by a [`Responder`] are delivered from a dedicated
//! dispatch thread in notification-sized chunks, the same way a platform
//! stack delivers them outside the caller's stack.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::ble::{BleCentral, BleConnection, BleDeviceInfo, BleError};
use crate::buffer::NotificationSink;

/// Maps one written packet to zero or more response payloads.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

pub const DEFAULT_CHUNK_SIZE: usize = 20;

#[derive(Debug, Default)]
struct LinkState {
    sink: Option<NotificationSink>,
    writes: Vec<Vec<u8>>,
    disconnects: usize,
    connected: bool,
}

/// Test-side view of a mock connection, usable after the connection itself
/// has moved into a transport.
#[derive(Clone, Debug, Default)]
pub struct MockLink {
    state: Arc<Mutex<LinkState>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an unsolicited payload in notification-sized chunks.
    pub fn notify(&self, data: &[u8]) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            for chunk in data.chunks(DEFAULT_CHUNK_SIZE) {
                sink.deliver(chunk);
            }
        }
    }

    pub fn lose_link(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        if let Some(sink) = &state.sink {
            sink.link_lost();
        }
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Behaviour of one mock peripheral.
pub struct MockScript {
    pub fail_connect: bool,
    pub fail_discovery: bool,
    pub fail_subscribe: bool,
    pub fail_writes: bool,
    pub responder: Option<Responder>,
    pub chunk_size: usize,
    pub chunk_delay: Duration,
    pub link: MockLink,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            fail_connect: false,
            fail_discovery: false,
            fail_subscribe: false,
            fail_writes: false,
            responder: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay: Duration::from_millis(1),
            link: MockLink::new(),
        }
    }
}

impl MockScript {
    pub fn with_link(link: MockLink) -> Self {
        Self {
            link,
            ..Self::default()
        }
    }

    pub fn with_responder(link: MockLink, responder: Responder) -> Self {
        Self {
            link,
            responder: Some(responder),
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct MockBleCentral {
    devices: Vec<BleDeviceInfo>,
    scripts: HashMap<String, MockScript>,
}

impl MockBleCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, address: &str, name: &str, script: MockScript) {
        self.devices.push(BleDeviceInfo {
            address: address.to_string(),
            name: name.to_string(),
            rssi: -61,
        });
        self.scripts.insert(address.to_string(), script);
    }
}

impl BleCentral for MockBleCentral {
    type Connection = MockConnection;

    fn scan(&mut self, _timeout: Duration) -> Result<Vec<BleDeviceInfo>, BleError> {
        Ok(self.devices.clone())
    }

    fn connect(&mut self, address: &str) -> Result<Self::Connection, BleError> {
        let name = self
            .devices
            .iter()
            .find(|d| d.address == address)
            .map(|d| d.name.clone())
            .ok_or_else(|| BleError::DeviceNotFound(address.to_string()))?;
        // A peripheral's script is consumed by its first connection.
        let script = self
            .scripts
            .remove(address)
            .ok_or_else(|| BleError::ConnectionFailed(format!("{address} already used")))?;
        if script.fail_connect {
            return Err(BleError::ConnectionFailed(address.to_string()));
        }
        script.link.state.lock().connected = true;
        Ok(MockConnection {
            address: address.to_string(),
            name,
            script,
            dispatch: None,
        })
    }
}

struct Dispatch {
    tx: mpsc::Sender<Vec<u8>>,
    thread: JoinHandle<()>,
}

pub struct MockConnection {
    address: String,
    name: String,
    script: MockScript,
    dispatch: Option<Dispatch>,
}

impl MockConnection {
    fn stop_dispatch(&mut self) {
        if let Some(dispatch) = self.dispatch.take() {
            drop(dispatch.tx);
            let _ = dispatch.thread.join();
        }
    }
}

impl BleConnection for MockConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn discover_services(&mut self) -> Result<(), BleError> {
        if self.script.fail_discovery {
            return Err(BleError::ServiceNotFound);
        }
        Ok(())
    }

    fn subscribe(&mut self, sink: NotificationSink) -> Result<(), BleError> {
        if self.script.fail_subscribe {
            return Err(BleError::Gatt("notifications refused".into()));
        }
        self.script.link.state.lock().sink = Some(sink.clone());

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let chunk_size = self.script.chunk_size.max(1);
        let delay = self.script.chunk_delay;
        let thread = thread::spawn(move || {
            for payload in rx {
                for chunk in payload.chunks(chunk_size) {
                    thread::sleep(delay);
                    sink.deliver(chunk);
                }
            }
        });
        self.dispatch = Some(Dispatch { tx, thread });
        Ok(())
    }

    fn write_without_response(&mut self, data: &[u8]) -> Result<(), BleError> {
        if !self.script.link.is_connected() {
            return Err(BleError::Disconnected);
        }
        if self.script.fail_writes {
            return Err(BleError::Gatt("write refused".into()));
        }
        self.script.link.state.lock().writes.push(data.to_vec());

        let responses = match self.script.responder.as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        if let Some(dispatch) = &self.dispatch {
            for response in responses {
                dispatch.tx.send(response).map_err(|_| BleError::Disconnected)?;
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), BleError> {
        self.stop_dispatch();
        let mut state = self.script.link.state.lock();
        state.disconnects += 1;
        state.connected = false;
        state.sink = None;
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.stop_dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::NotificationBuffer;
    use std::time::Instant;

    #[test]
    fn test_scan_lists_devices() {
        let mut central = MockBleCentral::new();
        central.add_device("AA:BB", "Petrel 3", MockScript::default());

        let devices = central.scan(Duration::from_millis(10)).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Petrel 3");
    }

    #[test]
    fn test_connect_unknown_device() {
        let mut central = MockBleCentral::new();
        assert!(matches!(
            central.connect("00:00"),
            Err(BleError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_responder_delivers_in_chunks() {
        let link = MockLink::new();
        let responder: Responder = Box::new(|req| vec![req.iter().rev().copied().collect()]);
        let mut central = MockBleCentral::new();
        central.add_device("AA:BB", "Petrel 3", MockScript::with_responder(link.clone(), responder));

        let buffer = Arc::new(NotificationBuffer::new());
        let mut conn = central.connect("AA:BB").unwrap();
        conn.subscribe(NotificationSink::new(Arc::clone(&buffer))).unwrap();

        let request: Vec<u8> = (0..45).collect();
        conn.write_without_response(&request).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while buffer.len() < 45 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        let expected: Vec<u8> = (0..45).rev().collect();
        assert_eq!(buffer.take_up_to(100), expected);

        conn.disconnect().unwrap();
        assert_eq!(link.disconnect_count(), 1);
        assert!(!link.is_connected());
    }

    #[test]
    fn test_write_after_link_loss() {
        let link = MockLink::new();
        let mut central = MockBleCentral::new();
        central.add_device("AA:BB", "Petrel 3", MockScript::with_link(link.clone()));

        let mut conn = central.connect("AA:BB").unwrap();
        link.lose_link();
        assert_eq!(conn.write_without_response(&[1]), Err(BleError::Disconnected));
    }
}
