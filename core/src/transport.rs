//! Blocking byte-stream façade over a notification-driven BLE connection.
//!
//! The protocol engine expects classic serial semantics: `read` blocks until
//! data or timeout, `write` returns once the bytes are handed off. BLE gives
//! neither. Inbound notifications are accumulated in a [`NotificationBuffer`]
//! by the backend's delivery context, and [`BleTransport::read`] polls that
//! buffer from the engine's thread.
//!
//! # Ownership
//!
//! A [`TransportHandle`] is the only owner of a physical connection and its
//! drop is the only path that disconnects it. [`BleTransport::adopt`] either
//! takes the handle into the finished stream or hands it back in
//! [`Rejected`]; there is no state where both the caller and the stream
//! believe they own it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::ble::{BleCentral, BleConnection, BleError};
use crate::buffer::{NotificationBuffer, NotificationSink};
use crate::config::TransportConfig;
use crate::engine::Status;
use crate::error::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlRequest {
    /// Advertised peripheral name, some handshakes derive keys from it.
    BleGetName,
    BleGetPincode,
    BleGetAccessCode,
    BleSetAccessCode,
}

/// The stream contract the protocol engine drives.
pub trait Stream: Send {
    /// `-1` disables the bound entirely.
    fn set_timeout(&mut self, timeout_ms: i32) -> Result<(), Status>;

    /// Fill up to `buf.len()` bytes. May return fewer (a partial read).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;

    fn write(&mut self, data: &[u8]) -> Result<usize, Status>;

    fn ioctl(&mut self, request: IoctlRequest, data: &mut Vec<u8>) -> Result<(), Status>;

    fn sleep(&mut self, milliseconds: u32) -> Result<(), Status>;

    /// Tear down the stream. Calling it again is a no-op.
    fn close(&mut self) -> Result<(), Status>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadTimeout {
    Unbounded,
    Bounded(Duration),
}

impl ReadTimeout {
    pub fn from_millis(timeout_ms: i32) -> Result<Self, Status> {
        match timeout_ms {
            -1 => Ok(ReadTimeout::Unbounded),
            ms if ms >= 0 => Ok(ReadTimeout::Bounded(Duration::from_millis(ms as u64))),
            _ => Err(Status::InvalidArgs),
        }
    }
}

/// Sole owner of one physical BLE connection and its receive buffer.
pub struct TransportHandle<C: BleConnection> {
    connection: Option<C>,
    buffer: Arc<NotificationBuffer>,
    timeout: ReadTimeout,
}

impl<C: BleConnection> TransportHandle<C> {
    pub fn bind(connection: C) -> Self {
        Self {
            connection: Some(connection),
            buffer: Arc::new(NotificationBuffer::new()),
            timeout: ReadTimeout::Unbounded,
        }
    }

    pub fn address(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.address())
    }

    pub fn buffer(&self) -> &Arc<NotificationBuffer> {
        &self.buffer
    }

    fn connection_mut(&mut self) -> Result<&mut C, TransportError> {
        self.connection.as_mut().ok_or(TransportError::Closed)
    }

    /// Discover services and route notifications into the buffer.
    fn start_streaming(&mut self) -> Result<(), TransportError> {
        let sink = NotificationSink::new(Arc::clone(&self.buffer));
        let connection = self.connection_mut()?;
        connection.discover_services()?;
        connection.subscribe(sink)?;
        Ok(())
    }

    /// Disconnect and drop the connection. Only the first call does work.
    fn release(&mut self) -> Result<(), BleError> {
        let result = match self.connection.take() {
            Some(mut connection) => {
                debug!("releasing BLE connection {}", connection.address());
                connection.disconnect()
            }
            None => Ok(()),
        };
        self.buffer.clear();
        result
    }
}

impl<C: BleConnection> Drop for TransportHandle<C> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("disconnect during transport drop failed: {e}");
        }
    }
}

/// A handle that could not be turned into a stream. The caller owns it
/// again and is responsible for releasing it.
pub struct Rejected<C: BleConnection> {
    pub error: TransportError,
    pub handle: TransportHandle<C>,
}

/// [`Stream`] implementation over a BLE connection.
pub struct BleTransport<C: BleConnection> {
    handle: Option<TransportHandle<C>>,
    name: Option<String>,
    config: TransportConfig,
    /// Cause of the most recent failed read or write.
    last_failure: Option<TransportError>,
}

impl<C: BleConnection> BleTransport<C> {
    /// Finish setup on `handle`. On success the stream owns it; on failure it
    /// is returned untouched apart from whatever the backend did.
    pub fn adopt(
        mut handle: TransportHandle<C>,
        config: TransportConfig,
    ) -> Result<Self, Rejected<C>> {
        if let Err(error) = handle.start_streaming() {
            return Err(Rejected { error, handle });
        }
        let name = handle.connection.as_ref().and_then(|c| c.name());
        Ok(Self {
            handle: Some(handle),
            name,
            config,
            last_failure: None,
        })
    }

    /// Connect, discover, subscribe. Any failure releases the connection
    /// exactly once before returning.
    pub fn connect<B>(
        central: &mut B,
        address: &str,
        config: TransportConfig,
    ) -> Result<Self, TransportError>
    where
        B: BleCentral<Connection = C>,
    {
        let connection = central.connect(address)?;
        let handle = TransportHandle::bind(connection);
        match Self::adopt(handle, config) {
            Ok(transport) => {
                info!("BLE stream ready on {address}");
                Ok(transport)
            }
            Err(Rejected { error, mut handle }) => {
                warn!("BLE setup on {address} failed: {error}");
                if let Err(e) = handle.release() {
                    warn!("disconnect after failed setup: {e}");
                }
                Err(error)
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn timeout(&self) -> Option<ReadTimeout> {
        self.handle.as_ref().map(|h| h.timeout)
    }

    /// Why the last read or write failed, if it did. The engine only sees
    /// a status code; this keeps the transport-level cause.
    pub fn take_failure(&mut self) -> Option<TransportError> {
        self.last_failure.take()
    }

    fn handle(&self) -> Result<&TransportHandle<C>, Status> {
        self.handle.as_ref().ok_or(Status::Io)
    }

    fn record(&mut self, result: Result<usize, TransportError>) -> Result<usize, Status> {
        match result {
            Ok(n) => {
                self.last_failure = None;
                Ok(n)
            }
            Err(e) => {
                let status = match e {
                    TransportError::ReadTimeout => Status::Timeout,
                    _ => Status::Io,
                };
                self.last_failure = Some(e);
                Err(status)
            }
        }
    }

    fn fill(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let handle = self.handle.as_ref().ok_or(TransportError::Closed)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let start = Instant::now();
        let deadline = match handle.timeout {
            ReadTimeout::Unbounded => None,
            ReadTimeout::Bounded(d) => Some(start + d.min(self.config.full_read_timeout())),
        };
        let partial = self.config.partial_read_timeout();
        let poll = self.config.poll_interval();

        let mut actual = 0;
        let mut last_progress = start;
        loop {
            let n = handle.buffer.take_into(&mut buf[actual..]);
            let now = Instant::now();
            if n > 0 {
                actual += n;
                last_progress = now;
                if actual == buf.len() {
                    return Ok(actual);
                }
            }

            if actual > 0 && now.duration_since(last_progress) >= partial {
                debug!("partial read: {actual} of {} bytes", buf.len());
                return Ok(actual);
            }
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return if actual > 0 { Ok(actual) } else { Err(TransportError::ReadTimeout) };
                }
            }
            if n == 0 && handle.buffer.link_lost() {
                return if actual > 0 { Ok(actual) } else { Err(TransportError::ConnectionLost) };
            }

            let mut nap = poll;
            if let Some(deadline) = deadline {
                nap = nap.min(deadline.saturating_duration_since(now));
            }
            if n == 0 {
                thread::sleep(nap);
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let handle = self.handle.as_mut().ok_or(TransportError::Closed)?;
        if handle.buffer.link_lost() {
            return Err(TransportError::ConnectionLost);
        }
        let connection = handle.connection_mut()?;
        match connection.write_without_response(data) {
            Ok(()) => Ok(data.len()),
            Err(BleError::Disconnected) => Err(TransportError::ConnectionLost),
            Err(e) => {
                warn!("BLE write of {} bytes rejected: {e}", data.len());
                Err(TransportError::WriteRejected(e.to_string()))
            }
        }
    }
}

impl<C: BleConnection> Stream for BleTransport<C> {
    fn set_timeout(&mut self, timeout_ms: i32) -> Result<(), Status> {
        let timeout = ReadTimeout::from_millis(timeout_ms)?;
        let handle = self.handle.as_mut().ok_or(Status::Io)?;
        handle.timeout = timeout;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
        let result = self.fill(buf);
        self.record(result)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Status> {
        let result = self.send(data);
        self.record(result)
    }

    fn ioctl(&mut self, request: IoctlRequest, data: &mut Vec<u8>) -> Result<(), Status> {
        self.handle()?;
        match request {
            IoctlRequest::BleGetName => {
                let name = self.name.as_deref().ok_or(Status::Unsupported)?;
                data.clear();
                data.extend_from_slice(name.as_bytes());
                Ok(())
            }
            _ => Err(Status::Unsupported),
        }
    }

    fn sleep(&mut self, milliseconds: u32) -> Result<(), Status> {
        thread::sleep(Duration::from_millis(u64::from(milliseconds)));
        Ok(())
    }

    fn close(&mut self) -> Result<(), Status> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        handle.release().map_err(|e| {
            warn!("BLE disconnect failed: {e}");
            Status::Io
        })
    }
}
