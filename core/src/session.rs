//! Connection session lifecycle.
//!
//! ```text
//! Unopened -> Connecting -> Streaming -> Closed
//!                  \
//!                   -> OpenFailed
//! ```
//!
//! A session exclusively owns the engine context, the BLE stream and the
//! opened device. They are released together, in reverse allocation order,
//! on close or on any failed open step. No state is re-enterable.

use std::ops::ControlFlow;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::ble::{BleCentral, BleConnection};
use crate::config::TransportConfig;
use crate::decoder::RecordDecoder;
use crate::engine::{
    Clock, Descriptor, DevInfo, Device, DeviceEvent, Engine, EventMask, Progress, RawDive, Status,
};
use crate::error::{HandshakeError, RetrievalError};
use crate::transport::{BleTransport, Stream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Connecting,
    Streaming,
    Closed,
    OpenFailed,
}

/// Latest device events seen on this session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventSnapshot {
    pub devinfo: Option<DevInfo>,
    pub progress: Option<Progress>,
    pub clock: Option<Clock>,
}

impl EventSnapshot {
    fn record(&mut self, event: &DeviceEvent) {
        match event {
            DeviceEvent::DevInfo(info) => {
                debug!(
                    "device info: model {} firmware {} serial {}",
                    info.model, info.firmware, info.serial
                );
                self.devinfo = Some(*info);
            }
            DeviceEvent::Progress(progress) => self.progress = Some(*progress),
            DeviceEvent::Clock(clock) => self.clock = Some(*clock),
            DeviceEvent::Waiting => {}
        }
    }
}

pub const SESSION_EVENTS: EventMask = EventMask::DEVINFO
    .union(EventMask::PROGRESS)
    .union(EventMask::CLOCK);

pub struct ConnectionSession<E: Engine, C: BleConnection> {
    engine: Arc<E>,
    descriptor: Descriptor,
    config: TransportConfig,
    state: SessionState,
    address: Option<String>,
    context: Option<E::Context>,
    transport: Option<BleTransport<C>>,
    device: Option<E::Device>,
    events: Arc<Mutex<EventSnapshot>>,
}

impl<E: Engine, C: BleConnection> ConnectionSession<E, C> {
    pub fn new(engine: Arc<E>, descriptor: Descriptor, config: TransportConfig) -> Self {
        Self {
            engine,
            descriptor,
            config,
            state: SessionState::Unopened,
            address: None,
            context: None,
            transport: None,
            device: None,
            events: Arc::new(Mutex::new(EventSnapshot::default())),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn events(&self) -> EventSnapshot {
        *self.events.lock()
    }

    pub(crate) fn event_handle(&self) -> Arc<Mutex<EventSnapshot>> {
        Arc::clone(&self.events)
    }

    /// Drive `Unopened` to `Streaming`. On any failure every allocated
    /// resource is released and the session ends in `OpenFailed`.
    pub fn open<B>(&mut self, central: &mut B, address: &str) -> Result<(), HandshakeError>
    where
        B: BleCentral<Connection = C>,
    {
        if self.state != SessionState::Unopened {
            return Err(HandshakeError::InvalidState(
                self.state,
                SessionState::Unopened,
            ));
        }
        self.state = SessionState::Connecting;
        self.address = Some(address.to_string());
        info!(
            "opening {} {} at {address}",
            self.descriptor.vendor, self.descriptor.product
        );

        match self.try_open(central, address) {
            Ok(()) => {
                self.state = SessionState::Streaming;
                info!("session streaming on {address}");
                Ok(())
            }
            Err(e) => {
                error!("open of {address} failed: {e}");
                if let Err(status) = self.release_all() {
                    warn!("cleanup after failed open: {status}");
                }
                self.state = SessionState::OpenFailed;
                Err(e)
            }
        }
    }

    fn try_open<B>(&mut self, central: &mut B, address: &str) -> Result<(), HandshakeError>
    where
        B: BleCentral<Connection = C>,
    {
        let context = self
            .context
            .insert(self.engine.new_context().map_err(HandshakeError::Context)?);

        let transport = BleTransport::connect(central, address, self.config.clone())?;
        let transport = self.transport.insert(transport);

        let device = self
            .engine
            .open(context, &self.descriptor, transport)
            .map_err(HandshakeError::DeviceOpen)?;
        let device = self.device.insert(device);

        let events = Arc::clone(&self.events);
        device
            .set_events(
                SESSION_EVENTS,
                Box::new(move |event| events.lock().record(event)),
            )
            .map_err(HandshakeError::Events)?;
        Ok(())
    }

    /// Device, then transport, then context. Every step runs even if an
    /// earlier one failed; the first failure is returned.
    fn release_all(&mut self) -> Result<(), Status> {
        let mut first_error = None;

        if let Some(device) = self.device.take() {
            let result = match self.transport.as_mut() {
                Some(transport) => device.close(transport),
                None => Ok(()),
            };
            if let Err(status) = result {
                warn!("device close failed: {status}");
                first_error.get_or_insert(status);
            }
        }
        if let Some(mut transport) = self.transport.take() {
            if let Err(status) = transport.close() {
                first_error.get_or_insert(status);
            }
        }
        if self.context.take().is_some() {
            debug!("engine context released");
        }

        match first_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    /// Release everything. Idempotent; a failed open stays `OpenFailed`.
    pub fn close(&mut self) -> Result<(), Status> {
        match self.state {
            SessionState::Closed | SessionState::OpenFailed => Ok(()),
            _ => {
                let result = self.release_all();
                self.state = SessionState::Closed;
                info!(
                    "session closed{}",
                    self.address
                        .as_deref()
                        .map(|a| format!(" on {a}"))
                        .unwrap_or_default()
                );
                result
            }
        }
    }

    pub fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), Status> {
        let device = self.device.as_mut().ok_or(Status::InvalidArgs)?;
        device.set_fingerprint(fingerprint)
    }

    /// Run the engine's directory walk, handing each entry together with a
    /// decoder bound to this session's context.
    pub(crate) fn walk_dives(
        &mut self,
        callback: &mut dyn FnMut(&RecordDecoder<'_, E>, RawDive<'_>) -> ControlFlow<()>,
    ) -> Result<Result<(), Status>, RetrievalError> {
        if self.state != SessionState::Streaming {
            return Err(RetrievalError::NotStreaming(self.state));
        }
        let (Some(device), Some(transport), Some(context)) = (
            self.device.as_mut(),
            self.transport.as_mut(),
            self.context.as_ref(),
        ) else {
            return Err(RetrievalError::NotStreaming(self.state));
        };

        let decoder = RecordDecoder::new(&*self.engine, context, &self.descriptor);
        let stream: &mut dyn Stream = &mut *transport;
        let walk = device.foreach(stream, &mut |raw| callback(&decoder, raw));
        match walk {
            Err(Status::Io | Status::Timeout) => match transport.take_failure() {
                Some(cause) => Err(RetrievalError::Transport(cause)),
                None => Ok(walk),
            },
            _ => {
                transport.take_failure();
                Ok(walk)
            }
        }
    }
}

impl<E: Engine, C: BleConnection> Drop for ConnectionSession<E, C> {
    fn drop(&mut self) {
        if let Err(status) = self.close() {
            warn!("session close during drop failed: {status}");
        }
    }
}
