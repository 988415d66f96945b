use std::path::PathBuf;

use thiserror::Error;

use crate::ble::BleError;
use crate::engine::Status;
use crate::models::Fingerprint;
use crate::session::SessionState;

/// Failures of the BLE byte pipe.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("BLE error: {0}")]
    Ble(#[from] BleError),

    #[error("connection lost")]
    ConnectionLost,

    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("read timed out")]
    ReadTimeout,

    #[error("transport already closed")]
    Closed,
}

/// Failures while bringing a session from `Connecting` to `Streaming`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandshakeError {
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),

    #[error("could not allocate engine context: {0}")]
    Context(Status),

    #[error("device open handshake failed: {0}")]
    DeviceOpen(Status),

    #[error("event subscription failed: {0}")]
    Events(Status),

    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    #[error("session is {0:?}, expected {1:?}")]
    InvalidState(SessionState, SessionState),
}

/// The engine reported a failure while walking the dive directory.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("enumeration failed: {status}")]
pub struct ProtocolError {
    pub status: Status,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    #[error("parser creation")]
    Create,
    #[error("datetime")]
    DateTime,
    #[error("field extraction")]
    Field,
    #[error("sample extraction")]
    Samples,
}

/// A single dive could not be decoded.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("dive {index} (fingerprint {fingerprint}) failed at {stage}: {status}")]
pub struct DecodeError {
    /// 1-based position in the retrieval, newest dive = 1.
    pub index: u32,
    pub fingerprint: Fingerprint,
    pub stage: DecodeStage,
    pub status: Status,
}

#[derive(Error, Debug, uniffi::Error)]
#[uniffi(flat_error)]
pub enum PersistenceError {
    #[error("store I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store document is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("invalid store key: {0}")]
    InvalidKey(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("invalid configuration: {0}")]
    Invalid(Box<figment::Error>),
}

/// Anything that ends a retrieval early.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetrievalError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("session is not streaming ({0:?})")]
    NotStreaming(SessionState),

    #[error("retrieval worker panicked")]
    WorkerPanicked,
}
