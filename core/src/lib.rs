pub mod ble;
#[cfg(feature = "btleplug")]
pub mod ble_btleplug;
pub mod ble_mock;
pub mod buffer;
pub mod config;
pub mod decoder;
pub mod descriptor;
pub mod engine;
pub mod engine_mock;
pub mod enumerator;
pub mod error;
pub mod ffi;
pub mod models;
pub mod retrieval;
pub mod session;
pub mod storage;
pub mod transport;

uniffi::setup_scaffolding!();

pub use ble::{BleCentral, BleConnection, BleDeviceInfo, BleError};
pub use buffer::{NotificationBuffer, NotificationSink};
pub use config::Config;
pub use engine::{Descriptor, Device, Engine, Parser, Status};
pub use enumerator::{CancelToken, Outcome, RetrievalProgress, RetrievalReport, StopReason};
pub use error::{
    DecodeError, HandshakeError, PersistenceError, ProtocolError, RetrievalError, TransportError,
};
pub use models::{DiveData, Fingerprint, StoredFingerprint};
pub use retrieval::{DiveLogRetriever, RetrievalHandle};
pub use session::{ConnectionSession, SessionState};
pub use storage::{DeviceStore, FingerprintStore, JsonFileStore, MemoryStore};
pub use transport::{BleTransport, Stream};
