//! Caller-facing API: scan, connect, retrieve, forget.
//!
//! Retrieval runs the engine on a worker thread. Progress and completion are
//! forwarded through a channel to a dispatcher thread, so a slow observer
//! never stalls the engine's reads.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::ble::{BleCentral, BleConnection, BleDeviceInfo, BleError};
use crate::config::Config;
use crate::descriptor::identify;
use crate::engine::Engine;
use crate::enumerator::{CancelToken, DiveEnumerator, RetrievalProgress, RetrievalReport};
use crate::error::{HandshakeError, PersistenceError, RetrievalError};
use crate::models::DeviceIdentity;
use crate::session::ConnectionSession;
use crate::storage::{connection_uuid, DeviceStore, FingerprintStore, JsonFileStore};

pub type Session<E, B> = ConnectionSession<E, <B as BleCentral>::Connection>;

enum Dispatch {
    Progress(RetrievalProgress),
    Complete(RetrievalReport),
}

/// A retrieval running in the background.
pub struct RetrievalHandle<E: Engine, C: BleConnection> {
    cancel: CancelToken,
    worker: JoinHandle<ConnectionSession<E, C>>,
    dispatcher: JoinHandle<()>,
}

impl<E: Engine, C: BleConnection> RetrievalHandle<E, C> {
    /// Stop before the next dive. Dives already decoded are still reported.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished() && self.dispatcher.is_finished()
    }

    /// Wait for the worker and for every callback to run, then hand the
    /// session back for another retrieval or for closing.
    pub fn join(self) -> Result<ConnectionSession<E, C>, RetrievalError> {
        let session = self.worker.join().map_err(|_| RetrievalError::WorkerPanicked)?;
        if self.dispatcher.join().is_err() {
            warn!("retrieval observer panicked");
        }
        Ok(session)
    }
}

pub struct DiveLogRetriever<E, B, S>
where
    E: Engine,
    B: BleCentral,
    S: FingerprintStore + DeviceStore,
{
    engine: Arc<E>,
    central: B,
    store: Arc<Mutex<S>>,
    config: Config,
    seen: HashMap<String, BleDeviceInfo>,
}

impl<E, B> DiveLogRetriever<E, B, JsonFileStore>
where
    E: Engine + 'static,
    B: BleCentral,
    B::Connection: 'static,
{
    /// Retriever backed by the JSON store at `config.storage.path`.
    pub fn from_config(engine: Arc<E>, central: B, config: Config) -> Self {
        let store = JsonFileStore::open(&config.storage.path);
        Self::new(engine, central, Arc::new(Mutex::new(store)), config)
    }
}

impl<E, B, S> DiveLogRetriever<E, B, S>
where
    E: Engine + 'static,
    B: BleCentral,
    B::Connection: 'static,
    S: FingerprintStore + DeviceStore + Send + 'static,
{
    pub fn new(engine: Arc<E>, central: B, store: Arc<Mutex<S>>, config: Config) -> Self {
        Self {
            engine,
            central,
            store,
            config,
            seen: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<Mutex<S>> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Scan and remember advertised names for [`connect`](Self::connect).
    /// Only peripherals a descriptor matches are returned.
    pub fn scan(&mut self) -> Result<Vec<BleDeviceInfo>, BleError> {
        let found = self.central.scan(self.config.ble.scan_timeout())?;
        let descriptors = self.engine.descriptors();
        let mut supported = Vec::new();
        for device in found {
            if identify(&device.name, &descriptors).is_ok() {
                supported.push(device.clone());
            } else {
                debug!("ignoring unsupported peripheral {:?}", device.name);
            }
            self.seen.insert(device.address.clone(), device);
        }
        info!("scan found {} supported dive computers", supported.len());
        Ok(supported)
    }

    fn advertised_name(&self, address: &str, id: &Uuid) -> Option<String> {
        if let Some(device) = self.seen.get(address) {
            return Some(device.name.clone());
        }
        match self.store.lock().device(id) {
            Ok(identity) => identity.map(|i| i.name),
            Err(e) => {
                warn!("device store unreadable: {e}");
                None
            }
        }
    }

    /// Identify, connect and run the device handshake.
    pub fn connect(&mut self, address: &str) -> Result<Session<E, B>, HandshakeError> {
        let id = connection_uuid(address);
        let name = self
            .advertised_name(address, &id)
            .ok_or_else(|| HandshakeError::UnsupportedDevice(address.to_string()))?;
        let descriptor = identify(&name, &self.engine.descriptors())?.clone();

        let mut session = ConnectionSession::new(
            Arc::clone(&self.engine),
            descriptor.clone(),
            self.config.transport.clone(),
        );
        session.open(&mut self.central, address)?;

        let identity = DeviceIdentity {
            name,
            family: descriptor.family,
            model: descriptor.model,
            last_connected_unix: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.store.lock().record_device(id, identity) {
            warn!("could not record device {address}: {e}");
        }
        Ok(session)
    }

    /// Run a retrieval on the calling thread.
    pub fn retrieve(
        &self,
        session: &mut Session<E, B>,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(RetrievalProgress),
    ) -> RetrievalReport {
        DiveEnumerator::new(&*self.store, cancel.clone()).run(session, on_progress)
    }

    /// Run a retrieval in the background. Callbacks run on a dispatcher
    /// thread, in order, and `on_complete` runs exactly once unless the
    /// worker panics.
    pub fn retrieve_dive_logs<P, F>(
        &self,
        mut session: Session<E, B>,
        mut on_progress: P,
        on_complete: F,
    ) -> RetrievalHandle<E, B::Connection>
    where
        P: FnMut(RetrievalProgress) + Send + 'static,
        F: FnOnce(RetrievalReport) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel::<Dispatch>();

        let dispatcher = thread::spawn(move || {
            let mut on_complete = Some(on_complete);
            for message in rx {
                match message {
                    Dispatch::Progress(progress) => on_progress(progress),
                    Dispatch::Complete(report) => {
                        if let Some(complete) = on_complete.take() {
                            complete(report);
                        }
                    }
                }
            }
        });

        let store = Arc::clone(&self.store);
        let worker_cancel = cancel.clone();
        let worker = thread::spawn(move || {
            let enumerator = DiveEnumerator::new(&*store, worker_cancel);
            let progress_tx = tx.clone();
            let report = enumerator.run(&mut session, &mut |progress| {
                // a gone observer must not stop the walk
                let _ = progress_tx.send(Dispatch::Progress(progress));
            });
            if tx.send(Dispatch::Complete(report)).is_err() {
                warn!("retrieval observer gone before completion");
            }
            session
        });

        RetrievalHandle {
            cancel,
            worker,
            dispatcher,
        }
    }

    /// Drop the stored fingerprint so the next retrieval starts over.
    pub fn forget_device(&self, device_type: &str, serial: u32) -> Result<bool, PersistenceError> {
        let removed = self.store.lock().forget(device_type, serial)?;
        if removed {
            info!("forgot fingerprint for {device_type}/{serial}");
        }
        Ok(removed)
    }

    pub fn known_devices(&self) -> Result<Vec<(Uuid, DeviceIdentity)>, PersistenceError> {
        self.store.lock().devices()
    }

    /// Forget the identity recorded for a connection address.
    pub fn forget_connection(&self, address: &str) -> Result<bool, PersistenceError> {
        self.store.lock().forget_device(&connection_uuid(address))
    }
}
