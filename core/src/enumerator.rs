//! Dive directory walk with fingerprint early stop.
//!
//! The engine reports stored dives newest first. The walk stops at the first
//! dive whose fingerprint equals the one stored for this device: everything
//! older was retrieved by an earlier session. Only a walk that completes
//! persists a new fingerprint, and it is always the newest dive's.

use std::cell::OnceCell;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::ble::BleConnection;
use crate::descriptor;
use crate::engine::{DevInfo, Engine, Status};
use crate::error::{DecodeError, ProtocolError, RetrievalError};
use crate::models::{DirectoryOrder, DiveData, Fingerprint};
use crate::session::ConnectionSession;
use crate::storage::FingerprintStore;

/// Cooperative cancellation, checked before each dive.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetrievalProgress {
    /// Dives decoded so far in this retrieval.
    pub dives: u32,
    /// Engine-reported transfer progress, in engine units.
    pub current: u32,
    pub maximum: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The engine ended the walk.
    Exhausted,
    ReachedKnownDive,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Completed(StopReason),
    Cancelled,
    Failed(RetrievalError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrievalReport {
    /// Decoded dives in processing order. Kept on failure.
    pub dives: Vec<DiveData>,
    pub outcome: Outcome,
    pub device: Option<DevInfo>,
    pub saved_fingerprint: Option<Fingerprint>,
}

impl RetrievalReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, Outcome::Completed(_))
    }

    pub fn error(&self) -> Option<&RetrievalError> {
        match &self.outcome {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

pub struct DiveEnumerator<'a, S: FingerprintStore + ?Sized> {
    store: &'a Mutex<S>,
    cancel: CancelToken,
    order: Option<DirectoryOrder>,
}

impl<'a, S: FingerprintStore + ?Sized> DiveEnumerator<'a, S> {
    pub fn new(store: &'a Mutex<S>, cancel: CancelToken) -> Self {
        Self {
            store,
            cancel,
            order: None,
        }
    }

    /// Override the family's directory order.
    pub fn with_order(mut self, order: DirectoryOrder) -> Self {
        self.order = Some(order);
        self
    }

    fn lookup(&self, device_type: &str, serial: u32) -> Option<Fingerprint> {
        match self.store.lock().lookup(device_type, serial) {
            Ok(Some(stored)) => {
                debug!("stored fingerprint for {device_type}/{serial}: {}", hex::encode(&stored.fingerprint));
                Some(Fingerprint::new(stored.fingerprint))
            }
            Ok(None) => {
                debug!("no stored fingerprint for {device_type}/{serial}");
                None
            }
            Err(e) => {
                warn!("fingerprint store unreadable, retrieving everything: {e}");
                None
            }
        }
    }

    fn persist(&self, device_type: &str, serial: u32, fingerprint: Fingerprint) -> Option<Fingerprint> {
        match self.store.lock().save(device_type, serial, fingerprint.as_bytes()) {
            Ok(()) => {
                info!("stored fingerprint {fingerprint} for {device_type}/{serial}");
                Some(fingerprint)
            }
            Err(e) => {
                warn!("could not persist fingerprint for {device_type}/{serial}: {e}");
                None
            }
        }
    }

    pub fn run<E: Engine, C: BleConnection>(
        &self,
        session: &mut ConnectionSession<E, C>,
        on_progress: &mut dyn FnMut(RetrievalProgress),
    ) -> RetrievalReport {
        let device_type = descriptor::device_type(session.descriptor());
        let order = self
            .order
            .unwrap_or_else(|| session.descriptor().family.directory_order());
        let events = session.event_handle();
        let known: OnceCell<Option<Fingerprint>> = OnceCell::new();

        if self.cancel.is_cancelled() {
            return RetrievalReport {
                dives: Vec::new(),
                outcome: Outcome::Cancelled,
                device: session.events().devinfo,
                saved_fingerprint: None,
            };
        }

        if let Some(info) = session.events().devinfo {
            let stored = known.get_or_init(|| self.lookup(&device_type, info.serial));
            if let (DirectoryOrder::NewestFirst, Some(fingerprint)) = (order, stored) {
                match session.set_fingerprint(fingerprint.as_bytes()) {
                    Ok(()) | Err(Status::Unsupported) => {}
                    Err(status) => warn!("engine refused fingerprint: {status}"),
                }
            }
        }

        let mut dives = Vec::new();
        let mut newest: Option<Fingerprint> = None;
        let mut decode_error: Option<DecodeError> = None;
        let mut cancelled = false;
        let mut reached_known = false;
        let mut index = 0u32;

        let walk = session.walk_dives(&mut |decoder, raw| {
            if self.cancel.is_cancelled() {
                info!("retrieval cancelled after {index} dives");
                cancelled = true;
                return ControlFlow::Break(());
            }
            let fingerprint = Fingerprint::new(raw.fingerprint);

            let stored = known.get_or_init(|| match events.lock().devinfo {
                Some(info) => self.lookup(&device_type, info.serial),
                None => {
                    warn!("device reported no serial, dedup disabled");
                    None
                }
            });
            if order == DirectoryOrder::NewestFirst && stored.as_ref() == Some(&fingerprint) {
                info!("reached known dive {fingerprint}, stopping");
                reached_known = true;
                return ControlFlow::Break(());
            }

            index += 1;
            if newest.is_none() || order == DirectoryOrder::OldestFirst {
                newest = Some(fingerprint);
            }
            match decoder.decode(index, raw) {
                Ok(dive) => {
                    dives.push(dive);
                    let engine = events.lock().progress.unwrap_or_default();
                    on_progress(RetrievalProgress {
                        dives: index,
                        current: engine.current,
                        maximum: engine.maximum,
                    });
                    ControlFlow::Continue(())
                }
                Err(e) => {
                    warn!("{e}");
                    decode_error = Some(e);
                    ControlFlow::Break(())
                }
            }
        });

        let outcome = match (walk, decode_error) {
            (Err(e), _) => Outcome::Failed(e),
            (Ok(_), Some(e)) => Outcome::Failed(RetrievalError::Decode(e)),
            (Ok(_), None) if cancelled => Outcome::Cancelled,
            (Ok(Ok(())), None) => Outcome::Completed(if reached_known {
                StopReason::ReachedKnownDive
            } else {
                StopReason::Exhausted
            }),
            (Ok(Err(Status::Cancelled)), None) if reached_known => {
                Outcome::Completed(StopReason::ReachedKnownDive)
            }
            (Ok(Err(status)), None) => {
                warn!("engine ended the walk with {status}");
                Outcome::Failed(RetrievalError::Protocol(ProtocolError { status }))
            }
        };

        let device = events.lock().devinfo;
        let newest = newest.filter(|fingerprint| !fingerprint.is_empty());
        let saved_fingerprint = match (&outcome, newest, device) {
            (Outcome::Completed(_), Some(fingerprint), Some(info)) => {
                self.persist(&device_type, info.serial, fingerprint)
            }
            _ => None,
        };

        info!(
            "retrieval finished: {} new dives, outcome {outcome:?}",
            dives.len()
        );
        RetrievalReport {
            dives,
            outcome,
            device,
            saved_fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::{MockBleCentral, MockConnection, MockLink};
    use crate::config::TransportConfig;
    use crate::engine_mock::{DevInfoTiming, MockDive, MockEngine, MockEngineConfig};
    use crate::error::{DecodeStage, PersistenceError, TransportError};
    use crate::models::StoredFingerprint;
    use crate::storage::MemoryStore;

    const DEVICE_TYPE: &str = "shearwater-perdix";

    fn open(config: MockEngineConfig) -> (ConnectionSession<MockEngine, MockConnection>, Arc<MockEngine>) {
        let link = MockLink::new();
        let script = MockEngine::handshake_script(&config, link);
        let engine = Arc::new(MockEngine::new(config));
        let mut central = MockBleCentral::new();
        central.add_device("AA:BB", "Perdix 2", script);

        let descriptor = engine.descriptors()[0].clone();
        let transport = TransportConfig {
            full_read_timeout_ms: 2_000,
            partial_read_timeout_ms: 200,
            poll_interval_ms: 1,
        };
        let mut session = ConnectionSession::new(Arc::clone(&engine), descriptor, transport);
        session.open(&mut central, "AA:BB").unwrap();
        (session, engine)
    }

    fn five_dives() -> MockEngineConfig {
        MockEngineConfig {
            dives: MockDive::history(5),
            ..MockEngineConfig::default()
        }
    }

    fn fingerprints(dives: &[DiveData]) -> Vec<Vec<u8>> {
        dives.iter().map(|d| d.fingerprint.clone()).collect()
    }

    #[test]
    fn test_stops_at_known_dive() {
        let config = five_dives();
        let serial = config.serial;
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());
        store.lock().save(DEVICE_TYPE, serial, &[0xF3]).unwrap();

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.outcome, Outcome::Completed(StopReason::ReachedKnownDive));
        assert_eq!(fingerprints(&report.dives), vec![vec![0xF5], vec![0xF4]]);
        assert_eq!(report.saved_fingerprint, Some(Fingerprint::new(vec![0xF5])));
        let stored = store.lock().lookup(DEVICE_TYPE, serial).unwrap().unwrap();
        assert_eq!(stored.fingerprint, vec![0xF5]);
    }

    #[test]
    fn test_retrieves_everything_without_stored_fingerprint() {
        let (mut session, _engine) = open(five_dives());
        let store = Mutex::new(MemoryStore::new());

        let mut progress = Vec::new();
        let report = DiveEnumerator::new(&store, CancelToken::new())
            .run(&mut session, &mut |p| progress.push(p.dives));

        assert_eq!(report.outcome, Outcome::Completed(StopReason::Exhausted));
        assert_eq!(report.dives.len(), 5);
        assert_eq!(report.dives[0].number, 1);
        assert_eq!(report.dives[0].fingerprint, vec![0xF5]);
        assert_eq!(report.dives[4].fingerprint, vec![0xF1]);
        assert_eq!(progress, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.saved_fingerprint, Some(Fingerprint::new(vec![0xF5])));
    }

    #[test]
    fn test_decode_failure_keeps_earlier_dives() {
        let mut config = five_dives();
        config.dives[1].fail_samples = true;
        let serial = config.serial;
        let (mut session, engine) = open(config);
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(fingerprints(&report.dives), vec![vec![0xF5]]);
        match report.error() {
            Some(RetrievalError::Decode(e)) => {
                assert_eq!(e.index, 2);
                assert_eq!(e.fingerprint, Fingerprint::new(vec![0xF4]));
                assert_eq!(e.stage, DecodeStage::Samples);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.saved_fingerprint, None);
        assert!(store.lock().lookup(DEVICE_TYPE, serial).unwrap().is_none());
        assert_eq!(engine.counters().parsers_live(), 0);
        assert_eq!(session.state(), crate::session::SessionState::Streaming);
    }

    #[test]
    fn test_protocol_failure_persists_nothing() {
        let config = MockEngineConfig {
            fail_download_at: Some(2),
            ..five_dives()
        };
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.dives.len(), 2);
        assert_eq!(
            report.outcome,
            Outcome::Failed(RetrievalError::Protocol(ProtocolError { status: Status::Io }))
        );
        assert!(store.lock().entries().unwrap().is_empty());
    }

    #[test]
    fn test_link_loss_is_a_transport_failure() {
        let config = five_dives();
        let link = MockLink::new();
        let mut engine_responder = MockEngine::responder(&config);
        let dropper = link.clone();
        let responder: crate::ble_mock::Responder = Box::new(move |request: &[u8]| {
            if request == [b'G', 2] {
                dropper.lose_link();
                return Vec::new();
            }
            engine_responder(request)
        });
        let engine = Arc::new(MockEngine::new(config));
        let mut central = MockBleCentral::new();
        central.add_device("AA:BB", "Perdix 2", crate::ble_mock::MockScript::with_responder(link, responder));
        let descriptor = engine.descriptors()[0].clone();
        let transport = TransportConfig {
            full_read_timeout_ms: 2_000,
            partial_read_timeout_ms: 200,
            poll_interval_ms: 1,
        };
        let mut session = ConnectionSession::new(Arc::clone(&engine), descriptor, transport);
        session.open(&mut central, "AA:BB").unwrap();
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.dives.len(), 2);
        assert_eq!(
            report.outcome,
            Outcome::Failed(RetrievalError::Transport(TransportError::ConnectionLost))
        );
        assert!(store.lock().entries().unwrap().is_empty());
    }

    #[test]
    fn test_empty_newest_fingerprint_is_not_reported_saved() {
        let mut config = five_dives();
        config.dives[0].fingerprint = Vec::new();
        let serial = config.serial;
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.outcome, Outcome::Completed(StopReason::Exhausted));
        assert_eq!(report.dives.len(), 5);
        assert_eq!(report.saved_fingerprint, None);
        assert!(store.lock().lookup(DEVICE_TYPE, serial).unwrap().is_none());
    }

    #[test]
    fn test_cancel_between_dives() {
        let (mut session, _engine) = open(five_dives());
        let store = Mutex::new(MemoryStore::new());
        let cancel = CancelToken::new();

        let enumerator = DiveEnumerator::new(&store, cancel.clone());
        let report = enumerator.run(&mut session, &mut |p| {
            if p.dives == 2 {
                cancel.cancel();
            }
        });

        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(report.dives.len(), 2);
        assert!(store.lock().entries().unwrap().is_empty());
    }

    #[test]
    fn test_cancelled_before_start() {
        let (mut session, engine) = open(five_dives());
        let store = Mutex::new(MemoryStore::new());
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = DiveEnumerator::new(&store, cancel).run(&mut session, &mut |_| {});
        assert_eq!(report.outcome, Outcome::Cancelled);
        assert_eq!(engine.counters().parsers_created(), 0);
    }

    #[test]
    fn test_no_new_dives() {
        let config = five_dives();
        let serial = config.serial;
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());
        store.lock().save(DEVICE_TYPE, serial, &[0xF5]).unwrap();

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.outcome, Outcome::Completed(StopReason::ReachedKnownDive));
        assert!(report.dives.is_empty());
        assert_eq!(report.saved_fingerprint, None);
        assert_eq!(
            store.lock().lookup(DEVICE_TYPE, serial).unwrap().unwrap().fingerprint,
            vec![0xF5]
        );
    }

    #[test]
    fn test_early_devinfo_hands_fingerprint_to_engine() {
        let config = MockEngineConfig {
            devinfo: DevInfoTiming::OnSubscribe,
            honor_fingerprint: true,
            ..five_dives()
        };
        let serial = config.serial;
        let (mut session, engine) = open(config);
        let store = Mutex::new(MemoryStore::new());
        store.lock().save(DEVICE_TYPE, serial, &[0xF2]).unwrap();

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        // the engine stopped on its own before handing F2 over
        assert_eq!(report.outcome, Outcome::Completed(StopReason::Exhausted));
        assert_eq!(report.dives.len(), 3);
        assert_eq!(engine.counters().parsers_created(), 3);
        assert_eq!(report.saved_fingerprint, Some(Fingerprint::new(vec![0xF5])));
    }

    #[test]
    fn test_missing_serial_disables_dedup() {
        let config = MockEngineConfig {
            devinfo: DevInfoTiming::Never,
            ..five_dives()
        };
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.dives.len(), 5);
        assert_eq!(report.device, None);
        assert_eq!(report.saved_fingerprint, None);
        assert!(store.lock().entries().unwrap().is_empty());
    }

    struct BrokenStore;

    impl FingerprintStore for BrokenStore {
        fn lookup(&self, _: &str, _: u32) -> Result<Option<StoredFingerprint>, PersistenceError> {
            Err(PersistenceError::InvalidKey("broken".into()))
        }

        fn save(&mut self, _: &str, _: u32, _: &[u8]) -> Result<(), PersistenceError> {
            Err(PersistenceError::InvalidKey("broken".into()))
        }

        fn forget(&mut self, _: &str, _: u32) -> Result<bool, PersistenceError> {
            Ok(false)
        }

        fn entries(&self) -> Result<Vec<StoredFingerprint>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_unreadable_store_is_not_fatal() {
        let (mut session, _engine) = open(five_dives());
        let store = Mutex::new(BrokenStore);

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});

        assert_eq!(report.outcome, Outcome::Completed(StopReason::Exhausted));
        assert_eq!(report.dives.len(), 5);
        assert_eq!(report.saved_fingerprint, None);
    }

    #[test]
    fn test_oldest_first_order_walks_everything() {
        let mut config = five_dives();
        config.dives.reverse();
        let serial = config.serial;
        let (mut session, _engine) = open(config);
        let store = Mutex::new(MemoryStore::new());
        store.lock().save(DEVICE_TYPE, serial, &[0xF3]).unwrap();

        let report = DiveEnumerator::new(&store, CancelToken::new())
            .with_order(DirectoryOrder::OldestFirst)
            .run(&mut session, &mut |_| {});

        assert_eq!(report.dives.len(), 5);
        assert_eq!(report.saved_fingerprint, Some(Fingerprint::new(vec![0xF5])));
    }

    #[test]
    fn test_closed_session_is_rejected() {
        let (mut session, _engine) = open(five_dives());
        session.close().unwrap();
        let store = Mutex::new(MemoryStore::new());

        let report = DiveEnumerator::new(&store, CancelToken::new()).run(&mut session, &mut |_| {});
        assert!(matches!(report.outcome, Outcome::Failed(RetrievalError::NotStreaming(_))));
    }
}
