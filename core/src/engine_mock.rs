//! Scripted protocol engine for driving sessions without hardware.
//!
//! The mock device speaks a tiny request/response protocol over the
//! [`Stream`] it is given, so every dive really crosses the notification
//! buffer and the blocking read path:
//!
//! | request        | reply                                   |
//! |----------------|-----------------------------------------|
//! | `HELLO`        | handshake reply (`OK` when healthy)     |
//! | `LIST`         | one byte, number of stored dives        |
//! | `G` + index    | `u32` LE length, then the dive payload  |
//! | `BYE`          | nothing                                 |
//!
//! A dive payload is `[fingerprint length][fingerprint][JSON body]`.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ble_mock::{MockLink, MockScript, Responder};
use crate::engine::{
    DecoKind, Descriptor, DevInfo, Device, DeviceEvent, DiveDateTime, Engine, EventMask,
    EventSink, FieldType, FieldValue, Parser, Progress, RawDive, Sample, Status,
};
use crate::models::{DecoModel, DecoModelKind, DiveMode, Family, GasMix, GasUsage, Salinity, WaterType};
use crate::transport::{IoctlRequest, Stream};

const HELLO: &[u8] = b"HELLO";
const LIST: &[u8] = b"LIST";
const BYE: &[u8] = b"BYE";
const READY: &[u8] = b"OK";

/// One stored dive, as the mock device keeps it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MockDive {
    #[serde(with = "hex::serde")]
    pub fingerprint: Vec<u8>,
    pub timestamp_unix: i64,
    pub duration_s: u32,
    pub max_depth_m: f64,
    /// One profile point every ten seconds.
    pub depths: Vec<f64>,
    pub temperatures: Vec<f64>,
    /// Report min/max/surface temperature as header fields.
    pub header_temperatures: bool,
    /// (O2, He) fractions.
    pub gas_mixes: Vec<(f64, f64)>,
    /// (point index, kind, time, depth)
    pub deco: Vec<(usize, DecoKind, u32, f64)>,
    /// (point index, mix index)
    pub gas_switches: Vec<(usize, u32)>,
    pub fail_samples: bool,
}

impl MockDive {
    /// A plausible recreational profile.
    pub fn sample(fingerprint: Vec<u8>, timestamp_unix: i64) -> Self {
        Self {
            fingerprint,
            timestamp_unix,
            duration_s: 50,
            max_depth_m: 18.5,
            depths: vec![0.0, 12.0, 18.5, 15.0, 5.0, 0.0],
            temperatures: vec![22.0, 20.0, 18.0, 18.5, 20.0, 21.0],
            header_temperatures: true,
            gas_mixes: vec![(0.32, 0.0), (1.0, 0.0)],
            deco: Vec::new(),
            gas_switches: vec![(0, 0)],
            fail_samples: false,
        }
    }

    /// Dives `count..=1`, newest first, fingerprinted `[0xF0 + n]`.
    pub fn history(count: u8) -> Vec<Self> {
        (1..=count)
            .rev()
            .map(|n| Self::sample(vec![0xF0 + n], 1_704_967_200 + i64::from(n) * 86_400))
            .collect()
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(256);
        payload.push(self.fingerprint.len() as u8);
        payload.extend_from_slice(&self.fingerprint);
        payload.extend(serde_json::to_vec(self).unwrap_or_default());
        payload
    }

    fn from_payload(payload: &[u8]) -> Result<Self, Status> {
        let (_, body) = split_payload(payload)?;
        serde_json::from_slice(body).map_err(|e| {
            debug!("mock payload rejected: {e}");
            Status::DataFormat
        })
    }
}

fn split_payload(payload: &[u8]) -> Result<(&[u8], &[u8]), Status> {
    let (&len, rest) = payload.split_first().ok_or(Status::DataFormat)?;
    let len = usize::from(len);
    if rest.len() < len {
        return Err(Status::DataFormat);
    }
    Ok(rest.split_at(len))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevInfoTiming {
    /// Reported as soon as events are subscribed, before enumeration.
    OnSubscribe,
    /// Reported at the start of the directory walk.
    #[default]
    InForeach,
    Never,
}

#[derive(Clone, Debug)]
pub struct MockEngineConfig {
    pub serial: u32,
    pub firmware: u32,
    /// Newest first.
    pub dives: Vec<MockDive>,
    pub handshake_reply: Vec<u8>,
    pub devinfo: DevInfoTiming,
    pub fail_context: bool,
    pub fail_set_events: bool,
    /// The download of this directory index fails with an I/O error.
    pub fail_download_at: Option<usize>,
    /// Stop natively at the fingerprint passed to `set_fingerprint`.
    pub honor_fingerprint: bool,
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            serial: 123_456,
            firmware: 92,
            dives: Vec::new(),
            handshake_reply: READY.to_vec(),
            devinfo: DevInfoTiming::default(),
            fail_context: false,
            fail_set_events: false,
            fail_download_at: None,
            honor_fingerprint: false,
        }
    }
}

/// Live-object accounting shared by everything the engine hands out.
#[derive(Debug, Default)]
pub struct MockCounters {
    contexts: AtomicUsize,
    devices: AtomicUsize,
    parsers: AtomicUsize,
    parsers_created: AtomicUsize,
    releases: Mutex<Vec<&'static str>>,
}

impl MockCounters {
    pub fn contexts_live(&self) -> usize {
        self.contexts.load(Ordering::SeqCst)
    }

    pub fn devices_live(&self) -> usize {
        self.devices.load(Ordering::SeqCst)
    }

    pub fn parsers_live(&self) -> usize {
        self.parsers.load(Ordering::SeqCst)
    }

    pub fn parsers_created(&self) -> usize {
        self.parsers_created.load(Ordering::SeqCst)
    }

    /// Devices and contexts, in the order they were released.
    pub fn release_log(&self) -> Vec<&'static str> {
        self.releases.lock().clone()
    }
}

pub struct MockEngine {
    config: MockEngineConfig,
    counters: Arc<MockCounters>,
}

impl MockEngine {
    pub fn new(config: MockEngineConfig) -> Self {
        Self {
            config,
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<MockCounters> {
        Arc::clone(&self.counters)
    }

    /// Peripheral script answering the mock protocol for `config`.
    pub fn handshake_script(config: &MockEngineConfig, link: MockLink) -> MockScript {
        MockScript::with_responder(link, Self::responder(config))
    }

    pub fn responder(config: &MockEngineConfig) -> Responder {
        let reply = config.handshake_reply.clone();
        let payloads: Vec<Vec<u8>> = config.dives.iter().map(MockDive::to_payload).collect();
        Box::new(move |request: &[u8]| match request {
            HELLO => vec![reply.clone()],
            LIST => vec![vec![payloads.len() as u8]],
            [b'G', index] => match payloads.get(usize::from(*index)) {
                Some(payload) => {
                    let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
                    frame.extend_from_slice(payload);
                    vec![frame]
                }
                None => Vec::new(),
            },
            _ => Vec::new(),
        })
    }
}

pub struct MockContext {
    counters: Arc<MockCounters>,
}

impl Drop for MockContext {
    fn drop(&mut self) {
        self.counters.contexts.fetch_sub(1, Ordering::SeqCst);
        self.counters.releases.lock().push("context");
    }
}

fn read_exact(stream: &mut dyn Stream, len: usize) -> Result<Vec<u8>, Status> {
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        filled += stream.read(&mut buf[filled..])?;
    }
    Ok(buf)
}

fn write_all(stream: &mut dyn Stream, data: &[u8]) -> Result<(), Status> {
    let n = stream.write(data)?;
    if n != data.len() {
        return Err(Status::Io);
    }
    Ok(())
}

pub struct MockDevice {
    devinfo: DevInfo,
    timing: DevInfoTiming,
    fail_set_events: bool,
    fail_download_at: Option<usize>,
    honor_fingerprint: bool,
    fingerprint: Option<Vec<u8>>,
    events: Option<(EventMask, EventSink)>,
    counters: Arc<MockCounters>,
}

impl MockDevice {
    fn emit(&mut self, event: DeviceEvent) {
        if let Some((mask, sink)) = self.events.as_mut() {
            if mask.contains(event.mask()) {
                sink(&event);
            }
        }
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.counters.devices.fetch_sub(1, Ordering::SeqCst);
        self.counters.releases.lock().push("device");
    }
}

impl Device for MockDevice {
    fn set_events(&mut self, mask: EventMask, sink: EventSink) -> Result<(), Status> {
        if self.fail_set_events {
            return Err(Status::Unsupported);
        }
        self.events = Some((mask, sink));
        if self.timing == DevInfoTiming::OnSubscribe {
            self.emit(DeviceEvent::DevInfo(self.devinfo));
        }
        Ok(())
    }

    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), Status> {
        self.fingerprint = (!fingerprint.is_empty()).then(|| fingerprint.to_vec());
        Ok(())
    }

    fn foreach(
        &mut self,
        stream: &mut dyn Stream,
        callback: &mut dyn FnMut(RawDive<'_>) -> ControlFlow<()>,
    ) -> Result<(), Status> {
        if self.timing == DevInfoTiming::InForeach {
            self.emit(DeviceEvent::DevInfo(self.devinfo));
        }

        write_all(stream, LIST)?;
        let count = usize::from(read_exact(stream, 1)?[0]);
        self.emit(DeviceEvent::Progress(Progress {
            current: 0,
            maximum: count as u32,
        }));

        for index in 0..count {
            if self.fail_download_at == Some(index) {
                debug!("mock device dropping dive {index}");
                return Err(Status::Io);
            }
            write_all(stream, &[b'G', index as u8])?;
            let header = read_exact(stream, 4)?;
            let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let payload = read_exact(stream, len)?;
            let (fingerprint, _) = split_payload(&payload)?;

            if self.honor_fingerprint && self.fingerprint.as_deref() == Some(fingerprint) {
                debug!("mock device reached known dive at index {index}");
                return Ok(());
            }
            self.emit(DeviceEvent::Progress(Progress {
                current: index as u32 + 1,
                maximum: count as u32,
            }));
            trace!("mock device delivering dive {index} ({} bytes)", payload.len());
            if callback(RawDive {
                data: &payload,
                fingerprint,
            })
            .is_break()
            {
                return Ok(());
            }
        }
        Ok(())
    }

    fn close(self, stream: &mut dyn Stream) -> Result<(), Status> {
        write_all(stream, BYE)
    }
}

pub struct MockParser {
    dive: MockDive,
    counters: Arc<MockCounters>,
}

impl Drop for MockParser {
    fn drop(&mut self) {
        self.counters.parsers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Parser for MockParser {
    fn datetime(&self) -> Result<DiveDateTime, Status> {
        let utc = DateTime::from_timestamp(self.dive.timestamp_unix, 0).ok_or(Status::DataFormat)?;
        Ok(DiveDateTime {
            local: utc.naive_utc(),
            utc_offset_s: None,
        })
    }

    fn field(&self, field: FieldType) -> Result<FieldValue, Status> {
        let dive = &self.dive;
        let temps = || {
            if dive.header_temperatures && !dive.temperatures.is_empty() {
                Ok(dive.temperatures.iter().copied())
            } else {
                Err(Status::Unsupported)
            }
        };
        match field {
            FieldType::DiveTime => Ok(FieldValue::Seconds(dive.duration_s)),
            FieldType::MaxDepth => Ok(FieldValue::Meters(dive.max_depth_m)),
            FieldType::AvgDepth => Err(Status::Unsupported),
            FieldType::TemperatureSurface => {
                temps()?.next().map(FieldValue::Celsius).ok_or(Status::Unsupported)
            }
            FieldType::TemperatureMinimum => Ok(FieldValue::Celsius(temps()?.fold(f64::MAX, f64::min))),
            FieldType::TemperatureMaximum => Ok(FieldValue::Celsius(temps()?.fold(f64::MIN, f64::max))),
            FieldType::GasMixCount => Ok(FieldValue::Count(dive.gas_mixes.len() as u32)),
            FieldType::GasMix(i) => {
                let &(oxygen, helium) = dive.gas_mixes.get(i as usize).ok_or(Status::InvalidArgs)?;
                Ok(FieldValue::GasMix(GasMix {
                    oxygen,
                    helium,
                    nitrogen: 1.0 - oxygen - helium,
                    usage: GasUsage::None,
                }))
            }
            FieldType::TankCount => Ok(FieldValue::Count(0)),
            FieldType::Tank(_) => Err(Status::InvalidArgs),
            FieldType::Salinity => Ok(FieldValue::Salinity(Salinity {
                water: WaterType::Salt,
                density: 1025.0,
            })),
            FieldType::Atmospheric => Ok(FieldValue::Bar(1.013)),
            FieldType::DiveMode => Ok(FieldValue::DiveMode(DiveMode::OpenCircuit)),
            FieldType::DecoModel => Ok(FieldValue::DecoModel(DecoModel {
                kind: DecoModelKind::Buhlmann,
                conservatism: 0,
                gf_low: 30,
                gf_high: 70,
            })),
        }
    }

    fn samples(&mut self, callback: &mut dyn FnMut(Sample)) -> Result<(), Status> {
        let dive = &self.dive;
        for (i, depth) in dive.depths.iter().enumerate() {
            callback(Sample::Time(i as u32 * 10_000));
            callback(Sample::Depth(*depth));
            if let Some(t) = dive.temperatures.get(i) {
                callback(Sample::Temperature(*t));
            }
            for (_, mix) in dive.gas_switches.iter().filter(|(at, _)| *at == i) {
                callback(Sample::GasMix(*mix));
            }
            for (_, kind, time_s, depth_m) in dive.deco.iter().filter(|(at, ..)| *at == i) {
                callback(Sample::Deco {
                    kind: *kind,
                    time_s: *time_s,
                    depth_m: *depth_m,
                });
            }
            if dive.fail_samples {
                return Err(Status::DataFormat);
            }
        }
        Ok(())
    }
}

impl Engine for MockEngine {
    type Context = MockContext;
    type Device = MockDevice;
    type Parser = MockParser;

    fn descriptors(&self) -> Vec<Descriptor> {
        vec![
            Descriptor::new("Shearwater", "Perdix", Family::ShearwaterPetrel, 5),
            Descriptor::new("Shearwater", "Petrel 3", Family::ShearwaterPetrel, 10),
            Descriptor::new("Suunto", "EON Steel", Family::SuuntoEonSteel, 0),
        ]
    }

    fn new_context(&self) -> Result<Self::Context, Status> {
        if self.config.fail_context {
            return Err(Status::NoMemory);
        }
        self.counters.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(MockContext {
            counters: Arc::clone(&self.counters),
        })
    }

    fn open(
        &self,
        _context: &Self::Context,
        descriptor: &Descriptor,
        stream: &mut dyn Stream,
    ) -> Result<Self::Device, Status> {
        stream.set_timeout(1_000)?;

        let mut name = Vec::new();
        if stream.ioctl(IoctlRequest::BleGetName, &mut name).is_ok() {
            debug!("mock handshake with {}", String::from_utf8_lossy(&name));
        }

        write_all(stream, HELLO)?;
        if read_exact(stream, READY.len())? != READY {
            return Err(Status::Protocol);
        }

        self.counters.devices.fetch_add(1, Ordering::SeqCst);
        Ok(MockDevice {
            devinfo: DevInfo {
                model: descriptor.model,
                firmware: self.config.firmware,
                serial: self.config.serial,
            },
            timing: self.config.devinfo,
            fail_set_events: self.config.fail_set_events,
            fail_download_at: self.config.fail_download_at,
            honor_fingerprint: self.config.honor_fingerprint,
            fingerprint: None,
            events: None,
            counters: Arc::clone(&self.counters),
        })
    }

    fn parser(
        &self,
        _context: &Self::Context,
        _descriptor: &Descriptor,
        payload: &[u8],
    ) -> Result<Self::Parser, Status> {
        let dive = MockDive::from_payload(payload)?;
        self.counters.parsers.fetch_add(1, Ordering::SeqCst);
        self.counters.parsers_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockParser {
            dive,
            counters: Arc::clone(&self.counters),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_carries_fingerprint() {
        let dive = MockDive::sample(vec![0xF5, 0x01], 0);
        let payload = dive.to_payload();
        let (fingerprint, _) = split_payload(&payload).unwrap();
        assert_eq!(fingerprint, &[0xF5, 0x01]);
        assert_eq!(MockDive::from_payload(&payload).unwrap(), dive);
    }

    #[test]
    fn test_responder_protocol() {
        let config = MockEngineConfig {
            dives: vec![MockDive::sample(vec![1], 0), MockDive::sample(vec![2], 0)],
            ..MockEngineConfig::default()
        };
        let mut responder = MockEngine::responder(&config);

        assert_eq!(responder(HELLO), vec![READY.to_vec()]);
        assert_eq!(responder(LIST), vec![vec![2]]);
        let frame = &responder(&[b'G', 1])[0];
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(frame.len(), len + 4);
        assert!(responder(&[b'G', 9]).is_empty());
        assert!(responder(BYE).is_empty());
    }

    #[test]
    fn test_parser_counts() {
        let engine = MockEngine::new(MockEngineConfig::default());
        let context = engine.new_context().unwrap();
        let descriptor = engine.descriptors()[0].clone();
        let payload = MockDive::sample(vec![1], 0).to_payload();

        let parser = engine.parser(&context, &descriptor, &payload).unwrap();
        assert_eq!(engine.counters().parsers_live(), 1);
        drop(parser);
        assert_eq!(engine.counters().parsers_live(), 0);
        assert_eq!(engine.counters().parsers_created(), 1);

        drop(context);
        assert_eq!(engine.counters().release_log(), vec!["context"]);
    }
}
