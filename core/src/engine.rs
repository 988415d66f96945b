//! Boundary to the external device-protocol engine.
//!
//! The engine owns the per-manufacturer handshakes, framing and record
//! parsers. This crate only drives it: it hands the engine a blocking
//! [`Stream`], walks the dive directory through [`Device::foreach`] and
//! decodes each payload through a [`Parser`].

use std::ops::{BitOr, ControlFlow};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::models::{DecoModel, DiveMode, Family, GasMix, Salinity, Tank};
use crate::transport::Stream;

/// Failure status reported across the engine boundary.
///
/// Codes follow the libdivecomputer numbering so C engines can map 1:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Status {
    #[error("unsupported operation")]
    Unsupported,
    #[error("invalid arguments")]
    InvalidArgs,
    #[error("out of memory")]
    NoMemory,
    #[error("no device")]
    NoDevice,
    #[error("access denied")]
    NoAccess,
    #[error("input/output error")]
    Io,
    #[error("timeout")]
    Timeout,
    #[error("protocol error")]
    Protocol,
    #[error("data format error")]
    DataFormat,
    #[error("cancelled")]
    Cancelled,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Unsupported => -1,
            Status::InvalidArgs => -2,
            Status::NoMemory => -3,
            Status::NoDevice => -4,
            Status::NoAccess => -5,
            Status::Io => -6,
            Status::Timeout => -7,
            Status::Protocol => -8,
            Status::DataFormat => -9,
            Status::Cancelled => -10,
        }
    }

    /// Map a raw status code. `0` (success) and `1` (done) map to `Ok`.
    pub fn from_code(code: i32) -> Result<(), Status> {
        match code {
            0 | 1 => Ok(()),
            -1 => Err(Status::Unsupported),
            -2 => Err(Status::InvalidArgs),
            -3 => Err(Status::NoMemory),
            -4 => Err(Status::NoDevice),
            -5 => Err(Status::NoAccess),
            -6 => Err(Status::Io),
            -7 => Err(Status::Timeout),
            -8 => Err(Status::Protocol),
            -9 => Err(Status::DataFormat),
            -10 => Err(Status::Cancelled),
            _ => Err(Status::Protocol),
        }
    }
}

/// Static description of a supported dive computer model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub vendor: String,
    pub product: String,
    pub family: Family,
    pub model: u32,
}

impl Descriptor {
    pub fn new(vendor: &str, product: &str, family: Family, model: u32) -> Self {
        Self {
            vendor: vendor.to_string(),
            product: product.to_string(),
            family,
            model,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DevInfo {
    pub model: u32,
    pub firmware: u32,
    pub serial: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub current: u32,
    pub maximum: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clock {
    pub devtime: u32,
    pub systime: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    DevInfo(DevInfo),
    Progress(Progress),
    Clock(Clock),
    Waiting,
}

impl DeviceEvent {
    pub fn mask(&self) -> EventMask {
        match self {
            DeviceEvent::Waiting => EventMask::WAITING,
            DeviceEvent::Progress(_) => EventMask::PROGRESS,
            DeviceEvent::DevInfo(_) => EventMask::DEVINFO,
            DeviceEvent::Clock(_) => EventMask::CLOCK,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventMask(u32);

impl EventMask {
    pub const WAITING: EventMask = EventMask(1 << 0);
    pub const PROGRESS: EventMask = EventMask(1 << 1);
    pub const DEVINFO: EventMask = EventMask(1 << 2);
    pub const CLOCK: EventMask = EventMask(1 << 3);

    pub const fn union(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

pub type EventSink = Box<dyn FnMut(&DeviceEvent) + Send>;

/// One directory entry delivered by [`Device::foreach`], newest first.
#[derive(Clone, Copy, Debug)]
pub struct RawDive<'a> {
    pub data: &'a [u8],
    pub fingerprint: &'a [u8],
}

/// Local dive start time plus the UTC offset when the device records one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiveDateTime {
    pub local: NaiveDateTime,
    pub utc_offset_s: Option<i32>,
}

impl DiveDateTime {
    /// Seconds since the Unix epoch. Devices without a timezone are taken
    /// to record UTC.
    pub fn unix_timestamp(&self) -> i64 {
        let local = self.local.and_utc().timestamp();
        local - i64::from(self.utc_offset_s.unwrap_or(0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    DiveTime,
    MaxDepth,
    AvgDepth,
    GasMixCount,
    GasMix(u32),
    Salinity,
    Atmospheric,
    TemperatureSurface,
    TemperatureMinimum,
    TemperatureMaximum,
    TankCount,
    Tank(u32),
    DiveMode,
    DecoModel,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Seconds(u32),
    Meters(f64),
    Count(u32),
    Bar(f64),
    Celsius(f64),
    GasMix(GasMix),
    Tank(Tank),
    Salinity(Salinity),
    DiveMode(DiveMode),
    DecoModel(DecoModel),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleEventKind {
    Ascent,
    Violation,
    Bookmark,
    Surface,
    SafetyStop,
    DecoStop,
    DeepStop,
    GasChange,
    Other(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoKind {
    Ndl,
    SafetyStop,
    DecoStop,
    DeepStop,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Sample {
    /// Starts a new profile point. Milliseconds since dive start.
    Time(u32),
    Depth(f64),
    Pressure { tank: u32, bar: f64 },
    Temperature(f64),
    Event { kind: SampleEventKind, time_s: u32, value: u32 },
    Ppo2 { sensor: u32, bar: f64 },
    Setpoint(f64),
    Cns(f64),
    Deco { kind: DecoKind, time_s: u32, depth_m: f64 },
    GasMix(u32),
    Heartbeat(u32),
    Bearing(u32),
}

/// An opened dive computer.
pub trait Device: Send {
    fn set_events(&mut self, mask: EventMask, sink: EventSink) -> Result<(), Status>;

    /// Ask the engine to stop natively once it reaches this fingerprint.
    fn set_fingerprint(&mut self, fingerprint: &[u8]) -> Result<(), Status>;

    /// Walk the stored dives newest first. Returning `Break` from the
    /// callback is the only way to stop the walk early.
    fn foreach(
        &mut self,
        stream: &mut dyn Stream,
        callback: &mut dyn FnMut(RawDive<'_>) -> ControlFlow<()>,
    ) -> Result<(), Status>;

    fn close(self, stream: &mut dyn Stream) -> Result<(), Status>
    where
        Self: Sized;
}

/// Per-dive record parser. Dropping it releases it.
pub trait Parser {
    fn datetime(&self) -> Result<DiveDateTime, Status>;

    fn field(&self, field: FieldType) -> Result<FieldValue, Status>;

    fn samples(&mut self, callback: &mut dyn FnMut(Sample)) -> Result<(), Status>;
}

pub trait Engine: Send + Sync {
    type Context: Send;
    type Device: Device;
    type Parser: Parser;

    fn descriptors(&self) -> Vec<Descriptor>;

    fn new_context(&self) -> Result<Self::Context, Status>;

    /// Run the device-open handshake over `stream`. The stream stays owned
    /// by the caller whether or not the handshake succeeds.
    fn open(
        &self,
        context: &Self::Context,
        descriptor: &Descriptor,
        stream: &mut dyn Stream,
    ) -> Result<Self::Device, Status>;

    fn parser(
        &self,
        context: &Self::Context,
        descriptor: &Descriptor,
        payload: &[u8],
    ) -> Result<Self::Parser, Status>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_status_code_mapping() {
        assert_eq!(Status::from_code(0), Ok(()));
        assert_eq!(Status::from_code(1), Ok(()));
        assert_eq!(Status::from_code(-7), Err(Status::Timeout));
        assert_eq!(Status::from_code(-99), Err(Status::Protocol));

        for status in [Status::Io, Status::Cancelled, Status::DataFormat] {
            assert_eq!(Status::from_code(status.code()), Err(status));
        }
    }

    #[test]
    fn test_event_mask() {
        let mask = EventMask::DEVINFO | EventMask::PROGRESS;
        assert!(mask.contains(EventMask::DEVINFO));
        assert!(mask.contains(EventMask::PROGRESS));
        assert!(!mask.contains(EventMask::CLOCK));
        assert!(mask.contains(DeviceEvent::Progress(Progress::default()).mask()));
    }

    #[test]
    fn test_datetime_unix_timestamp() {
        let local = NaiveDate::from_ymd_opt(2024, 1, 11)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap();

        let utc = DiveDateTime {
            local,
            utc_offset_s: None,
        };
        assert_eq!(utc.unix_timestamp(), 1_704_967_200);

        let cet = DiveDateTime {
            local,
            utc_offset_s: Some(3600),
        };
        assert_eq!(cet.unix_timestamp(), 1_704_967_200 - 3600);
    }
}
