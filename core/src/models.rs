use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque per-dive dedup token reported by the protocol engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub Vec<u8>);

impl Fingerprint {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, uniffi::Enum)]
pub enum Family {
    ShearwaterPredator,
    ShearwaterPetrel,
    SuuntoEonSteel,
    HwOstc3,
    UwatecSmart,
    OceanicAtom2,
    MaresIconHd,
    DeepsixExcursion,
    DivesoftFreedom,
    CressiGoa,
    Unknown,
}

/// Order in which a family's engine walks the dive directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectoryOrder {
    NewestFirst,
    OldestFirst,
}

impl Family {
    pub fn directory_order(self) -> DirectoryOrder {
        // all supported engines walk newest first
        DirectoryOrder::NewestFirst
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, uniffi::Enum)]
pub enum DiveMode {
    Freedive,
    Gauge,
    OpenCircuit,
    ClosedCircuit,
    SemiClosedCircuit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, uniffi::Enum)]
pub enum GasUsage {
    None,
    Oxygen,
    Diluent,
    Sidemount,
}

/// Breathing gas as fractions (0.0..=1.0).
#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct GasMix {
    pub oxygen: f64,
    pub helium: f64,
    pub nitrogen: f64,
    pub usage: GasUsage,
}

#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct Tank {
    /// Index into [`DiveData::gas_mixes`], if the device links them.
    pub gas_mix: Option<u32>,
    pub volume_l: f64,
    pub work_pressure_bar: f64,
    pub begin_pressure_bar: f64,
    pub end_pressure_bar: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, uniffi::Enum)]
pub enum DecoModelKind {
    None,
    Buhlmann,
    Vpm,
    Rgbm,
    Dciem,
}

#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct DecoModel {
    pub kind: DecoModelKind,
    pub conservatism: i32,
    /// Gradient factors, only meaningful for Bühlmann.
    pub gf_low: u32,
    pub gf_high: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, uniffi::Enum)]
pub enum WaterType {
    Fresh,
    Salt,
}

#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct Salinity {
    pub water: WaterType,
    pub density: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct ProfilePoint {
    pub time_s: u32,
    pub depth_m: f64,
    pub temperature_c: Option<f64>,
    /// Pressure of the first reported tank.
    pub pressure_bar: Option<f64>,
    pub ppo2_bar: Option<f64>,
    pub ndl_s: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, uniffi::Enum)]
pub enum DiveEventKind {
    DecoStop,
    DeepStop,
    SafetyStop,
    GasSwitch,
    Ascent,
    Violation,
    Bookmark,
    Surface,
    Other,
}

#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct DiveEvent {
    pub time_s: u32,
    pub kind: DiveEventKind,
    pub depth_m: Option<f64>,
    pub duration_s: Option<u32>,
    pub value: Option<u32>,
}

/// Decoded dive. Built once by the record decoder and never mutated.
#[derive(Clone, Debug, PartialEq, Serialize, uniffi::Record)]
pub struct DiveData {
    /// Position in the retrieval, newest dive = 1.
    pub number: u32,
    pub timestamp_unix: i64,
    pub duration_s: u32,
    pub max_depth_m: f64,
    pub avg_depth_m: Option<f64>,
    pub min_temperature_c: Option<f64>,
    pub max_temperature_c: Option<f64>,
    pub surface_temperature_c: Option<f64>,
    pub atmospheric_bar: Option<f64>,
    pub salinity: Option<Salinity>,
    pub dive_mode: Option<DiveMode>,
    pub deco_model: Option<DecoModel>,
    pub gas_mixes: Vec<GasMix>,
    pub tanks: Vec<Tank>,
    pub profile: Vec<ProfilePoint>,
    pub events: Vec<DiveEvent>,
    #[serde(with = "hex::serde")]
    pub fingerprint: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, uniffi::Record)]
pub struct StoredFingerprint {
    pub device_type: String,
    pub serial: u32,
    pub fingerprint: Vec<u8>,
    pub saved_at_unix: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, uniffi::Record)]
pub struct DeviceIdentity {
    pub name: String,
    pub family: Family,
    pub model: u32,
    pub last_connected_unix: i64,
}
