//! Per-device dedup state and known-device identities.
//!
//! Fingerprints are keyed `fingerprint_{deviceType}_{serial}` where the
//! device type is normalized so that `_` only ever separates the parts.

mod json;
mod memory;

use std::collections::BTreeMap;

use log::warn;
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, u32 as decimal_u32},
    combinator::all_consuming,
    sequence::{preceded, separated_pair},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::{DeviceIdentity, StoredFingerprint};

pub use json::JsonFileStore;
pub use memory::MemoryStore;

pub const KEY_PREFIX: &str = "fingerprint_";

pub trait FingerprintStore {
    fn lookup(
        &self,
        device_type: &str,
        serial: u32,
    ) -> Result<Option<StoredFingerprint>, PersistenceError>;

    /// Replace the entry for this device. Empty fingerprints are ignored.
    fn save(
        &mut self,
        device_type: &str,
        serial: u32,
        fingerprint: &[u8],
    ) -> Result<(), PersistenceError>;

    /// Returns whether an entry existed.
    fn forget(&mut self, device_type: &str, serial: u32) -> Result<bool, PersistenceError>;

    fn entries(&self) -> Result<Vec<StoredFingerprint>, PersistenceError>;
}

pub trait DeviceStore {
    fn record_device(&mut self, id: Uuid, identity: DeviceIdentity)
        -> Result<(), PersistenceError>;

    fn device(&self, id: &Uuid) -> Result<Option<DeviceIdentity>, PersistenceError>;

    fn forget_device(&mut self, id: &Uuid) -> Result<bool, PersistenceError>;

    fn devices(&self) -> Result<Vec<(Uuid, DeviceIdentity)>, PersistenceError>;
}

/// Lowercase ASCII alphanumerics; any other run collapses to one `-`.
pub fn normalize_device_type(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        out.push_str("unknown");
    }
    out
}

pub fn fingerprint_key(device_type: &str, serial: u32) -> String {
    format!("{KEY_PREFIX}{}_{serial}", normalize_device_type(device_type))
}

fn device_type(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-').parse(input)
}

fn key(input: &str) -> IResult<&str, (&str, u32)> {
    preceded(tag(KEY_PREFIX), separated_pair(device_type, char('_'), decimal_u32)).parse(input)
}

/// Split a store key back into `(device_type, serial)`.
pub fn parse_fingerprint_key(raw: &str) -> Result<(String, u32), PersistenceError> {
    all_consuming(key)
        .parse(raw)
        .map(|(_, (device_type, serial))| (device_type.to_string(), serial))
        .map_err(|_| PersistenceError::InvalidKey(raw.to_string()))
}

/// Stable identifier for a BLE connection address. Platform UUIDs are used
/// as-is, MAC addresses map to a name-based UUID.
pub fn connection_uuid(address: &str) -> Uuid {
    Uuid::parse_str(address).unwrap_or_else(|_| {
        Uuid::new_v5(&Uuid::NAMESPACE_OID, address.to_ascii_uppercase().as_bytes())
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct FingerprintEntry {
    #[serde(with = "hex::serde")]
    fingerprint: Vec<u8>,
    saved_at: i64,
}

/// On-disk and in-memory shape shared by both backends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    fingerprints: BTreeMap<String, FingerprintEntry>,
    #[serde(default)]
    devices: BTreeMap<Uuid, DeviceIdentity>,
}

impl StoreDocument {
    /// Drop entries whose key does not follow the grammar.
    fn sanitize(&mut self) {
        self.fingerprints.retain(|key, entry| {
            let valid = parse_fingerprint_key(key).is_ok() && !entry.fingerprint.is_empty();
            if !valid {
                warn!("dropping malformed fingerprint entry {key:?}");
            }
            valid
        });
    }

    fn lookup(&self, device_type: &str, serial: u32) -> Option<StoredFingerprint> {
        let key = fingerprint_key(device_type, serial);
        self.fingerprints.get(&key).map(|entry| StoredFingerprint {
            device_type: normalize_device_type(device_type),
            serial,
            fingerprint: entry.fingerprint.clone(),
            saved_at_unix: entry.saved_at,
        })
    }

    /// Returns whether the document changed.
    fn save(&mut self, device_type: &str, serial: u32, fingerprint: &[u8]) -> bool {
        if fingerprint.is_empty() {
            return false;
        }
        self.fingerprints.insert(
            fingerprint_key(device_type, serial),
            FingerprintEntry {
                fingerprint: fingerprint.to_vec(),
                saved_at: chrono::Utc::now().timestamp(),
            },
        );
        true
    }

    fn forget(&mut self, device_type: &str, serial: u32) -> bool {
        self.fingerprints
            .remove(&fingerprint_key(device_type, serial))
            .is_some()
    }

    fn entries(&self) -> Vec<StoredFingerprint> {
        self.fingerprints
            .iter()
            .filter_map(|(key, entry)| {
                let (device_type, serial) = parse_fingerprint_key(key).ok()?;
                Some(StoredFingerprint {
                    device_type,
                    serial,
                    fingerprint: entry.fingerprint.clone(),
                    saved_at_unix: entry.saved_at,
                })
            })
            .collect()
    }
}
