use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use uuid::Uuid;

use super::{DeviceStore, FingerprintStore, StoreDocument};
use crate::error::PersistenceError;
use crate::models::{DeviceIdentity, StoredFingerprint};

/// Store persisted as one JSON document, rewritten atomically on change.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: StoreDocument,
}

impl JsonFileStore {
    /// Open strictly: a missing file is an empty store, anything unreadable
    /// is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            if !value.is_object() {
                return Err(PersistenceError::Corrupt(serde::de::Error::custom(
                    "top level of the store must be an object",
                )));
            }
            let mut doc: StoreDocument = serde_json::from_value(value)?;
            doc.sanitize();
            doc
        } else {
            StoreDocument::default()
        };
        Ok(Self { path, doc })
    }

    /// Open leniently: an unreadable or corrupt file yields an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                warn!("ignoring unreadable fingerprint store: {e}");
                Self {
                    path,
                    doc: StoreDocument::default(),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the document and adopt the copy only once
    /// it is on disk. Returns whatever `change` returned; `false` skips the write.
    fn update(
        &mut self,
        change: impl FnOnce(&mut StoreDocument) -> bool,
    ) -> Result<bool, PersistenceError> {
        let mut next = self.doc.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next)?;
        self.doc = next;
        Ok(true)
    }

    fn persist(&self, doc: &StoreDocument) -> Result<(), PersistenceError> {
        let io_err = |source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        };
        let body = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        debug!("persisted store to {}", self.path.display());
        Ok(())
    }
}

impl FingerprintStore for JsonFileStore {
    fn lookup(
        &self,
        device_type: &str,
        serial: u32,
    ) -> Result<Option<StoredFingerprint>, PersistenceError> {
        Ok(self.doc.lookup(device_type, serial))
    }

    fn save(
        &mut self,
        device_type: &str,
        serial: u32,
        fingerprint: &[u8],
    ) -> Result<(), PersistenceError> {
        self.update(|doc| doc.save(device_type, serial, fingerprint))?;
        Ok(())
    }

    fn forget(&mut self, device_type: &str, serial: u32) -> Result<bool, PersistenceError> {
        self.update(|doc| doc.forget(device_type, serial))
    }

    fn entries(&self) -> Result<Vec<StoredFingerprint>, PersistenceError> {
        Ok(self.doc.entries())
    }
}

impl DeviceStore for JsonFileStore {
    fn record_device(
        &mut self,
        id: Uuid,
        identity: DeviceIdentity,
    ) -> Result<(), PersistenceError> {
        self.update(|doc| {
            doc.devices.insert(id, identity);
            true
        })?;
        Ok(())
    }

    fn device(&self, id: &Uuid) -> Result<Option<DeviceIdentity>, PersistenceError> {
        Ok(self.doc.devices.get(id).cloned())
    }

    fn forget_device(&mut self, id: &Uuid) -> Result<bool, PersistenceError> {
        self.update(|doc| doc.devices.remove(id).is_some())
    }

    fn devices(&self) -> Result<Vec<(Uuid, DeviceIdentity)>, PersistenceError> {
        Ok(self
            .doc
            .devices
            .iter()
            .map(|(id, identity)| (*id, identity.clone()))
            .collect())
    }
}
