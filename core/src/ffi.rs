//! Exports for the Swift/Kotlin host apps.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PersistenceError;
use crate::models::{DeviceIdentity, StoredFingerprint};
use crate::storage::{self, DeviceStore, FingerprintStore, JsonFileStore};

/// Read/forget access to the fingerprint store a retriever writes.
#[derive(uniffi::Object)]
pub struct FingerprintRegistry {
    store: Mutex<JsonFileStore>,
}

#[uniffi::export]
impl FingerprintRegistry {
    #[uniffi::constructor]
    pub fn new(path: String) -> Result<Arc<Self>, PersistenceError> {
        let store = JsonFileStore::load(path)?;
        Ok(Arc::new(Self {
            store: Mutex::new(store),
        }))
    }

    pub fn lookup(
        &self,
        device_type: String,
        serial: u32,
    ) -> Result<Option<StoredFingerprint>, PersistenceError> {
        self.store.lock().lookup(&device_type, serial)
    }

    pub fn forget_device(&self, device_type: String, serial: u32) -> Result<bool, PersistenceError> {
        self.store.lock().forget(&device_type, serial)
    }

    pub fn list(&self) -> Result<Vec<StoredFingerprint>, PersistenceError> {
        self.store.lock().entries()
    }

    pub fn known_devices(&self) -> Result<Vec<DeviceIdentity>, PersistenceError> {
        let devices = self.store.lock().devices()?;
        Ok(devices.into_iter().map(|(_, identity)| identity).collect())
    }
}

#[uniffi::export]
pub fn normalized_device_type(raw: String) -> String {
    storage::normalize_device_type(&raw)
}

#[uniffi::export]
pub fn device_fingerprint_key(device_type: String, serial: u32) -> String {
    storage::fingerprint_key(&device_type, serial)
}
