use uuid::Uuid;

use super::{DeviceStore, FingerprintStore, StoreDocument};
use crate::error::PersistenceError;
use crate::models::{DeviceIdentity, StoredFingerprint};

/// Volatile store, for tests and callers that persist elsewhere.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    doc: StoreDocument,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FingerprintStore for MemoryStore {
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
        self.doc.save(device_type, serial, fingerprint);
        Ok(())
    }

    fn forget(&mut self, device_type: &str, serial: u32) -> Result<bool, PersistenceError> {
        Ok(self.doc.forget(device_type, serial))
    }

    fn entries(&self) -> Result<Vec<StoredFingerprint>, PersistenceError> {
        Ok(self.doc.entries())
    }
}

impl DeviceStore for MemoryStore {
    fn record_device(
        &mut self,
        id: Uuid,
        identity: DeviceIdentity,
    ) -> Result<(), PersistenceError> {
        self.doc.devices.insert(id, identity);
        Ok(())
    }

    fn device(&self, id: &Uuid) -> Result<Option<DeviceIdentity>, PersistenceError> {
        Ok(self.doc.devices.get(id).cloned())
    }

    fn forget_device(&mut self, id: &Uuid) -> Result<bool, PersistenceError> {
        Ok(self.doc.devices.remove(id).is_some())
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
