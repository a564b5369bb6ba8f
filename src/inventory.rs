//! Device and credential lookup.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::LookupError;
use crate::model::{CredentialHandle, Credentials, Device, DeviceId};

/// Read access to the device inventory.
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn get(&self, id: &DeviceId) -> Result<Device, LookupError>;
}

/// Resolves credential handles to login material at execution time.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn resolve(&self, handle: &CredentialHandle) -> Result<Credentials, LookupError>;
}

/// In-memory inventory.
#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    devices: Arc<RwLock<HashMap<DeviceId, Device>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let inventory = Self::new();
        for device in devices {
            inventory.insert(device);
        }
        inventory
    }

    /// Adds or replaces a device.
    pub fn insert(&self, device: Device) {
        let mut devices = self
            .devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        devices.insert(device.id.clone(), device);
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Device> {
        self.devices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
    }

    /// Parses a JSON array of devices.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let devices: Vec<Device> = serde_json::from_str(text)?;
        Ok(Self::with_devices(devices))
    }
}

#[async_trait]
impl DeviceInventory for MemoryInventory {
    async fn get(&self, id: &DeviceId) -> Result<Device, LookupError> {
        self.devices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(format!("device {id}")))
    }
}

/// In-memory credential store.
#[derive(Clone, Default)]
pub struct MemoryCredentials {
    entries: Arc<RwLock<HashMap<CredentialHandle, Credentials>>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or rotates the credentials behind `handle`.
    pub fn insert(&self, handle: CredentialHandle, credentials: Credentials) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle, credentials);
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentials {
    async fn resolve(&self, handle: &CredentialHandle) -> Result<Credentials, LookupError> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(handle)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(format!("credential {handle}")))
    }
}
