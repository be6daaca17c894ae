//! Devices found so far, deduplicated by identity.

use crate::device::{DeviceKey, NatDevice};
use std::time::Duration;
use tokio::sync::RwLock;

/// Registry of discovered devices, in discovery order.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<(DeviceKey, NatDevice)>>,
}

impl DeviceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        DeviceRegistry::default()
    }

    /// Add a device. Returns the registered instance and whether it is new.
    ///
    /// If a device with the same key is already registered, that device is
    /// returned with its last-seen time refreshed and `device` is dropped, so
    /// every caller works with the handle the registry renews and releases.
    pub async fn register(&self, device: NatDevice) -> (NatDevice, bool) {
        let key = device.key();
        let mut devices = self.devices.write().await;
        if let Some((_, existing)) = devices.iter().find(|(k, _)| *k == key) {
            existing.touch().await;
            return (existing.clone(), false);
        }
        devices.push((key, device.clone()));
        (device, true)
    }

    pub async fn get(&self, key: &DeviceKey) -> Option<NatDevice> {
        let devices = self.devices.read().await;
        devices
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, device)| device.clone())
    }

    /// All registered devices.
    pub async fn devices(&self) -> Vec<NatDevice> {
        let devices = self.devices.read().await;
        devices.iter().map(|(_, device)| device.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Devices not heard from for at least `age`. They stay registered.
    pub async fn stale_since(&self, age: Duration) -> Vec<NatDevice> {
        let devices = self.devices.read().await;
        let mut stale = Vec::new();
        for (_, device) in devices.iter() {
            if device.last_seen().await.elapsed() >= age {
                stale.push(device.clone());
            }
        }
        stale
    }

    /// Clear all registered devices.
    pub async fn clear(&self) {
        self.devices.write().await.clear();
    }
}
