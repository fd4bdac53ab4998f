//! In-memory device directory and configuration store.

use std::collections::HashMap;

use tokio::sync::RwLock;

use devgate_protocol::{DeviceRecord, SupplierConfig};

use crate::directory::{DeviceDirectory, LookupFuture, SupplierConfigStore};

/// Device and supplier configuration records held in memory.
///
/// Implements both [`DeviceDirectory`] and [`SupplierConfigStore`]; used
/// by the gateway for records declared in its config file and by tests.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    devices: RwLock<HashMap<String, DeviceRecord>>,
    /// Keyed by `(config_id, tenant_id)`.
    configs: RwLock<HashMap<(String, String), SupplierConfig>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from record lists. Later duplicates win.
    pub fn from_records(
        devices: impl IntoIterator<Item = DeviceRecord>,
        configs: impl IntoIterator<Item = SupplierConfig>,
    ) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();
        let configs = configs
            .into_iter()
            .map(|c| ((c.config_id.clone(), c.tenant_id.clone()), c))
            .collect();
        Self {
            devices: RwLock::new(devices),
            configs: RwLock::new(configs),
        }
    }

    pub async fn insert_device(&self, device: DeviceRecord) {
        self.devices
            .write()
            .await
            .insert(device.device_id.clone(), device);
    }

    pub async fn insert_config(&self, config: SupplierConfig) {
        self.configs
            .write()
            .await
            .insert((config.config_id.clone(), config.tenant_id.clone()), config);
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }
}

impl DeviceDirectory for InMemoryDirectory {
    fn get_device_by_id<'a>(&'a self, device_id: &'a str) -> LookupFuture<'a, Option<DeviceRecord>> {
        Box::pin(async move { Ok(self.devices.read().await.get(device_id).cloned()) })
    }

    fn get_devices_by_parent<'a>(&'a self, parent_id: &'a str) -> LookupFuture<'a, Vec<DeviceRecord>> {
        Box::pin(async move {
            let devices = self.devices.read().await;
            let mut children: Vec<DeviceRecord> = devices
                .values()
                .filter(|d| d.parent_id.as_deref() == Some(parent_id))
                .cloned()
                .collect();
            children.sort_by(|a, b| a.device_id.cmp(&b.device_id));
            Ok(children)
        })
    }
}

impl SupplierConfigStore for InMemoryDirectory {
    fn get_config_by_id<'a>(
        &'a self,
        config_id: &'a str,
        tenant_id: &'a str,
    ) -> LookupFuture<'a, Option<SupplierConfig>> {
        Box::pin(async move {
            let key = (config_id.to_string(), tenant_id.to_string());
            Ok(self.configs.read().await.get(&key).cloned())
        })
    }
}
