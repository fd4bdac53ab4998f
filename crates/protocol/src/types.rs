use std::fmt;

use serde::{Deserialize, Serialize};

/// Key that distinguishes device sessions: a device id scoped to a tenant.
///
/// Session equality and hashing go through this type only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub tenant_id: String,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            tenant_id: tenant_id.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.device_id, self.tenant_id)
    }
}

/// Supplier configuration attached to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplierConfig {
    pub config_id: String,
    pub tenant_id: String,
    /// Opaque supplier-specific settings handed to the supplier factory.
    #[serde(default)]
    pub config_data: serde_json::Value,
}

/// A device as known to the device directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub supplier_id: String,
    pub supplier_config_id: String,
    /// Resolved supplier configuration, filled in during session setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SupplierConfig>,
}

impl DeviceRecord {
    /// The registry key for this device.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device_id, &self.tenant_id)
    }
}
