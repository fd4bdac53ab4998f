use serde::{Deserialize, Serialize};

use crate::types::DeviceIdentity;

// ---------------------------------------------------------------------------
// Upstream request bodies
// ---------------------------------------------------------------------------

/// Body of a `DEVICE_COMMAND` envelope: a payload for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tenant_id: String,
    pub payload: serde_json::Value,
}

impl DeviceCommand {
    /// Target identity, or `None` when the command is not tenant-scoped.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        if self.tenant_id.is_empty() {
            None
        } else {
            Some(DeviceIdentity::new(&self.device_id, &self.tenant_id))
        }
    }
}

/// Body of a `BROADCAST` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Device report bodies
// ---------------------------------------------------------------------------

/// Body of a `DEVICE_STATUS` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
