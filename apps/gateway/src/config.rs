//! Gateway configuration.
//!
//! Reads/writes JSON at `~/.config/devgate/gateway.json` unless a path is
//! given on the command line. A missing file is created with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devgate_link::ReconnectConfig;
use devgate_protocol::{DeviceRecord, SupplierConfig};
use devgate_server::ServerConfig;

/// Upstream service the gateway keeps a link to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// `ws://` or `wss://` URL.
    pub url: String,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// How long startup waits for the link before carrying on.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig::with_interval(Duration::from_millis(self.reconnect_interval_ms))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_port() -> u16 {
    8787
}

fn default_path_prefix() -> String {
    "devices".into()
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamConfig>,
    /// Devices allowed to connect.
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,
    #[serde(default)]
    pub supplier_configs: Vec<SupplierConfig>,
    #[serde(skip)]
    file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            path_prefix: default_path_prefix(),
            upstream: None,
            devices: Vec::new(),
            supplier_configs: Vec::new(),
            file_path: config_file_path(),
        }
    }
}

impl Config {
    /// Loads configuration from the default location.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(config_file_path())
    }

    /// Loads configuration from `path`, writing a default file if none
    /// exists. An unreadable file is reported and defaults are used; the
    /// file is left untouched in that case.
    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let file_path = path.into();

        if !file_path.exists() {
            let config = Config {
                file_path,
                ..Default::default()
            };
            config.save()?;
            tracing::info!(path = %config.file_path.display(), "wrote default gateway config");
            return Ok(config);
        }

        let content = std::fs::read_to_string(&file_path)?;
        let mut config = match serde_json::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %file_path.display(),
                    "failed to parse gateway config, using defaults: {e}"
                );
                Config::default()
            }
        };
        config.file_path = file_path;
        tracing::debug!(
            path = %config.file_path.display(),
            devices = config.devices.len(),
            "gateway config loaded"
        );
        Ok(config)
    }

    /// Saves configuration to disk.
    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.file_path, &json)?;
        set_permissions_0600(&self.file_path);

        tracing::debug!("gateway configuration saved");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            path_prefix: self.path_prefix.clone(),
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn set_permissions_0600(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn config_file_path() -> PathBuf {
    config_base_dir().join("devgate").join("gateway.json")
}

fn config_base_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata)
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.json");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.port, 8787);
        assert_eq!(config.path_prefix, "devices");
        assert!(config.upstream.is_none());
        assert_eq!(config.file_path(), path.as_path());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn devices_and_upstream_are_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(
            &path,
            r#"{
                "port": 9000,
                "upstream": { "url": "ws://upstream.local/link" },
                "devices": [{
                    "deviceId": "gw-1",
                    "tenantId": "t1",
                    "supplierId": "acme",
                    "supplierConfigId": "cfg"
                }],
                "supplierConfigs": [{
                    "configId": "cfg",
                    "tenantId": "t1",
                    "configData": { "baud": 9600 }
                }]
            }"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.path_prefix, "devices");
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.supplier_configs[0].config_data["baud"], 9600);

        let upstream = config.upstream.as_ref().unwrap();
        assert_eq!(upstream.url, "ws://upstream.local/link");
        assert_eq!(upstream.reconnect().interval, Duration::from_secs(1));
        assert_eq!(upstream.ready_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");

        let mut config = Config::load_from(&path).unwrap();
        config.upstream = Some(UpstreamConfig {
            url: "ws://127.0.0.1:1/up".into(),
            reconnect_interval_ms: 250,
            ready_timeout_secs: 5,
        });
        config.save().unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.upstream, config.upstream);
        assert_eq!(
            loaded.upstream.unwrap().reconnect().interval,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn malformed_file_falls_back_to_defaults_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.port, 8787);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }
}
