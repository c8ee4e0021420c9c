use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use crate::drivers::DriverConfig;

/// Configuration for the hestia-gateway server.
#[derive(Parser, Debug, Clone)]
#[command(name = "hestia-gateway")]
#[command(about = "Multi-backend Gaia storage gateway")]
pub struct Config {
    /// TCP host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "HESTIA_HOST")]
    pub host: String,

    /// TCP port to bind to
    #[arg(long, default_value = "4010", env = "HESTIA_PORT")]
    pub port: u16,

    /// Public origin of the gateway (defaults to http://localhost:{port})
    #[arg(long, env = "HESTIA_ORIGIN")]
    pub origin: Option<String>,

    /// Server name used in the hub challenge
    #[arg(long, default_value = "localhost", env = "HESTIA_SERVER_NAME")]
    pub server_name: String,

    /// Entries per listing page
    #[arg(long, default_value = "50", env = "HESTIA_PAGE_SIZE")]
    pub page_size: usize,

    /// Largest accepted blob (`7mb`, `512kb`, bytes; 0 disables the limit)
    #[arg(long, default_value = "7mb", env = "HESTIA_MAX_BLOB_SIZE")]
    pub max_blob_size: String,

    /// JSON driver table, keyed by driver id
    #[arg(long, env = "HESTIA_DRIVERS")]
    pub drivers: Option<PathBuf>,

    /// Snapshot file for users, metadata and driver tables
    #[arg(long, env = "HESTIA_STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// Seconds between background sync sweeps
    #[arg(long, default_value = "600", env = "HESTIA_SYNC_INTERVAL")]
    pub sync_interval_secs: u64,

    /// Milliseconds between scheduler ticks
    #[arg(long, default_value = "500", env = "HESTIA_TICK_INTERVAL_MS")]
    pub tick_interval_ms: u64,

    /// Comma-separated addresses allowed to auto-register
    #[arg(long, env = "HESTIA_WHITELIST", value_delimiter = ',')]
    pub whitelist: Option<Vec<String>>,
}

/// Runtime settings shared by the services and handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub origin: String,
    pub server_name: String,
    pub page_size: usize,
    pub max_blob_size: u64,
    pub whitelist: Option<Vec<String>>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            origin: "http://localhost:4010".to_string(),
            server_name: "localhost".to_string(),
            page_size: 50,
            max_blob_size: 7 << 20,
            whitelist: None,
        }
    }
}

impl GatewaySettings {
    pub fn allows(&self, address: &str) -> bool {
        self.whitelist
            .as_ref()
            .is_none_or(|list| list.iter().any(|a| a == address))
    }
}

impl Config {
    pub fn settings(&self) -> anyhow::Result<GatewaySettings> {
        let max_blob_size = hestia_core::parse_byte_str(&self.max_blob_size)
            .with_context(|| format!("Invalid --max-blob-size \"{}\"", self.max_blob_size))?;

        Ok(GatewaySettings {
            origin: self
                .origin
                .clone()
                .unwrap_or_else(|| format!("http://localhost:{}", self.port))
                .trim_end_matches('/')
                .to_string(),
            server_name: self.server_name.clone(),
            page_size: self.page_size.max(1),
            max_blob_size,
            whitelist: self
                .whitelist
                .clone()
                .map(|l| l.into_iter().map(|a| a.trim().to_string()).filter(|a| !a.is_empty()).collect()),
        })
    }

    /// Load the driver table, or the default single disk driver.
    pub fn driver_table(&self) -> anyhow::Result<BTreeMap<String, DriverConfig>> {
        match &self.drivers {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read driver table {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid driver table {}", path.display()))
            }
            None => Ok(default_driver_table()),
        }
    }
}

pub fn default_driver_table() -> BTreeMap<String, DriverConfig> {
    let mut disk = DriverConfig {
        auto_register: true,
        ..DriverConfig::new("disk")
    };
    disk.options.insert(
        "storage_root_directory".to_string(),
        serde_json::Value::String("./hestia-storage".to_string()),
    );
    BTreeMap::from([("disk".to_string(), disk)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["hestia-gateway"]).unwrap();
        let settings = config.settings().unwrap();
        assert_eq!(settings.origin, "http://localhost:4010");
        assert_eq!(settings.max_blob_size, 7 * 1024 * 1024);
        assert!(settings.allows("anyone"));

        let table = config.driver_table().unwrap();
        assert!(table["disk"].auto_register);
    }

    #[test]
    fn test_whitelist_and_blob_size() {
        let config = Config::try_parse_from([
            "hestia-gateway",
            "--whitelist",
            "alice, bob",
            "--max-blob-size",
            "512kb",
            "--origin",
            "https://hub.example/",
        ])
        .unwrap();
        let settings = config.settings().unwrap();
        assert!(settings.allows("bob"));
        assert!(!settings.allows("carol"));
        assert_eq!(settings.max_blob_size, 512 * 1024);
        assert_eq!(settings.origin, "https://hub.example");
    }

    #[test]
    fn test_driver_table_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("drivers.json");
        std::fs::write(
            &path,
            r#"{"hub": {"kind": "gaia-hub", "root_only": true, "token": "t", "hub_url": "https://h", "bucket": "b"}}"#,
        )
        .unwrap();

        let config = Config::try_parse_from(["hestia-gateway", "--drivers", path.to_str().unwrap()]).unwrap();
        let table = config.driver_table().unwrap();
        assert!(table["hub"].root_only);
        assert_eq!(table["hub"].options["token"], "t");
    }
}
