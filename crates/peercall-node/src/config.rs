use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use peercall_protocol::DEFAULT_PORT;

use crate::connector::ConnectOptions;

/// Node configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IP address to listen on (default "::", dual-stack).
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port for signaling connections. Also the port assumed for
    /// contact addresses that do not name one.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-candidate TCP connect timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a liveness probe waits for `pong`.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Seconds between background probe passes (0 = disabled).
    #[serde(default)]
    pub probe_interval_secs: u64,

    /// Also look up MAC-form contact addresses in the kernel neighbor table.
    #[serde(default)]
    pub use_neighbor_table: bool,

    /// Drop connections from keys that are not in the contact directory.
    #[serde(default)]
    pub block_unknown: bool,

    /// Path to the encrypted store (identity + contacts).
    #[serde(default = "default_store_path")]
    pub store_path: String,
}

fn default_host() -> String {
    "::".into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_ms() -> u64 {
    500
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_store_path() -> String {
    "peercall.store".into()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_interval_secs: 0,
            use_neighbor_table: false,
            block_unknown: false,
            store_path: default_store_path(),
        }
    }
}

impl NodeConfig {
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            port: self.port,
            timeout: Duration::from_millis(self.connect_timeout_ms),
            use_neighbor_table: self.use_neighbor_table,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.probe_interval_secs > 0).then(|| Duration::from_secs(self.probe_interval_secs))
    }
}
