//! Configuration for Chatsync

use crate::error::Result;
use crate::network::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub reconnect_delay_ms: u64,
    /// Upper bound for the reconnect backoff. Equal to `reconnect_delay_ms`
    /// for a fixed delay.
    pub max_reconnect_delay_ms: u64,
    pub typing_ttl_ms: u64,
    /// Messages requested per history fetch.
    pub history_limit: u32,
    pub request_timeout_secs: u64,
    pub tick_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            use_tls: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 3000,
            max_reconnect_delay_ms: 3000,
            typing_ttl_ms: 2000,
            history_limit: 50,
            request_timeout_secs: 30,
            tick_interval_ms: 500,
        }
    }
}

impl ServerConfig {
    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.host, self.port)
    }
}

impl SyncConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let delay = Duration::from_millis(self.reconnect_delay_ms);
        ReconnectPolicy {
            delay,
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms).max(delay),
        }
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_millis(self.typing_ttl_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

impl ClientConfig {
    /// Reads `config.json` from `data_dir`, or the defaults if there is none.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        self.server.http_url()
    }

    pub fn ws_url(&self) -> String {
        self.server.ws_url()
    }
}
