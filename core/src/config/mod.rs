pub mod settings;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_MAX_CHANNELS: u16 = 2047;
pub const DEFAULT_FRAME_MAX: u32 = 128 * 1024;
pub const DEFAULT_CONSUMER_BUDGET: u64 = 1024 * 1024;
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Directory for the file-backed store. `None` keeps everything in memory.
    pub data_dir: Option<String>,
    pub max_connections: usize,
    pub max_channels: u16,
    pub frame_max: u32,
    /// Outstanding unacked payload bytes allowed per consumer.
    pub consumer_budget: u64,
    pub persist_interval_ms: u64,
    pub channel_inbox_capacity: usize,
    pub outbound_capacity: usize,
    pub close_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            data_dir: None,
            max_connections: 1000,
            max_channels: DEFAULT_MAX_CHANNELS,
            frame_max: DEFAULT_FRAME_MAX,
            consumer_budget: DEFAULT_CONSUMER_BUDGET,
            persist_interval_ms: DEFAULT_PERSIST_INTERVAL_MS,
            channel_inbox_capacity: 256,
            outbound_capacity: 1024,
            close_timeout_ms: 1000,
        }
    }
}

impl BrokerConfig {
    /// Persist to a file-backed store under `dir`.
    pub fn with_data_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate configuration bounds to prevent division-by-zero and resource exhaustion
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_connections == 0 {
            return Err("max_connections must be > 0".to_string());
        }
        if self.max_channels == 0 {
            return Err("max_channels must be > 0".to_string());
        }
        if self.frame_max < crate::protocol::constants::FRAME_MIN_SIZE {
            return Err(format!(
                "frame_max must be >= {}",
                crate::protocol::constants::FRAME_MIN_SIZE
            ));
        }
        if self.persist_interval_ms == 0 {
            return Err("persist_interval_ms must be > 0".to_string());
        }
        if self.channel_inbox_capacity == 0 || self.outbound_capacity == 0 {
            return Err("channel and outbound capacities must be > 0".to_string());
        }
        Ok(())
    }
}
