//! Configuration types for the warren client

use std::time::Duration;
use warren::config::{DEFAULT_FRAME_MAX, DEFAULT_MAX_CHANNELS};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP connect plus handshake
    pub connect_timeout: Duration,
    /// How long a synchronous method waits for its reply
    pub rpc_timeout: Duration,
    /// Highest channel id this connection hands out
    pub max_channels: u16,
    /// Largest frame sent or accepted; must not exceed the broker's
    pub frame_max: u32,
    /// Buffered deliveries per consumer before the reader waits
    pub inbox_capacity: usize,
    /// PLAIN credentials. Sent but not verified by the broker.
    pub login: String,
    pub password: String,
    pub virtual_host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            max_channels: DEFAULT_MAX_CHANNELS,
            frame_max: DEFAULT_FRAME_MAX,
            inbox_capacity: 256,
            login: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_channels(mut self, max_channels: u16) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    pub fn with_credentials<S: Into<String>>(mut self, login: S, password: S) -> Self {
        self.login = login.into();
        self.password = password.into();
        self
    }

    /// SASL PLAIN response: `\0login\0password`.
    pub(crate) fn plain_response(&self) -> String {
        format!("\0{}\0{}", self.login, self.password)
    }
}
