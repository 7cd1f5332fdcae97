//! # Warren Core Library
//!
//! Warren is an AMQP-0-9-1-style message broker: clients open a TCP
//! connection, multiplex channels over it, declare exchanges and queues, bind
//! them, publish messages and consume them with round-robin fair dispatch.
//! In-flight messages live in a reference-counted store with write-behind
//! persistence, so queue state survives restarts.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - frame and method codec, class/method table, channel ids
//! - [`broker`] - TCP server, connection and channel state machines, registry
//! - [`exchange`] - exchange kinds, bindings and routing
//! - [`queue`] - message reference FIFOs, consumers and fair dispatch
//! - [`storage`] - reference-counted message store and key-value persistence
//! - [`config`] - broker configuration
//! - [`metrics`] - lock-free counters and periodic reporting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use warren::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         port: 5672,
//!         data_dir: Some("./warren-data".into()),
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod exchange;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod storage;

pub use broker::{Broker, BrokerServer};
pub use config::BrokerConfig;
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use protocol::{ErrorKind, ProtocolError};

use thiserror::Error;

/// Warren error types
///
/// Protocol-level failures that are reported to clients travel as
/// [`ProtocolError`]; everything else is an operational error of the broker
/// process itself.
///
/// # Example
///
/// ```rust,no_run
/// use warren::{Result, WarrenError};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(()) => println!("Success"),
///         Err(WarrenError::Protocol(e)) if e.is_hard() => println!("Connection closed: {}", e),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum WarrenError {
    /// Socket and file I/O failures
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Soft or hard protocol error destined for a peer
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("Store error: {0}")]
    Store(#[from] storage::StoreError),

    #[error("Key-value error: {0}")]
    Kv(#[from] storage::kv::KvError),

    /// The channel's task is gone
    #[error("channel closed")]
    ChannelClosed,

    /// The connection's writer is gone
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias for Warren operations
pub type Result<T> = std::result::Result<T, WarrenError>;
