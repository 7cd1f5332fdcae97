//! # Warren Broker Module
//!
//! The TCP side of the broker and the shared state every connection works
//! against.
//!
//! ## Architecture
//!
//! - [`server`] - accepts TCP connections, enforces `max_connections` and
//!   coordinates graceful shutdown
//! - [`connection`] - handshake, frame demultiplexing, the single outbound
//!   writer and hard-close semantics
//! - [`channel`] - per-channel state machine: method routing, content
//!   assembly, deliveries, acknowledgements, transactions and soft close
//! - [`registry`] - exchanges and queues shared by all connections
//!
//! Every connection runs a reader task and a writer task; every channel and
//! every queue runs its own task. They only talk through bounded `mpsc`
//! queues.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use warren::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         port: 0,
//!         ..Default::default()
//!     };
//!     let server = BrokerServer::bind(config).await?;
//!     println!("listening on {}", server.local_addr()?);
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod registry;
pub mod server;

pub use registry::Registry;
pub use server::BrokerServer;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::BrokerConfig;
use crate::metrics::MetricsRegistry;
use crate::storage::kv::{FileKv, KvStore, MemoryKv};
use crate::storage::MessageStore;
use crate::Result;

/// State shared by every connection of one broker process.
#[derive(Debug)]
pub struct Broker {
    pub config: BrokerConfig,
    pub registry: Registry,
    pub store: Arc<MessageStore>,
    pub metrics: Arc<MetricsRegistry>,
    next_connection_id: AtomicU64,
}

impl Broker {
    /// Open the key-value store, recover persisted queues and build the
    /// registry. Must run inside a tokio runtime: recovered queues start
    /// their dispatchers immediately.
    pub fn open(config: BrokerConfig) -> Result<Arc<Self>> {
        config.validate().map_err(crate::WarrenError::Config)?;

        let kv: Arc<dyn KvStore> = match &config.data_dir {
            Some(dir) => {
                info!("Opening message store in {}", dir);
                Arc::new(FileKv::open(dir)?)
            }
            None => Arc::new(MemoryKv::new()),
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let store =
            Arc::new(MessageStore::new(kv).with_metrics(Arc::clone(&metrics.storage)));
        let recovered = store.recover()?;

        let registry = Registry::new(Arc::clone(&store), Arc::clone(&metrics));
        registry.recover(recovered);

        Ok(Arc::new(Self {
            config,
            registry,
            store,
            metrics,
            next_connection_id: AtomicU64::new(1),
        }))
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// `OPEN -> CLOSING -> CLOSED`, each step taken by exactly one caller.
#[derive(Debug, Default)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    /// Returns `true` for the single caller that moved `OPEN -> CLOSING`.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` for the single caller that reached `CLOSED`, whether or
    /// not it went through `CLOSING` first.
    pub fn finish_close(&self) -> bool {
        self.0.swap(CLOSED, Ordering::AcqRel) != CLOSED
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire) == OPEN
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire) == CLOSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.is_open());
        assert!(lifecycle.begin_close());
        assert!(!lifecycle.begin_close());
        assert!(!lifecycle.is_open());
        assert!(lifecycle.finish_close());
        assert!(!lifecycle.finish_close());
        assert!(lifecycle.is_closed());
    }

    #[test]
    fn test_lifecycle_concurrent_close() {
        let lifecycle = Arc::new(Lifecycle::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lifecycle = Arc::clone(&lifecycle);
                std::thread::spawn(move || lifecycle.begin_close())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_open_validates_config() {
        let config = BrokerConfig {
            max_channels: 0,
            ..Default::default()
        };
        assert!(Broker::open(config).is_err());
    }
}
