#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use warren::{BrokerConfig, BrokerServer};
use warren_client::{Consumer, Delivery};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A broker on an ephemeral localhost port, running in the test runtime.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub server: Arc<BrokerServer>,
    handle: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Self {
        Self::start_with(BrokerConfig::default()).await
    }

    pub async fn start_with(config: BrokerConfig) -> Self {
        init_tracing();
        let config = BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..config
        };
        let server = Arc::new(BrokerServer::bind(config).await.expect("bind broker"));
        let addr = server.local_addr().expect("local addr");
        let runner = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            runner.run().await.expect("broker run");
        });
        Self {
            addr,
            server,
            handle,
        }
    }

    /// Graceful shutdown, including the final store flush.
    pub async fn stop(self) {
        self.server.shutdown();
        self.handle.await.expect("broker task");
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warren=debug,warren_client=debug")
        .with_test_writer()
        .try_init();
}

pub async fn next_delivery(consumer: &mut Consumer) -> Delivery {
    timeout(RECV_TIMEOUT, consumer.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("consumer ended")
}

/// `true` if nothing arrives within `wait`.
pub async fn stays_idle(consumer: &mut Consumer, wait: Duration) -> bool {
    timeout(wait, consumer.recv()).await.is_err()
}

pub fn body(delivery: &Delivery) -> String {
    String::from_utf8_lossy(&delivery.body).into_owned()
}
