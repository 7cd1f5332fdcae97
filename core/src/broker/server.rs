use crate::broker::connection::Connection;
use crate::broker::{Broker, Lifecycle};
use crate::{config::BrokerConfig, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long `run` waits for open connections after shutdown was requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A live client connection as seen by the server.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub lifecycle: Arc<Lifecycle>,
}

pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
    connections: Arc<DashMap<u64, ConnectionInfo>>,
    // Graceful shutdown coordination
    shutdown_tx: broadcast::Sender<()>,
    // Subscribed at bind time so a shutdown sent before `run` is not lost
    shutdown_rx: Mutex<Option<broadcast::Receiver<()>>>,
    // Stops the write-behind task once connections have drained
    persist_tx: broadcast::Sender<()>,
}

impl BrokerServer {
    /// Open the broker state (recovering persisted queues) and bind the
    /// listener. Port 0 picks an ephemeral port, see [`Self::local_addr`].
    pub async fn bind(config: BrokerConfig) -> Result<Self> {
        let addr = config.bind_address();
        let broker = Broker::open(config)?;
        let listener = TcpListener::bind(&addr).await?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let (persist_tx, _) = broadcast::channel(1);

        Ok(Self {
            broker,
            listener,
            connections: Arc::new(DashMap::new()),
            shutdown_tx,
            shutdown_rx: Mutex::new(Some(shutdown_rx)),
            persist_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Initiate graceful shutdown of the server
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());
    }

    /// Accept connections until [`Self::shutdown`], then drain connections,
    /// stop every queue and flush the message store one last time.
    pub async fn run(&self) -> Result<()> {
        let config = &self.broker.config;
        info!(
            "Warren broker listening on {} (max_connections={}, max_channels={}, frame_max={})",
            self.local_addr()?,
            config.max_connections,
            config.max_channels,
            config.frame_max
        );

        let persistence = Arc::clone(&self.broker.store).start_persistence(
            Duration::from_millis(config.persist_interval_ms),
            self.persist_tx.subscribe(),
        );
        Arc::clone(&self.broker.metrics).start_background_tasks();

        let mut shutdown_rx = self
            .shutdown_rx
            .lock()
            .take()
            .unwrap_or_else(|| self.shutdown_tx.subscribe());
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => self.spawn_connection(&mut tasks, stream, peer),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping server gracefully...");
                    break;
                }
            }
        }

        let drained = timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connections still open after {:?}, aborting",
                self.connections.len(),
                DRAIN_TIMEOUT
            );
            tasks.shutdown().await;
        }

        self.broker.registry.close_all();
        let _ = self.persist_tx.send(());
        if let Err(e) = persistence.await {
            error!("Persistence task failed: {}", e);
        }

        info!("Server shutdown complete");
        Ok(())
    }

    fn spawn_connection(&self, tasks: &mut JoinSet<()>, stream: TcpStream, peer: SocketAddr) {
        if self.connections.len() >= self.broker.config.max_connections {
            warn!(
                "Connection limit {} reached, dropping connection from {}",
                self.broker.config.max_connections, peer
            );
            return;
        }

        if let Err(e) = Self::optimize_client_socket(&stream) {
            warn!("Failed to tune client socket {}: {}", peer, e);
        }

        let id = self.broker.next_connection_id();
        let lifecycle = Arc::new(Lifecycle::new());
        self.connections.insert(
            id,
            ConnectionInfo {
                peer,
                lifecycle: Arc::clone(&lifecycle),
            },
        );
        debug!(connection_id = id, %peer, "Accepted connection");

        let broker = Arc::clone(&self.broker);
        let connections = Arc::clone(&self.connections);
        let shutdown = self.shutdown_tx.subscribe();
        tasks.spawn(async move {
            if let Err(e) = Connection::serve(broker, stream, peer, id, lifecycle, shutdown).await {
                debug!(connection_id = id, "Connection from {} ended: {}", peer, e);
            }
            connections.remove(&id);
        });
    }

    /// Apply TCP socket options to client connections
    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);

        // Frames are small and latency-sensitive
        socket_ref.set_tcp_nodelay(true)?;
        socket_ref.set_keepalive(true)?;

        Ok(())
    }
}
