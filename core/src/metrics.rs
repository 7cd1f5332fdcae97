//! # Broker metrics
//!
//! Lock-free counters updated on the hot paths (publish, deliver, ack) and a
//! background task that derives rates and logs a periodic report.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warren::metrics::MetricsRegistry;
//!
//! # async fn run() {
//! let metrics = Arc::new(MetricsRegistry::new());
//! Arc::clone(&metrics).start_background_tasks();
//!
//! metrics.throughput.record_published(512);
//! metrics.throughput.record_delivered(512);
//!
//! let snapshot = metrics.snapshot();
//! println!("{}", snapshot.to_json().unwrap_or_default());
//! # }
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::time::interval;
use tracing::info;

/// Keeps hot counters on separate cache lines.
#[repr(align(64))]
#[derive(Debug, Default)]
struct CacheLineAligned<T>(T);

#[derive(Debug)]
pub struct MetricsRegistry {
    pub throughput: Arc<ThroughputMetrics>,
    pub broker: Arc<BrokerMetrics>,
    pub storage: Arc<StorageMetrics>,
    started: Instant,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            throughput: Arc::new(ThroughputMetrics::new()),
            broker: Arc::new(BrokerMetrics::default()),
            storage: Arc::new(StorageMetrics::default()),
            started: Instant::now(),
        }
    }

    /// Spawn the rate calculation and reporting loops.
    pub fn start_background_tasks(self: Arc<Self>) {
        let rates = Arc::clone(&self);
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                rates.throughput.calculate_rates();
            }
        });

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            interval.tick().await;
            loop {
                interval.tick().await;
                self.report_metrics();
            }
        });
    }

    fn report_metrics(&self) {
        let throughput = &self.throughput;
        let broker = &self.broker;

        info!(
            "Messages/sec: publish={}, deliver={}",
            throughput.publish_rate(),
            throughput.deliver_rate()
        );
        info!(
            "Connections: active={}, total={}; channels={}",
            broker.active_connections(),
            broker.total_connections(),
            broker.active_channels()
        );
        info!(
            "Errors: soft={}, hard={}; unroutable={}",
            broker.soft_errors(),
            broker.hard_errors(),
            throughput.unroutable()
        );
        info!(
            "Store: messages={}, flushes={}, flush_errors={}",
            self.storage.messages(),
            self.storage.flushes(),
            self.storage.flush_errors()
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let t = &self.throughput;
        let b = &self.broker;
        let s = &self.storage;
        MetricsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            uptime_seconds: self.started.elapsed().as_secs(),
            throughput: ThroughputSnapshot {
                published: t.published(),
                routed: t.routed(),
                returned: t.returned(),
                unroutable: t.unroutable(),
                delivered: t.delivered(),
                acked: t.acked(),
                nacked: t.nacked(),
                bytes_published: t.bytes_published(),
                bytes_delivered: t.bytes_delivered(),
                publish_rate: t.publish_rate(),
                deliver_rate: t.deliver_rate(),
            },
            broker: BrokerSnapshot {
                active_connections: b.active_connections(),
                total_connections: b.total_connections(),
                active_channels: b.active_channels(),
                soft_errors: b.soft_errors(),
                hard_errors: b.hard_errors(),
            },
            storage: StorageSnapshot {
                messages: s.messages(),
                flushes: s.flushes(),
                flush_errors: s.flush_errors(),
            },
        }
    }
}

#[derive(Debug)]
pub struct ThroughputMetrics {
    published: CacheLineAligned<AtomicU64>,
    delivered: CacheLineAligned<AtomicU64>,
    bytes_published: AtomicU64,
    bytes_delivered: AtomicU64,
    routed: AtomicU64,
    returned: AtomicU64,
    unroutable: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,

    last_calc: parking_lot::Mutex<(Instant, u64, u64)>,
    publish_rate: AtomicU64,
    deliver_rate: AtomicU64,
}

impl ThroughputMetrics {
    pub fn new() -> Self {
        Self {
            published: CacheLineAligned::default(),
            delivered: CacheLineAligned::default(),
            bytes_published: AtomicU64::new(0),
            bytes_delivered: AtomicU64::new(0),
            routed: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
            last_calc: parking_lot::Mutex::new((Instant::now(), 0, 0)),
            publish_rate: AtomicU64::new(0),
            deliver_rate: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub fn record_published(&self, bytes: u64) {
        self.published.0.fetch_add(1, Ordering::Relaxed);
        self.bytes_published.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A published message reached `queues` destination queues.
    #[inline(always)]
    pub fn record_routed(&self, queues: usize) {
        self.routed.fetch_add(queues as u64, Ordering::Relaxed);
    }

    pub fn record_returned(&self) {
        self.returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_delivered(&self, bytes: u64) {
        self.delivered.0.fetch_add(1, Ordering::Relaxed);
        self.bytes_delivered.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_acked(&self, count: u64) {
        self.acked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_nacked(&self, count: u64) {
        self.nacked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn calculate_rates(&self) {
        let mut last = self.last_calc.lock();
        let elapsed = last.0.elapsed();
        if elapsed < Duration::from_millis(500) {
            return;
        }
        let published = self.published();
        let delivered = self.delivered();
        let secs = elapsed.as_secs_f64();
        self.publish_rate.store(
            (published.saturating_sub(last.1) as f64 / secs) as u64,
            Ordering::Relaxed,
        );
        self.deliver_rate.store(
            (delivered.saturating_sub(last.2) as f64 / secs) as u64,
            Ordering::Relaxed,
        );
        *last = (Instant::now(), published, delivered);
    }

    pub fn published(&self) -> u64 {
        self.published.0.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.0.load(Ordering::Relaxed)
    }

    pub fn bytes_published(&self) -> u64 {
        self.bytes_published.load(Ordering::Relaxed)
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.load(Ordering::Relaxed)
    }

    pub fn routed(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    pub fn returned(&self) -> u64 {
        self.returned.load(Ordering::Relaxed)
    }

    pub fn unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn nacked(&self) -> u64 {
        self.nacked.load(Ordering::Relaxed)
    }

    pub fn publish_rate(&self) -> u64 {
        self.publish_rate.load(Ordering::Relaxed)
    }

    pub fn deliver_rate(&self) -> u64 {
        self.deliver_rate.load(Ordering::Relaxed)
    }
}

impl Default for ThroughputMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct BrokerMetrics {
    active_connections: CacheLineAligned<AtomicUsize>,
    total_connections: AtomicU64,
    active_channels: AtomicUsize,
    soft_errors: AtomicU64,
    hard_errors: AtomicU64,
}

impl BrokerMetrics {
    pub fn connection_opened(&self) {
        self.active_connections.0.fetch_add(1, Ordering::AcqRel);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.0.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn channel_opened(&self) {
        self.active_channels.fetch_add(1, Ordering::AcqRel);
    }

    pub fn channel_closed(&self) {
        self.active_channels.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn soft_error(&self) {
        self.soft_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hard_error(&self) {
        self.hard_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.0.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_channels(&self) -> usize {
        self.active_channels.load(Ordering::Acquire)
    }

    pub fn soft_errors(&self) -> u64 {
        self.soft_errors.load(Ordering::Relaxed)
    }

    pub fn hard_errors(&self) -> u64 {
        self.hard_errors.load(Ordering::Relaxed)
    }
}

/// Message store counters.
#[derive(Debug, Default)]
pub struct StorageMetrics {
    messages: AtomicUsize,
    flushes: AtomicU64,
    flush_errors: AtomicU64,
}

impl StorageMetrics {
    pub fn set_messages(&self, count: usize) {
        self.messages.store(count, Ordering::Relaxed);
    }

    pub fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn flush_failed(&self) {
        self.flush_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages(&self) -> usize {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flush_errors(&self) -> u64 {
        self.flush_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub throughput: ThroughputSnapshot,
    pub broker: BrokerSnapshot,
    pub storage: StorageSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    pub published: u64,
    pub routed: u64,
    pub returned: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub bytes_published: u64,
    pub bytes_delivered: u64,
    pub publish_rate: u64,
    pub deliver_rate: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub active_channels: usize,
    pub soft_errors: u64,
    pub hard_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageSnapshot {
    pub messages: usize,
    pub flushes: u64,
    pub flush_errors: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let t = &self.throughput;
        let b = &self.broker;
        let lines = [
            ("warren_messages_published_total", t.published as f64),
            ("warren_messages_routed_total", t.routed as f64),
            ("warren_messages_returned_total", t.returned as f64),
            ("warren_messages_unroutable_total", t.unroutable as f64),
            ("warren_messages_delivered_total", t.delivered as f64),
            ("warren_messages_acked_total", t.acked as f64),
            ("warren_messages_nacked_total", t.nacked as f64),
            ("warren_bytes_published_total", t.bytes_published as f64),
            ("warren_bytes_delivered_total", t.bytes_delivered as f64),
            ("warren_connections_active", b.active_connections as f64),
            ("warren_channels_active", b.active_channels as f64),
            ("warren_soft_errors_total", b.soft_errors as f64),
            ("warren_hard_errors_total", b.hard_errors as f64),
            ("warren_store_messages", self.storage.messages as f64),
            ("warren_uptime_seconds", self.uptime_seconds as f64),
        ];
        let mut output = String::new();
        for (name, value) in lines {
            output.push_str(&format!("{name} {value}\n"));
        }
        output
    }
}
