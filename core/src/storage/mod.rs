//! # Message store
//!
//! Reference-counted message bodies shared by every queue holding them, with
//! write-behind persistence through a [`kv::KvStore`].
//!
//! Queues hold only [`QueueMessage`] references. The body ([`Message`]) and
//! its [`IndexMessage`] are created together on the first reference and
//! evicted together when the last reference is removed.
//!
//! Mutations are buffered as pending add / delete / delivered operations keyed
//! by `(message id, queue)`. A background task swaps the buffers out on a fixed
//! interval, cancels adds that were deleted within the same window and applies
//! the rest in one transaction:
//!
//! - `content` bucket: 8-byte little-endian id => JSON `{message, index}`
//! - `queue_<name>` buckets: same key => JSON [`QueueMessage`]
//! - `queues` bucket: queue name => JSON [`QueueRecord`]
//!
//! ## Modules
//!
//! - [`kv`] - transactional key-value collaborator (memory and file backed)

pub mod kv;
#[cfg(test)]
mod tests;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::StorageMetrics;
use crate::protocol::ContentHeader;
use kv::{KvError, KvStore};

pub const CONTENT_BUCKET: &str = "content";
pub const QUEUES_BUCKET: &str = "queues";

pub fn queue_bucket(queue: &str) -> String {
    format!("queue_{queue}")
}

fn message_key(id: u64) -> [u8; 8] {
    id.to_le_bytes()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    MessageNotFound(u64),
    #[error("delivery resources unavailable")]
    ResourcesUnavailable,
    #[error("key-value error: {0}")]
    Kv(#[from] KvError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A fully assembled message. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub header: ContentHeader,
    pub body: Bytes,
}

impl Message {
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Per-queue reference to a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: u64,
    pub delivery_count: u32,
    pub size: u64,
}

impl QueueMessage {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 0
    }
}

/// Reference count of a message across every queue holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMessage {
    pub id: u64,
    pub refs: i32,
    pub delivery_count: u32,
    pub persisted: bool,
}

/// Queue declaration as recorded for recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// A queue rebuilt from persistent state, references in id order.
#[derive(Debug, Clone)]
pub struct RecoveredQueue {
    pub record: QueueRecord,
    pub messages: Vec<QueueMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    message: Message,
    index: IndexMessage,
}

/// Something that bounds how much may be in flight: a consumer's byte
/// budget, a channel's flow gate.
pub trait ResourceHolder: Send + Sync {
    fn acquire_resources(&self, message: &QueueMessage) -> bool;
    fn release_resources(&self, message: &QueueMessage);
}

type PendingKey = (u64, String);

#[derive(Debug)]
enum QueueOp {
    Declare(QueueRecord),
    Delete(String),
}

#[derive(Debug, Default)]
struct PendingOps {
    add: HashMap<PendingKey, QueueMessage>,
    delete: HashMap<PendingKey, QueueMessage>,
    delivered: HashMap<PendingKey, QueueMessage>,
    queues: Vec<QueueOp>,
}

impl PendingOps {
    fn is_empty(&self) -> bool {
        self.add.is_empty()
            && self.delete.is_empty()
            && self.delivered.is_empty()
            && self.queues.is_empty()
    }

    /// Drop add/delete pairs that happened within the same window.
    fn cancel_out(&mut self) -> usize {
        let both: Vec<PendingKey> = self
            .add
            .keys()
            .filter(|key| self.delete.contains_key(*key))
            .cloned()
            .collect();
        for key in &both {
            self.add.remove(key);
            self.delete.remove(key);
            self.delivered.remove(key);
        }
        both.len()
    }

    /// Put a batch that failed to apply back in front of newer operations.
    fn restore(&mut self, older: PendingOps) {
        for (key, qm) in older.add {
            self.add.entry(key).or_insert(qm);
        }
        for (key, qm) in older.delete {
            self.delete.entry(key).or_insert(qm);
        }
        for (key, qm) in older.delivered {
            self.delivered.entry(key).or_insert(qm);
        }
        let newer = std::mem::take(&mut self.queues);
        self.queues = older.queues;
        self.queues.extend(newer);
    }
}

pub struct MessageStore {
    messages: RwLock<HashMap<u64, Arc<Message>>>,
    index: RwLock<HashMap<u64, IndexMessage>>,
    next_id: AtomicU64,
    pending: Mutex<PendingOps>,
    kv: Arc<dyn KvStore>,
    metrics: Option<Arc<StorageMetrics>>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("messages", &self.messages.read().len())
            .field("next_id", &self.next_id)
            .field("kv", &self.kv)
            .finish()
    }
}

impl MessageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingOps::default()),
            kv,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<StorageMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Next process-unique message id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.messages.read().contains_key(&id)
    }

    pub fn refs(&self, id: u64) -> Option<i32> {
        self.index.read().get(&id).map(|i| i.refs)
    }

    pub fn index(&self, id: u64) -> Option<IndexMessage> {
        self.index.read().get(&id).copied()
    }

    /// Store `message` once for each of `queues`, creating or incrementing
    /// its index entry. Returns one reference per queue, in order.
    pub fn add(&self, message: Arc<Message>, queues: &[String]) -> Vec<QueueMessage> {
        if queues.is_empty() {
            return Vec::new();
        }
        let id = message.id;
        let qm = QueueMessage {
            id,
            delivery_count: 0,
            size: message.size(),
        };

        {
            let mut messages = self.messages.write();
            let mut index = self.index.write();
            messages.entry(id).or_insert_with(|| Arc::clone(&message));
            let entry = index.entry(id).or_insert(IndexMessage {
                id,
                refs: 0,
                delivery_count: 0,
                persisted: false,
            });
            entry.refs += queues.len() as i32;
            self.update_gauge(messages.len());
        }

        let mut pending = self.pending.lock();
        for queue in queues {
            pending.add.insert((id, queue.clone()), qm);
        }
        vec![qm; queues.len()]
    }

    /// Fetch the body for `qm`, acquiring every holder or none.
    pub fn get(
        &self,
        qm: &QueueMessage,
        holders: &[&dyn ResourceHolder],
    ) -> Result<Arc<Message>> {
        let message = self
            .messages
            .read()
            .get(&qm.id)
            .cloned()
            .ok_or(StoreError::MessageNotFound(qm.id))?;

        for (acquired, holder) in holders.iter().enumerate() {
            if !holder.acquire_resources(qm) {
                for held in &holders[..acquired] {
                    held.release_resources(qm);
                }
                return Err(StoreError::ResourcesUnavailable);
            }
        }
        Ok(message)
    }

    /// Release holders without touching the reference (requeue path).
    pub fn release(&self, qm: &QueueMessage, holders: &[&dyn ResourceHolder]) {
        for holder in holders {
            holder.release_resources(qm);
        }
    }

    /// Drop the reference `queue` holds on `qm.id`. The body is evicted when
    /// the count reaches zero. Holders are released in every case.
    pub fn remove_ref(&self, qm: &QueueMessage, queue: &str, holders: &[&dyn ResourceHolder]) {
        self.release(qm, holders);

        let evict = {
            let mut index = self.index.write();
            match index.get_mut(&qm.id) {
                Some(entry) => {
                    entry.refs -= 1;
                    if entry.refs <= 0 {
                        index.remove(&qm.id);
                        true
                    } else {
                        false
                    }
                }
                None => {
                    warn!(id = qm.id, queue, "Removing reference to unknown message");
                    false
                }
            }
        };
        if evict {
            let mut messages = self.messages.write();
            messages.remove(&qm.id);
            self.update_gauge(messages.len());
            debug!(id = qm.id, "Evicted message");
        }

        self.pending.lock().delete.insert((qm.id, queue.to_string()), *qm);
    }

    /// Record a delivery attempt of `qm` from `queue`.
    pub fn mark_delivered(&self, qm: &QueueMessage, queue: &str) {
        if let Some(entry) = self.index.write().get_mut(&qm.id) {
            entry.delivery_count = entry.delivery_count.max(qm.delivery_count);
        }
        self.pending
            .lock()
            .delivered
            .insert((qm.id, queue.to_string()), *qm);
    }

    pub fn queue_declared(&self, record: QueueRecord) {
        self.pending.lock().queues.push(QueueOp::Declare(record));
    }

    pub fn queue_deleted(&self, name: &str) {
        self.pending
            .lock()
            .queues
            .push(QueueOp::Delete(name.to_string()));
    }

    fn update_gauge(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_messages(count);
        }
    }

    /// Apply everything buffered since the last flush in one transaction.
    pub fn flush(&self) -> Result<()> {
        let mut batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let cancelled = batch.cancel_out();

        let bodies: HashMap<u64, Arc<Message>> = {
            let messages = self.messages.read();
            batch
                .add
                .keys()
                .filter_map(|(id, _)| messages.get(id).map(|m| (*id, Arc::clone(m))))
                .collect()
        };

        let result = self
            .kv
            .update(&mut |tx| Self::apply_batch(tx, &batch, &bodies))
            .map_err(StoreError::from);

        match result {
            Ok(()) => {
                {
                    let mut index = self.index.write();
                    for (id, _) in batch.add.keys() {
                        if let Some(entry) = index.get_mut(id) {
                            entry.persisted = true;
                        }
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.flushed();
                }
                debug!(
                    adds = batch.add.len(),
                    deletes = batch.delete.len(),
                    delivered = batch.delivered.len(),
                    cancelled,
                    "Flushed message store"
                );
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.flush_failed();
                }
                self.pending.lock().restore(batch);
                Err(e)
            }
        }
    }

    fn apply_batch(
        tx: &mut kv::Transaction<'_>,
        batch: &PendingOps,
        bodies: &HashMap<u64, Arc<Message>>,
    ) -> kv::Result<()> {
        for op in &batch.queues {
            match op {
                QueueOp::Declare(record) => {
                    tx.put(
                        QUEUES_BUCKET,
                        record.name.as_bytes(),
                        serde_json::to_vec(record)?,
                    );
                }
                QueueOp::Delete(name) => {
                    let bucket = queue_bucket(name);
                    for key in tx.keys(&bucket) {
                        Self::release_content(tx, &key)?;
                    }
                    tx.delete(QUEUES_BUCKET, name.as_bytes());
                    tx.delete_bucket(&bucket);
                }
            }
        }

        for ((id, queue), qm) in &batch.add {
            let Some(message) = bodies.get(id) else {
                // evicted after the swap; its delete arrives with the next batch
                continue;
            };
            let key = message_key(*id);
            tx.put(&queue_bucket(queue), &key, serde_json::to_vec(qm)?);

            let stored = match tx.get(CONTENT_BUCKET, &key) {
                Some(raw) => {
                    let mut stored: StoredMessage = serde_json::from_slice(&raw)?;
                    stored.index.refs += 1;
                    stored
                }
                None => StoredMessage {
                    message: Message::clone(message),
                    index: IndexMessage {
                        id: *id,
                        refs: 1,
                        delivery_count: 0,
                        persisted: true,
                    },
                },
            };
            tx.put(CONTENT_BUCKET, &key, serde_json::to_vec(&stored)?);
        }

        for ((id, queue), qm) in &batch.delivered {
            if batch.delete.contains_key(&(*id, queue.clone())) {
                continue;
            }
            let key = message_key(*id);
            let bucket = queue_bucket(queue);
            if tx.get(&bucket, &key).is_some() {
                tx.put(&bucket, &key, serde_json::to_vec(qm)?);
            }
            if let Some(raw) = tx.get(CONTENT_BUCKET, &key) {
                let mut stored: StoredMessage = serde_json::from_slice(&raw)?;
                stored.index.delivery_count = stored.index.delivery_count.max(qm.delivery_count);
                tx.put(CONTENT_BUCKET, &key, serde_json::to_vec(&stored)?);
            }
        }

        for (id, queue) in batch.delete.keys() {
            let key = message_key(*id);
            let bucket = queue_bucket(queue);
            if tx.get(&bucket, &key).is_none() {
                continue;
            }
            tx.delete(&bucket, &key);
            Self::release_content(tx, &key)?;
        }
        Ok(())
    }

    /// Drop one on-disk reference to the message under `key`, deleting the
    /// content once nothing points at it.
    fn release_content(tx: &mut kv::Transaction<'_>, key: &[u8]) -> kv::Result<()> {
        let Some(raw) = tx.get(CONTENT_BUCKET, key) else {
            return Ok(());
        };
        let mut stored: StoredMessage = serde_json::from_slice(&raw)?;
        stored.index.refs -= 1;
        if stored.index.refs <= 0 {
            tx.delete(CONTENT_BUCKET, key);
        } else {
            tx.put(CONTENT_BUCKET, key, serde_json::to_vec(&stored)?);
        }
        Ok(())
    }

    /// Spawn the write-behind task. It flushes every `interval` and once more
    /// when `shutdown` fires.
    pub fn start_persistence(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = Arc::clone(&self);
                        match tokio::task::spawn_blocking(move || store.flush()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => error!("Message store flush failed: {}", e),
                            Err(e) => error!("Message store flush task failed: {}", e),
                        }
                    }
                    _ = shutdown.recv() => {
                        if let Err(e) = self.flush() {
                            error!("Final message store flush failed: {}", e);
                        }
                        info!("Message store persistence stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Rebuild in-memory state from the key-value store.
    ///
    /// Reference counts are recomputed from the surviving queue references;
    /// messages nothing points at and references to missing messages are
    /// removed. The id counter resumes above the highest recovered id.
    pub fn recover(&self) -> Result<Vec<RecoveredQueue>> {
        let mut records: Vec<QueueRecord> = Vec::new();
        let mut refs: HashMap<String, Vec<QueueMessage>> = HashMap::new();
        let mut stored: HashMap<u64, StoredMessage> = HashMap::new();

        self.kv.view(&mut |view| {
            records.clear();
            refs.clear();
            stored.clear();
            for (_, raw) in view.scan(QUEUES_BUCKET) {
                records.push(serde_json::from_slice(raw)?);
            }
            for record in &records {
                let mut list = Vec::new();
                for (_, raw) in view.scan(&queue_bucket(&record.name)) {
                    list.push(serde_json::from_slice::<QueueMessage>(raw)?);
                }
                refs.insert(record.name.clone(), list);
            }
            for (_, raw) in view.scan(CONTENT_BUCKET) {
                let entry: StoredMessage = serde_json::from_slice(raw)?;
                stored.insert(entry.message.id, entry);
            }
            Ok(())
        })?;

        let mut counts: HashMap<u64, i32> = HashMap::new();
        let mut dangling: Vec<(String, u64)> = Vec::new();
        for (queue, list) in refs.iter_mut() {
            list.retain(|qm| {
                if stored.contains_key(&qm.id) {
                    *counts.entry(qm.id).or_default() += 1;
                    true
                } else {
                    dangling.push((queue.clone(), qm.id));
                    false
                }
            });
            list.sort_by_key(|qm| qm.id);
        }
        let orphans: Vec<u64> = stored
            .keys()
            .filter(|id| !counts.contains_key(id))
            .copied()
            .collect();

        // Known queue buckets that no declaration points at.
        let mut stray_buckets: Vec<String> = Vec::new();
        self.kv.view(&mut |view| {
            stray_buckets = view
                .buckets()
                .filter(|b| b.starts_with("queue_"))
                .filter(|b| !records.iter().any(|r| queue_bucket(&r.name) == *b))
                .map(str::to_string)
                .collect();
            Ok(())
        })?;

        self.kv.update(&mut |tx| {
            for id in &orphans {
                tx.delete(CONTENT_BUCKET, &message_key(*id));
            }
            for (queue, id) in &dangling {
                tx.delete(&queue_bucket(queue), &message_key(*id));
            }
            for bucket in &stray_buckets {
                tx.delete_bucket(bucket);
            }
            for (id, count) in &counts {
                if let Some(entry) = stored.get(id) {
                    if entry.index.refs != *count {
                        let fixed = StoredMessage {
                            message: entry.message.clone(),
                            index: IndexMessage {
                                refs: *count,
                                ..entry.index
                            },
                        };
                        tx.put(CONTENT_BUCKET, &message_key(*id), serde_json::to_vec(&fixed)?);
                    }
                }
            }
            Ok(())
        })?;

        let mut max_id = 0;
        {
            let mut messages = self.messages.write();
            let mut index = self.index.write();
            for (id, count) in &counts {
                if let Some(entry) = stored.remove(id) {
                    max_id = max_id.max(*id);
                    index.insert(
                        *id,
                        IndexMessage {
                            refs: *count,
                            persisted: true,
                            ..entry.index
                        },
                    );
                    messages.insert(*id, Arc::new(entry.message));
                }
            }
            self.update_gauge(messages.len());
        }
        for id in &orphans {
            max_id = max_id.max(*id);
        }
        self.next_id.fetch_max(max_id + 1, Ordering::Relaxed);

        if !orphans.is_empty() || !dangling.is_empty() {
            warn!(
                orphans = orphans.len(),
                dangling = dangling.len(),
                "Dropped inconsistent entries during recovery"
            );
        }
        info!(
            queues = records.len(),
            messages = counts.len(),
            next_id = max_id + 1,
            "Recovered message store"
        );

        Ok(records
            .into_iter()
            .map(|record| {
                let messages = refs.remove(&record.name).unwrap_or_default();
                RecoveredQueue { record, messages }
            })
            .collect())
    }
}
