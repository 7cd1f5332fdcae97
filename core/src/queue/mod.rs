//! # Queues
//!
//! A queue is a FIFO of [`QueueMessage`] references plus the consumers
//! attached to it. Each queue runs one dispatch task that wakes on a
//! coalescing ready signal and hands messages to consumers round-robin: in
//! every pass each consumer gets at most one message, starting after the
//! consumer that was served last.
//!
//! Delivery only happens after [`MessageStore::get`] acquired the consumer's
//! budget and its channel's flow gate; otherwise the message stays queued for
//! the next pass.

pub mod consumer;

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics::MetricsRegistry;
use crate::protocol::ProtocolError;
use crate::storage::{MessageStore, QueueMessage, StoreError};

pub use consumer::{
    ChannelFlow, Consumer, ConsumerBudget, ConsumerEvent, Delivery, DeliveryTarget,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Connection that declared the queue; `None` for recovered queues.
    pub owner: Option<u64>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<QueueMessage>,
    consumers: Vec<Arc<Consumer>>,
    cursor: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    /// Queue ran dry.
    Empty,
    /// This consumer cannot take the head message right now.
    Skipped,
    /// State changed underneath; try again.
    Retry,
}

#[derive(Debug)]
pub struct Queue {
    pub name: String,
    pub options: QueueOptions,
    state: Mutex<QueueState>,
    closed: AtomicBool,
    ready: Notify,
    store: Arc<MessageStore>,
    metrics: Arc<MetricsRegistry>,
}

impl Queue {
    pub fn new(
        name: String,
        options: QueueOptions,
        store: Arc<MessageStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            options,
            state: Mutex::new(QueueState::default()),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
            store,
            metrics,
        })
    }

    /// Spawn the dispatch task. It exits after [`Queue::close`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                queue.ready.notified().await;
                if queue.is_closed() {
                    break;
                }
                queue.dispatch().await;
            }
            debug!(queue = %queue.name, "Queue dispatcher stopped");
        })
    }

    pub fn owner(&self) -> Option<u64> {
        self.options.owner
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Exclusive queues only admit their owning connection.
    pub fn check_access(&self, connection_id: u64) -> Result<(), ProtocolError> {
        match self.options.owner {
            Some(owner) if self.options.exclusive && owner != connection_id => {
                Err(ProtocolError::resource_locked(format!(
                    "queue '{}' is exclusive to another connection",
                    self.name
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Append a reference and signal the dispatcher. A closed queue drops the
    /// reference instead.
    pub fn push(&self, qm: QueueMessage) {
        self.enqueue(qm, false);
    }

    /// Put a reference back at the head.
    pub fn requeue(&self, qm: QueueMessage) {
        self.enqueue(qm, true);
    }

    fn enqueue(&self, qm: QueueMessage, front: bool) {
        let mut state = self.state.lock();
        if self.is_closed() {
            drop(state);
            self.store.remove_ref(&qm, &self.name, &[]);
            return;
        }
        if front {
            state.messages.push_front(qm);
        } else {
            state.messages.push_back(qm);
        }
        drop(state);
        self.ready.notify_one();
    }

    /// Signal the dispatcher, e.g. after consumer capacity was freed.
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    pub fn add_consumer(&self, consumer: Arc<Consumer>) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(ProtocolError::not_found(format!(
                    "queue '{}' was deleted",
                    self.name
                )));
            }
            if state.consumers.iter().any(|c| c.exclusive) {
                return Err(ProtocolError::access_refused(format!(
                    "queue '{}' has an exclusive consumer",
                    self.name
                )));
            }
            if consumer.exclusive && !state.consumers.is_empty() {
                return Err(ProtocolError::access_refused(format!(
                    "queue '{}' already has consumers",
                    self.name
                )));
            }
            state.consumers.push(consumer);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Detach the consumer with `tag` on the given channel. Returns it and the
    /// number of consumers left.
    pub fn remove_consumer(
        &self,
        tag: &str,
        connection_id: u64,
        channel_id: u16,
    ) -> Option<(Arc<Consumer>, usize)> {
        let mut state = self.state.lock();
        let pos = state.consumers.iter().position(|c| {
            c.tag == tag && c.connection_id() == connection_id && c.channel_id() == channel_id
        })?;
        let consumer = state.consumers.remove(pos);
        if state.cursor > pos {
            state.cursor -= 1;
        }
        Some((consumer, state.consumers.len()))
    }

    pub fn check_delete(&self, if_unused: bool, if_empty: bool) -> Result<(), ProtocolError> {
        let state = self.state.lock();
        if if_unused && !state.consumers.is_empty() {
            return Err(ProtocolError::precondition_failed(format!(
                "queue '{}' in use",
                self.name
            )));
        }
        if if_empty && !state.messages.is_empty() {
            return Err(ProtocolError::precondition_failed(format!(
                "queue '{}' not empty",
                self.name
            )));
        }
        Ok(())
    }

    /// Stop dispatching and detach every consumer. Consumers are told they
    /// were cancelled.
    pub fn close(&self) {
        let consumers = {
            let mut state = self.state.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut state.consumers)
        };
        for consumer in consumers {
            consumer.notify_cancelled();
        }
        self.ready.notify_one();
    }

    /// Drop every queued reference from the store. Returns how many there were.
    pub fn purge(&self) -> usize {
        let messages = std::mem::take(&mut self.state.lock().messages);
        for qm in &messages {
            self.store.remove_ref(qm, &self.name, &[]);
        }
        messages.len()
    }

    async fn dispatch(&self) {
        loop {
            let (consumers, start) = {
                let state = self.state.lock();
                (state.consumers.clone(), state.cursor)
            };
            if consumers.is_empty() {
                return;
            }

            let n = consumers.len();
            let mut progress = false;
            for step in 0..n {
                if self.is_closed() {
                    return;
                }
                let idx = (start + step) % n;
                match self.consume_one(&consumers[idx]).await {
                    Outcome::Delivered => {
                        progress = true;
                        let mut state = self.state.lock();
                        // the snapshot goes stale if a consumer left mid-pass
                        if let Some(pos) = state
                            .consumers
                            .iter()
                            .position(|c| Arc::ptr_eq(c, &consumers[idx]))
                        {
                            state.cursor = pos + 1;
                        }
                    }
                    Outcome::Empty => return,
                    Outcome::Skipped => {}
                    Outcome::Retry => progress = true,
                }
            }
            if !progress {
                return;
            }
        }
    }

    async fn consume_one(&self, consumer: &Arc<Consumer>) -> Outcome {
        let head = self.state.lock().messages.front().copied();
        let Some(head) = head else {
            return Outcome::Empty;
        };
        if consumer.is_closed() {
            self.detach(consumer);
            return Outcome::Retry;
        }

        let holders = consumer.holders();
        match self.store.get(&head, &holders) {
            Ok(message) => {
                let Some(qm) = self.pop_if_head(head.id) else {
                    self.store.release(&head, &holders);
                    return Outcome::Retry;
                };
                // counted by the channel once it actually sends the delivery
                let delivered = QueueMessage {
                    delivery_count: qm.delivery_count + 1,
                    ..qm
                };

                let size = message.size();
                let delivery = Delivery {
                    consumer_tag: consumer.tag.clone(),
                    queue: self.name.clone(),
                    message,
                    queue_message: delivered,
                    redelivered: qm.redelivered(),
                };
                if consumer.deliver(delivery).await {
                    self.metrics.throughput.record_delivered(size);
                    Outcome::Delivered
                } else {
                    self.store.release(&qm, &holders);
                    self.detach(consumer);
                    self.requeue(qm);
                    Outcome::Retry
                }
            }
            Err(StoreError::MessageNotFound(id)) => {
                warn!(queue = %self.name, id, "Dropping reference to missing message");
                self.pop_if_head(id);
                Outcome::Retry
            }
            Err(_) => Outcome::Skipped,
        }
    }

    fn pop_if_head(&self, id: u64) -> Option<QueueMessage> {
        let mut state = self.state.lock();
        if state.messages.front().map(|m| m.id) == Some(id) {
            state.messages.pop_front()
        } else {
            None
        }
    }

    fn detach(&self, consumer: &Arc<Consumer>) {
        let mut state = self.state.lock();
        let Some(pos) = state.consumers.iter().position(|c| Arc::ptr_eq(c, consumer)) else {
            return;
        };
        state.consumers.remove(pos);
        if state.cursor > pos {
            state.cursor -= 1;
        }
    }
}
