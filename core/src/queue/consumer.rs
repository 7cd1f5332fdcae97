//! Consumers and the resource holders that bound their deliveries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::storage::{Message, QueueMessage, ResourceHolder};

/// A message handed from a queue to the channel owning the consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub queue: String,
    pub message: Arc<Message>,
    /// Reference as it should be acked, nacked or requeued.
    pub queue_message: QueueMessage,
    pub redelivered: bool,
}

impl Delivery {
    /// The reference as it was before this delivery was counted, for
    /// handing back a message no client ever saw.
    pub fn undelivered(&self) -> QueueMessage {
        QueueMessage {
            delivery_count: self.queue_message.delivery_count.saturating_sub(1),
            ..self.queue_message
        }
    }
}

/// What a queue tells the channel owning one of its consumers.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Deliver(Delivery),
    /// The queue went away; the consumer with this tag is gone.
    Cancelled(String),
}

/// Outstanding unacked bytes allowed for one consumer.
///
/// No-ack consumers never hold anything back.
#[derive(Debug)]
pub struct ConsumerBudget {
    limit: u64,
    active: AtomicU64,
    unlimited: bool,
}

impl ConsumerBudget {
    pub fn new(limit: u64, no_ack: bool) -> Self {
        Self {
            limit,
            active: AtomicU64::new(0),
            unlimited: no_ack,
        }
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl ResourceHolder for ConsumerBudget {
    fn acquire_resources(&self, message: &QueueMessage) -> bool {
        if self.unlimited {
            return true;
        }
        // A message larger than the whole budget still goes out once the
        // consumer is idle.
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.limit).then(|| active + message.size)
            })
            .is_ok()
    }

    fn release_resources(&self, message: &QueueMessage) {
        if self.unlimited {
            return;
        }
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                Some(active.saturating_sub(message.size))
            });
    }
}

/// Channel-level gate toggled by `channel.flow`.
#[derive(Debug)]
pub struct ChannelFlow {
    active: AtomicBool,
}

impl Default for ChannelFlow {
    fn default() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }
}

impl ChannelFlow {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}

impl ResourceHolder for ChannelFlow {
    fn acquire_resources(&self, _message: &QueueMessage) -> bool {
        self.is_active()
    }

    fn release_resources(&self, _message: &QueueMessage) {}
}

/// Where a channel wants its consumers' deliveries to go.
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub connection_id: u64,
    pub channel_id: u16,
    pub flow: Arc<ChannelFlow>,
    pub events: mpsc::Sender<ConsumerEvent>,
}

/// A `basic.consume` subscription, alive until cancelled.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub budget: ConsumerBudget,
    target: DeliveryTarget,
}

impl Consumer {
    pub fn new(
        tag: String,
        target: DeliveryTarget,
        no_ack: bool,
        exclusive: bool,
        budget: u64,
    ) -> Self {
        Self {
            tag,
            no_ack,
            exclusive,
            budget: ConsumerBudget::new(budget, no_ack),
            target,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.target.connection_id
    }

    pub fn channel_id(&self) -> u16 {
        self.target.channel_id
    }

    /// Every holder a delivery to this consumer must acquire.
    pub fn holders(&self) -> [&dyn ResourceHolder; 2] {
        [&self.budget, self.target.flow.as_ref()]
    }

    /// Hand a delivery to the owning channel. Returns `false` once the
    /// channel is gone.
    pub async fn deliver(&self, delivery: Delivery) -> bool {
        self.target
            .events
            .send(ConsumerEvent::Deliver(delivery))
            .await
            .is_ok()
    }

    /// Tell the channel this consumer was cancelled by the broker.
    pub fn notify_cancelled(&self) {
        let event = ConsumerEvent::Cancelled(self.tag.clone());
        match self.target.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let events = self.target.events.clone();
                tokio::spawn(async move {
                    let _ = events.send(event).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_closed(&self) -> bool {
        self.target.events.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qm(size: u64) -> QueueMessage {
        QueueMessage {
            id: 1,
            delivery_count: 0,
            size,
        }
    }

    #[test]
    fn test_budget_blocks_at_limit() {
        let budget = ConsumerBudget::new(100, false);
        assert!(budget.acquire_resources(&qm(60)));
        assert!(budget.acquire_resources(&qm(40)));
        assert_eq!(budget.active(), 100);
        assert!(!budget.acquire_resources(&qm(1)));

        budget.release_resources(&qm(40));
        assert!(budget.acquire_resources(&qm(10)));
        assert_eq!(budget.active(), 70);
    }

    #[test]
    fn test_oversized_message_when_idle() {
        let budget = ConsumerBudget::new(10, false);
        assert!(budget.acquire_resources(&qm(500)));
        assert!(!budget.acquire_resources(&qm(1)));
        budget.release_resources(&qm(500));
        assert_eq!(budget.active(), 0);
    }

    #[test]
    fn test_no_ack_is_unbounded() {
        let budget = ConsumerBudget::new(10, true);
        for _ in 0..100 {
            assert!(budget.acquire_resources(&qm(10)));
        }
        assert_eq!(budget.active(), 0);
    }

    #[test]
    fn test_flow_gate() {
        let flow = ChannelFlow::default();
        assert!(flow.acquire_resources(&qm(1)));
        flow.set_active(false);
        assert!(!flow.acquire_resources(&qm(1)));
    }
}
