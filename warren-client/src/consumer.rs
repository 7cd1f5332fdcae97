//! Consumers and returned messages.
//!
//! Both are fed by the connection's reader task and can be polled either
//! with `recv()` or as a [`futures::Stream`].

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use warren::protocol::BasicProperties;

use crate::channel::Channel;
use crate::Result;

/// A message handed to a consumer by `basic.deliver`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub consumer_tag: String,
    /// Per-channel, increasing from 1. Pass it to `Channel::ack`/`nack`.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// A mandatory or immediate publish the broker could not route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Returned {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub body: Bytes,
}

/// Deliveries for one consumer tag. The stream ends when the consumer is
/// cancelled (by either side) or its channel closes.
#[derive(Debug)]
pub struct Consumer {
    tag: String,
    channel: Channel,
    deliveries: ReceiverStream<Delivery>,
}

impl Consumer {
    pub(crate) fn new(tag: String, channel: Channel, deliveries: mpsc::Receiver<Delivery>) -> Self {
        Self {
            tag,
            channel,
            deliveries: ReceiverStream::new(deliveries),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Next delivery, or `None` once the consumer is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.as_mut().recv().await
    }

    /// Acknowledge a delivery received by this consumer.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.channel.ack(delivery.delivery_tag, false).await
    }

    /// `basic.cancel` this consumer. Deliveries already buffered are still
    /// returned by `recv()`.
    pub async fn cancel(&self) -> Result<()> {
        self.channel.cancel(&self.tag).await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.deliveries).poll_next(cx)
    }
}

/// Messages sent back by `basic.return` on one channel.
#[derive(Debug)]
pub struct Returns {
    returned: ReceiverStream<Returned>,
}

impl Returns {
    pub(crate) fn new(returned: mpsc::Receiver<Returned>) -> Self {
        Self {
            returned: ReceiverStream::new(returned),
        }
    }

    pub async fn recv(&mut self) -> Option<Returned> {
        self.returned.as_mut().recv().await
    }
}

impl Stream for Returns {
    type Item = Returned;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.returned).poll_next(cx)
    }
}
