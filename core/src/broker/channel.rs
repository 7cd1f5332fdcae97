//! Per-channel state machine.
//!
//! A channel task owns its inbox of frames and the event queue its consumers
//! deliver into. Frames are handled strictly one at a time in arrival order;
//! deliveries are interleaved between frames, never in the middle of one.
//!
//! States run `Init -> Open -> Closing -> Closed`. A soft error sends
//! `channel.close` and parks the channel in `Closing` until the peer answers
//! with `close-ok`. A hard error is handed to the connection, which closes
//! everything.

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Broker;
use crate::protocol::constants::*;
use crate::protocol::{
    BasicAck, BasicCancel, BasicConsume, BasicDeliver, BasicMethod, BasicNack, BasicPublish,
    BasicReturn, ChannelMethod, Close, ConsumerTag, ContentHeader, ExchangeMethod, Flow, Frame,
    FrameType, Method, ProtocolError, QueueDeleteOk, QueueMethod, TxMethod,
};
use crate::queue::{ChannelFlow, Consumer, ConsumerEvent, Delivery, DeliveryTarget, Queue};
use crate::storage::{Message, QueueMessage};
use crate::{Result, WarrenError};

/// What a channel needs from the connection that owns it.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub id: u16,
    pub connection_id: u64,
    pub broker: Arc<Broker>,
    /// Frames in one `Vec` reach the socket back to back.
    pub outbound: mpsc::Sender<Vec<Frame>>,
    /// Hard errors escalate to the connection through here.
    pub errors: mpsc::Sender<ProtocolError>,
    pub frame_max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    Open,
    Closing,
    Closed,
}

/// A publish waiting for its header and body frames.
#[derive(Debug)]
struct Assembly {
    publish: BasicPublish,
    header: Option<ContentHeader>,
    body: BytesMut,
}

#[derive(Debug)]
struct Publication {
    publish: BasicPublish,
    header: ContentHeader,
    body: Bytes,
}

#[derive(Debug)]
struct Unacked {
    queue: Arc<Queue>,
    message: QueueMessage,
    consumer: Arc<Consumer>,
}

#[derive(Debug)]
enum TxOp {
    Publish(Publication),
    Ack(BasicAck),
    Nack(BasicNack),
}

/// Upper bound on what a content header may make us reserve up front.
const MAX_BODY_PREALLOC: u64 = 1024 * 1024;

#[derive(Debug)]
pub struct Channel {
    ctx: ChannelContext,
    state: ChannelState,
    flow: Arc<ChannelFlow>,
    events: mpsc::Sender<ConsumerEvent>,
    consumers: HashMap<String, (Arc<Queue>, Arc<Consumer>)>,
    unacked: BTreeMap<u64, Unacked>,
    next_delivery_tag: u64,
    next_consumer_tag: u64,
    assembly: Option<Assembly>,
    tx: Option<Vec<TxOp>>,
}

impl Channel {
    /// Start a channel task. Returns its inbox and handle; the task ends when
    /// the channel closes or the inbox sender is dropped.
    pub fn spawn(ctx: ChannelContext, capacity: usize) -> (mpsc::Sender<Frame>, JoinHandle<()>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let channel = Channel {
            ctx,
            state: ChannelState::Init,
            flow: Arc::new(ChannelFlow::default()),
            events: events_tx,
            consumers: HashMap::new(),
            unacked: BTreeMap::new(),
            next_delivery_tag: 1,
            next_consumer_tag: 1,
            assembly: None,
            tx: None,
        };
        (inbox_tx, tokio::spawn(channel.run(inbox_rx, events_rx)))
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Frame>,
        mut events: mpsc::Receiver<ConsumerEvent>,
    ) {
        let metrics = Arc::clone(&self.ctx.broker.metrics);
        metrics.broker.channel_opened();
        debug!(
            connection_id = self.ctx.connection_id,
            channel = self.ctx.id,
            "Channel started"
        );

        while self.state != ChannelState::Closed {
            let result = tokio::select! {
                frame = inbox.recv() => match frame {
                    Some(frame) => self.handle_frame(frame).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            };
            if let Err(err) = result {
                self.fail(err).await;
            }
        }

        self.release_all();
        events.close();
        while let Ok(event) = events.try_recv() {
            if let ConsumerEvent::Deliver(delivery) = event {
                self.return_to_queue(delivery);
            }
        }
        metrics.broker.channel_closed();
        debug!(
            connection_id = self.ctx.connection_id,
            channel = self.ctx.id,
            "Channel stopped"
        );
    }

    async fn fail(&mut self, err: WarrenError) {
        let err = match err {
            WarrenError::Protocol(err) => err,
            WarrenError::Codec(err) => err.into(),
            WarrenError::ConnectionClosed | WarrenError::ChannelClosed => {
                self.state = ChannelState::Closed;
                return;
            }
            other => ProtocolError::internal(other.to_string()),
        };

        if err.is_hard() {
            self.state = ChannelState::Closed;
            let _ = self.ctx.errors.send(err).await;
            return;
        }

        warn!(
            connection_id = self.ctx.connection_id,
            channel = self.ctx.id,
            code = err.code,
            "Closing channel: {}",
            err.text
        );
        self.ctx.broker.metrics.broker.soft_error();
        self.release_all();
        self.state = ChannelState::Closing;
        let close = Method::Channel(ChannelMethod::Close(Close::from(&err)));
        if self.reply(close).await.is_err() {
            self.state = ChannelState::Closed;
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        if self.state == ChannelState::Closing {
            return self.handle_closing(frame).await;
        }

        match frame.frame_type {
            FrameType::Method => {
                if self.assembly.is_some() {
                    return Err(ProtocolError::unexpected_frame(
                        "method frame while content is incomplete",
                    )
                    .into());
                }
                let method = frame.decode_method()?;
                let (class_id, method_id) = method.id();
                debug!(
                    connection_id = self.ctx.connection_id,
                    channel = self.ctx.id,
                    method = method.name(),
                    "Channel method"
                );
                self.handle_method(method).await.map_err(|e| match e {
                    WarrenError::Protocol(p) if p.class_id == 0 => {
                        WarrenError::Protocol(p.on(class_id, method_id))
                    }
                    other => other,
                })
            }
            FrameType::Header => self.handle_header(&frame).await,
            FrameType::Body => self.handle_body(frame.payload).await,
        }
    }

    /// Only `close` and `close-ok` mean anything while waiting for `close-ok`.
    async fn handle_closing(&mut self, frame: Frame) -> Result<()> {
        if frame.frame_type != FrameType::Method {
            return Ok(());
        }
        match frame.decode_method() {
            Ok(Method::Channel(ChannelMethod::CloseOk)) => {
                self.state = ChannelState::Closed;
            }
            Ok(Method::Channel(ChannelMethod::Close(_))) => {
                self.state = ChannelState::Closed;
                self.reply(Method::Channel(ChannelMethod::CloseOk)).await?;
            }
            _ => debug!(channel = self.ctx.id, "Dropping frame on closing channel"),
        }
        Ok(())
    }

    async fn handle_method(&mut self, method: Method) -> Result<()> {
        if self.state == ChannelState::Init {
            self.state = ChannelState::Open;
            if method == Method::Channel(ChannelMethod::Open) {
                return self.reply(Method::Channel(ChannelMethod::OpenOk)).await;
            }
        }

        match method {
            Method::Channel(method) => self.on_channel(method).await,
            Method::Exchange(method) => self.on_exchange(method).await,
            Method::Queue(method) => self.on_queue(method).await,
            Method::Basic(method) => self.on_basic(method).await,
            Method::Tx(method) => self.on_tx(method).await,
            Method::Connection(method) => Err(ProtocolError::command_invalid(format!(
                "{} on channel {}",
                Method::Connection(method).name(),
                self.ctx.id
            ))
            .into()),
        }
    }

    async fn on_channel(&mut self, method: ChannelMethod) -> Result<()> {
        match method {
            ChannelMethod::Open => Err(ProtocolError::channel_error(format!(
                "channel {} already open",
                self.ctx.id
            ))
            .into()),
            ChannelMethod::Flow(Flow { active }) => {
                self.flow.set_active(active);
                if active {
                    for (queue, _) in self.consumers.values() {
                        queue.wake();
                    }
                }
                self.reply(Method::Channel(ChannelMethod::FlowOk(Flow { active })))
                    .await
            }
            ChannelMethod::FlowOk(_) | ChannelMethod::CloseOk => Ok(()),
            ChannelMethod::Close(close) => {
                debug!(
                    channel = self.ctx.id,
                    code = close.reply_code,
                    "Peer closed channel: {}",
                    close.reply_text
                );
                self.release_all();
                self.state = ChannelState::Closed;
                self.reply(Method::Channel(ChannelMethod::CloseOk)).await
            }
            ChannelMethod::OpenOk => Err(unexpected("channel.open-ok")),
        }
    }

    async fn on_exchange(&mut self, method: ExchangeMethod) -> Result<()> {
        let registry = &self.ctx.broker.registry;
        match method {
            ExchangeMethod::Declare(args) => {
                registry.declare_exchange(&args)?;
                self.reply_unless(args.no_wait, Method::Exchange(ExchangeMethod::DeclareOk))
                    .await
            }
            ExchangeMethod::Delete(args) => {
                registry.delete_exchange(&args.exchange, args.if_unused)?;
                self.reply_unless(args.no_wait, Method::Exchange(ExchangeMethod::DeleteOk))
                    .await
            }
            ExchangeMethod::Bind(_) | ExchangeMethod::Unbind(_) => {
                Err(ProtocolError::not_implemented("exchange-to-exchange bindings").into())
            }
            other => Err(unexpected(Method::Exchange(other).name())),
        }
    }

    async fn on_queue(&mut self, method: QueueMethod) -> Result<()> {
        let registry = &self.ctx.broker.registry;
        let connection_id = self.ctx.connection_id;
        match method {
            QueueMethod::Declare(args) => {
                let ok = registry.declare_queue(&args, connection_id)?;
                self.reply_unless(args.no_wait, Method::Queue(QueueMethod::DeclareOk(ok)))
                    .await
            }
            QueueMethod::Bind(args) => {
                registry.bind_queue(&args.queue, &args.exchange, &args.routing_key, connection_id)?;
                self.reply_unless(args.no_wait, Method::Queue(QueueMethod::BindOk))
                    .await
            }
            QueueMethod::Unbind(args) => {
                registry.unbind_queue(&args.queue, &args.exchange, &args.routing_key, connection_id)?;
                self.reply(Method::Queue(QueueMethod::UnbindOk)).await
            }
            QueueMethod::Delete(args) => {
                let message_count =
                    registry.delete_queue(&args.queue, args.if_unused, args.if_empty, connection_id)?;
                self.reply_unless(
                    args.no_wait,
                    Method::Queue(QueueMethod::DeleteOk(QueueDeleteOk { message_count })),
                )
                .await
            }
            other => Err(unexpected(Method::Queue(other).name())),
        }
    }

    async fn on_basic(&mut self, method: BasicMethod) -> Result<()> {
        match method {
            BasicMethod::Consume(args) => self.consume(args).await,
            BasicMethod::Cancel(args) => self.cancel(args).await,
            BasicMethod::Publish(publish) => {
                self.assembly = Some(Assembly {
                    publish,
                    header: None,
                    body: BytesMut::new(),
                });
                Ok(())
            }
            BasicMethod::Ack(args) => match self.tx.as_mut() {
                Some(ops) => {
                    ops.push(TxOp::Ack(args));
                    Ok(())
                }
                None => self.ack(args),
            },
            BasicMethod::Nack(args) => match self.tx.as_mut() {
                Some(ops) => {
                    ops.push(TxOp::Nack(args));
                    Ok(())
                }
                None => self.nack(args),
            },
            other => Err(unexpected(Method::Basic(other).name())),
        }
    }

    async fn on_tx(&mut self, method: TxMethod) -> Result<()> {
        match method {
            TxMethod::Select => {
                self.tx.get_or_insert_with(Vec::new);
                self.reply(Method::Tx(TxMethod::SelectOk)).await
            }
            TxMethod::Commit => {
                let Some(ops) = self.tx.as_mut().map(std::mem::take) else {
                    return Err(not_transactional());
                };
                debug!(channel = self.ctx.id, ops = ops.len(), "Committing transaction");
                for op in ops {
                    match op {
                        TxOp::Publish(publication) => self.publish(publication).await?,
                        TxOp::Ack(args) => self.ack(args)?,
                        TxOp::Nack(args) => self.nack(args)?,
                    }
                }
                self.reply(Method::Tx(TxMethod::CommitOk)).await
            }
            TxMethod::Rollback => {
                let Some(ops) = self.tx.as_mut() else {
                    return Err(not_transactional());
                };
                ops.clear();
                self.reply(Method::Tx(TxMethod::RollbackOk)).await
            }
            other => Err(unexpected(Method::Tx(other).name())),
        }
    }

    async fn handle_header(&mut self, frame: &Frame) -> Result<()> {
        let Some(assembly) = self.assembly.as_mut() else {
            return Err(ProtocolError::precondition_failed(
                "content header without a content method",
            )
            .into());
        };
        if assembly.header.is_some() {
            return Err(ProtocolError::precondition_failed(
                "second content header before the body completed",
            )
            .into());
        }
        let header = frame.decode_header()?;
        if header.class_id != CLASS_BASIC {
            return Err(ProtocolError::precondition_failed(format!(
                "content header for class {}",
                header.class_id
            ))
            .into());
        }
        assembly
            .body
            .reserve(header.body_size.min(MAX_BODY_PREALLOC) as usize);
        let complete = header.body_size == 0;
        assembly.header = Some(header);
        if complete {
            self.complete_content().await?;
        }
        Ok(())
    }

    async fn handle_body(&mut self, payload: Bytes) -> Result<()> {
        let Some(assembly) = self.assembly.as_mut() else {
            return Err(ProtocolError::precondition_failed(
                "content body without a content method",
            )
            .into());
        };
        let Some(header) = assembly.header.as_ref() else {
            return Err(ProtocolError::precondition_failed("content body before header").into());
        };
        let size = (assembly.body.len() + payload.len()) as u64;
        if size > header.body_size {
            return Err(ProtocolError::precondition_failed(format!(
                "content body of {} bytes exceeds declared {}",
                size, header.body_size
            ))
            .into());
        }
        assembly.body.extend_from_slice(&payload);
        if size == header.body_size {
            self.complete_content().await?;
        }
        Ok(())
    }

    async fn complete_content(&mut self) -> Result<()> {
        let Some(Assembly {
            publish,
            header: Some(header),
            body,
        }) = self.assembly.take()
        else {
            return Ok(());
        };
        let publication = Publication {
            publish,
            header,
            body: body.freeze(),
        };
        match self.tx.as_mut() {
            Some(ops) => {
                ops.push(TxOp::Publish(publication));
                Ok(())
            }
            None => self.publish(publication).await,
        }
    }

    /// Route a completed message. Unroutable messages are returned when
    /// `mandatory` or `immediate` is set and dropped otherwise.
    async fn publish(&mut self, publication: Publication) -> Result<()> {
        let broker = Arc::clone(&self.ctx.broker);
        let Publication {
            publish,
            header,
            body,
        } = publication;

        let queues = broker.registry.route(&publish.exchange, &publish.routing_key)?;
        broker.metrics.throughput.record_published(body.len() as u64);

        if queues.is_empty() {
            if publish.mandatory || publish.immediate {
                broker.metrics.throughput.record_returned();
                let method = Method::Basic(BasicMethod::Return(BasicReturn {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                    exchange: publish.exchange,
                    routing_key: publish.routing_key,
                }));
                let frames = Frame::content(self.ctx.id, &method, &header, &body, self.ctx.frame_max)?;
                return self.send(frames).await;
            }
            broker.metrics.throughput.record_unroutable();
            debug!(
                exchange = %publish.exchange,
                routing_key = %publish.routing_key,
                "Dropping unroutable message"
            );
            return Ok(());
        }

        let message = Arc::new(Message {
            id: broker.store.next_id(),
            exchange: publish.exchange,
            routing_key: publish.routing_key,
            header,
            body,
        });
        let names: Vec<String> = queues.iter().map(|q| q.name.clone()).collect();
        let refs = broker.store.add(message, &names);
        for (queue, qm) in queues.iter().zip(refs) {
            queue.push(qm);
        }
        broker.metrics.throughput.record_routed(queues.len());
        Ok(())
    }

    async fn consume(&mut self, args: BasicConsume) -> Result<()> {
        let broker = Arc::clone(&self.ctx.broker);
        let queue = broker
            .registry
            .queue(&args.queue)
            .ok_or_else(|| ProtocolError::not_found(format!("no queue '{}'", args.queue)))?;
        queue.check_access(self.ctx.connection_id)?;

        let tag = if args.consumer_tag.is_empty() {
            let n = self.next_consumer_tag;
            self.next_consumer_tag += 1;
            format!("ctag-{}.{}", self.ctx.id, n)
        } else {
            args.consumer_tag
        };
        if self.consumers.contains_key(&tag) {
            return Err(ProtocolError::not_allowed(format!("duplicate consumer tag '{tag}'")).into());
        }

        let target = DeliveryTarget {
            connection_id: self.ctx.connection_id,
            channel_id: self.ctx.id,
            flow: Arc::clone(&self.flow),
            events: self.events.clone(),
        };
        let consumer = Arc::new(Consumer::new(
            tag.clone(),
            target,
            args.no_ack,
            args.exclusive,
            broker.config.consumer_budget,
        ));
        queue.add_consumer(Arc::clone(&consumer))?;
        info!(
            queue = %queue.name,
            consumer_tag = %tag,
            channel = self.ctx.id,
            no_ack = args.no_ack,
            "Consumer attached"
        );
        self.consumers.insert(tag.clone(), (queue, consumer));

        self.reply_unless(
            args.no_wait,
            Method::Basic(BasicMethod::ConsumeOk(ConsumerTag { consumer_tag: tag })),
        )
        .await
    }

    async fn cancel(&mut self, args: BasicCancel) -> Result<()> {
        if let Some((queue, consumer)) = self.consumers.remove(&args.consumer_tag) {
            self.detach(&queue, &consumer);
        }
        self.reply_unless(
            args.no_wait,
            Method::Basic(BasicMethod::CancelOk(ConsumerTag {
                consumer_tag: args.consumer_tag,
            })),
        )
        .await
    }

    fn detach(&self, queue: &Arc<Queue>, consumer: &Consumer) {
        if let Some((_, remaining)) =
            queue.remove_consumer(&consumer.tag, self.ctx.connection_id, self.ctx.id)
        {
            debug!(queue = %queue.name, consumer_tag = %consumer.tag, "Consumer detached");
            self.ctx.broker.registry.consumer_removed(queue, remaining);
        }
    }

    async fn handle_event(&mut self, event: ConsumerEvent) -> Result<()> {
        match event {
            ConsumerEvent::Deliver(delivery) => self.deliver(delivery).await,
            ConsumerEvent::Cancelled(tag) => {
                if self.consumers.remove(&tag).is_none() {
                    return Ok(());
                }
                info!(consumer_tag = %tag, channel = self.ctx.id, "Consumer cancelled by broker");
                self.reply(Method::Basic(BasicMethod::Cancel(BasicCancel {
                    consumer_tag: tag,
                    no_wait: true,
                })))
                .await
            }
        }
    }

    async fn deliver(&mut self, delivery: Delivery) -> Result<()> {
        let Some((queue, consumer)) = self.consumers.get(&delivery.consumer_tag).cloned() else {
            self.return_to_queue(delivery);
            return Ok(());
        };

        let delivery_tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;

        let message = &delivery.message;
        let method = Method::Basic(BasicMethod::Deliver(BasicDeliver {
            consumer_tag: delivery.consumer_tag.clone(),
            delivery_tag,
            redelivered: delivery.redelivered,
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        }));
        let frames = Frame::content(
            self.ctx.id,
            &method,
            &message.header,
            &message.body,
            self.ctx.frame_max,
        )?;

        let store = &self.ctx.broker.store;
        store.mark_delivered(&delivery.queue_message, &queue.name);
        if consumer.no_ack {
            store.remove_ref(&delivery.queue_message, &queue.name, &consumer.holders());
        } else {
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    queue,
                    message: delivery.queue_message,
                    consumer,
                },
            );
        }
        self.send(frames).await
    }

    /// Put back a delivery whose consumer is gone.
    fn return_to_queue(&self, delivery: Delivery) {
        match self.ctx.broker.registry.queue(&delivery.queue) {
            Some(queue) => queue.requeue(delivery.undelivered()),
            None => {
                self.ctx
                    .broker
                    .store
                    .remove_ref(&delivery.undelivered(), &delivery.queue, &[])
            }
        }
    }

    /// Take the unacked deliveries an ack or nack refers to. Tag 0 with
    /// `multiple` means all of them.
    fn take_unacked(&mut self, delivery_tag: u64, multiple: bool) -> Result<Vec<Unacked>> {
        if multiple && delivery_tag == 0 {
            return Ok(std::mem::take(&mut self.unacked).into_values().collect());
        }
        if !self.unacked.contains_key(&delivery_tag) {
            return Err(ProtocolError::precondition_failed(format!(
                "unknown delivery tag {delivery_tag}"
            ))
            .into());
        }
        if multiple {
            let rest = self.unacked.split_off(&(delivery_tag + 1));
            let taken = std::mem::replace(&mut self.unacked, rest);
            return Ok(taken.into_values().collect());
        }
        Ok(self.unacked.remove(&delivery_tag).into_iter().collect())
    }

    fn ack(&mut self, args: BasicAck) -> Result<()> {
        let taken = self.take_unacked(args.delivery_tag, args.multiple)?;
        let broker = &self.ctx.broker;
        broker.metrics.throughput.record_acked(taken.len() as u64);
        for entry in &taken {
            broker
                .store
                .remove_ref(&entry.message, &entry.queue.name, &entry.consumer.holders());
        }
        wake_all(&taken);
        Ok(())
    }

    fn nack(&mut self, args: BasicNack) -> Result<()> {
        let taken = self.take_unacked(args.delivery_tag, args.multiple)?;
        let broker = &self.ctx.broker;
        broker.metrics.throughput.record_nacked(taken.len() as u64);
        if args.requeue {
            // requeue newest first so the oldest ends up at the head
            for entry in taken.iter().rev() {
                broker.store.release(&entry.message, &entry.consumer.holders());
                entry.queue.requeue(entry.message);
            }
        } else {
            for entry in &taken {
                broker
                    .store
                    .remove_ref(&entry.message, &entry.queue.name, &entry.consumer.holders());
            }
        }
        wake_all(&taken);
        Ok(())
    }

    /// Cancel every consumer, requeue unacked deliveries and drop buffered
    /// content and transaction state.
    fn release_all(&mut self) {
        let consumers: Vec<_> = self.consumers.drain().collect();
        for (_, (queue, consumer)) in consumers {
            self.detach(&queue, &consumer);
        }

        let unacked = std::mem::take(&mut self.unacked);
        let store = &self.ctx.broker.store;
        for entry in unacked.into_values().rev() {
            store.release(&entry.message, &entry.consumer.holders());
            entry.queue.requeue(entry.message);
        }

        self.assembly = None;
        self.tx = None;
    }

    async fn send(&self, frames: Vec<Frame>) -> Result<()> {
        self.ctx
            .outbound
            .send(frames)
            .await
            .map_err(|_| WarrenError::ConnectionClosed)
    }

    async fn reply(&self, method: Method) -> Result<()> {
        let frame = Frame::method(self.ctx.id, &method)?;
        self.send(vec![frame]).await
    }

    async fn reply_unless(&self, no_wait: bool, method: Method) -> Result<()> {
        if no_wait {
            return Ok(());
        }
        self.reply(method).await
    }
}

fn wake_all(entries: &[Unacked]) {
    let mut woken: Vec<&Arc<Queue>> = Vec::new();
    for entry in entries {
        if !woken.iter().any(|q| Arc::ptr_eq(q, &entry.queue)) {
            entry.queue.wake();
            woken.push(&entry.queue);
        }
    }
}

fn unexpected(name: &str) -> WarrenError {
    ProtocolError::command_invalid(format!("unexpected {name}")).into()
}

fn not_transactional() -> WarrenError {
    ProtocolError::precondition_failed("channel is not transactional").into()
}
