//! Client side of one channel.
//!
//! A [`Channel`] is a cheap handle over state shared with the connection's
//! reader task. Synchronous methods go through [`Channel::call`], which keeps
//! at most one request outstanding and resolves on the matching `*-ok`, on a
//! broker `channel.close`, or on the connection going away, whichever comes
//! first. Content (`deliver`/`return`) is assembled by the reader and handed
//! to the consumer's buffer.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use warren::protocol::constants::*;
use warren::protocol::methods::lookup;
use warren::protocol::{
    BasicAck, BasicCancel, BasicConsume, BasicDeliver, BasicMethod, BasicNack, BasicProperties,
    BasicPublish, BasicReturn, ChannelMethod, Close, ConsumerTag, ContentHeader, ExchangeDeclare,
    ExchangeDelete, ExchangeMethod, FieldTable, Flow, Frame, FrameType, Method, QueueBind,
    QueueDeclare, QueueDeclareOk, QueueDelete, QueueMethod, QueueUnbind, TxMethod,
};

use crate::consumer::{Consumer, Delivery, Returned, Returns};
use crate::{ClientConfig, ClientError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Return the message when no queue is bound for it
    pub mandatory: bool,
    pub immediate: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Why a channel stopped.
#[derive(Debug, Clone)]
enum Shutdown {
    Channel { code: u16, text: String },
    Connection { code: u16, text: String },
}

impl Shutdown {
    fn error(&self) -> ClientError {
        match self {
            Shutdown::Channel { code, text } => ClientError::ChannelClosed {
                code: *code,
                text: text.clone(),
            },
            Shutdown::Connection { code, text } => ClientError::ConnectionClosed {
                code: *code,
                text: text.clone(),
            },
        }
    }
}

#[derive(Debug)]
struct Pending {
    expect: (u16, u16),
    expect_name: &'static str,
    reply: oneshot::Sender<Result<Method>>,
    // Registered by the reader on consume-ok, before any deliver can follow
    consumer: Option<mpsc::Sender<Delivery>>,
}

#[derive(Debug)]
enum Incoming {
    Deliver(BasicDeliver),
    Return(BasicReturn),
}

#[derive(Debug)]
struct Assembly {
    method: Incoming,
    header: Option<ContentHeader>,
    body: BytesMut,
}

#[derive(Debug)]
struct State {
    shutdown: Option<Shutdown>,
    pending: Option<Pending>,
    assembly: Option<Assembly>,
    consumers: HashMap<String, mpsc::Sender<Delivery>>,
    returns_tx: Option<mpsc::Sender<Returned>>,
    returns_rx: Option<mpsc::Receiver<Returned>>,
}

/// Channel state shared between [`Channel`] handles and the reader task.
#[derive(Debug)]
pub(crate) struct ChannelShared {
    id: u16,
    outbound: mpsc::Sender<Vec<Frame>>,
    frame_max: usize,
    rpc_timeout: Duration,
    inbox_capacity: usize,
    rpc: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

impl ChannelShared {
    pub(crate) fn new(
        id: u16,
        outbound: mpsc::Sender<Vec<Frame>>,
        frame_max: usize,
        config: &ClientConfig,
    ) -> Self {
        let capacity = config.inbox_capacity.max(1);
        let (returns_tx, returns_rx) = mpsc::channel(capacity);
        Self {
            id,
            outbound,
            frame_max,
            rpc_timeout: config.rpc_timeout,
            inbox_capacity: capacity,
            rpc: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                shutdown: None,
                pending: None,
                assembly: None,
                consumers: HashMap::new(),
                returns_tx: Some(returns_tx),
                returns_rx: Some(returns_rx),
            }),
        }
    }

    /// Process one frame from the reader. Returns `true` once the channel is
    /// finished and can be forgotten by the connection.
    pub(crate) async fn handle_frame(&self, frame: Frame) -> bool {
        match frame.frame_type {
            FrameType::Method => match frame.decode_method() {
                Ok(method) => self.handle_method(method).await,
                Err(e) => {
                    warn!(channel = self.id, "Dropping undecodable method: {}", e);
                    false
                }
            },
            FrameType::Header => {
                self.handle_header(&frame).await;
                false
            }
            FrameType::Body => {
                self.handle_body(frame.payload).await;
                false
            }
        }
    }

    /// Fail the pending call and every later one, and end all consumer
    /// streams.
    pub(crate) fn fail_connection(&self, code: u16, text: &str) {
        self.fail(Shutdown::Connection {
            code,
            text: text.to_string(),
        });
    }

    fn fail(&self, shutdown: Shutdown) {
        let mut state = self.state.lock();
        if state.shutdown.is_none() {
            state.shutdown = Some(shutdown);
        }
        let error = state.shutdown.as_ref().map(Shutdown::error);
        if let (Some(pending), Some(error)) = (state.pending.take(), error) {
            let _ = pending.reply.send(Err(error));
        }
        state.assembly = None;
        state.consumers.clear();
        state.returns_tx = None;
    }

    fn closed_error(&self) -> Option<ClientError> {
        self.state.lock().shutdown.as_ref().map(Shutdown::error)
    }

    async fn handle_method(&self, method: Method) -> bool {
        match method {
            Method::Channel(ChannelMethod::Close(close)) => {
                debug!(
                    channel = self.id,
                    code = close.reply_code,
                    "Broker closed channel: {}",
                    close.reply_text
                );
                self.fail(Shutdown::Channel {
                    code: close.reply_code,
                    text: close.reply_text,
                });
                let ok = Method::Channel(ChannelMethod::CloseOk);
                if let Ok(frame) = Frame::method(self.id, &ok) {
                    let _ = self.outbound.send(vec![frame]).await;
                }
                true
            }
            Method::Basic(BasicMethod::Deliver(deliver)) => {
                self.begin_content(Incoming::Deliver(deliver));
                false
            }
            Method::Basic(BasicMethod::Return(returned)) => {
                self.begin_content(Incoming::Return(returned));
                false
            }
            Method::Basic(BasicMethod::Cancel(cancel)) => {
                debug!(channel = self.id, consumer_tag = %cancel.consumer_tag, "Consumer cancelled by broker");
                self.state.lock().consumers.remove(&cancel.consumer_tag);
                if !cancel.no_wait {
                    let ok = Method::Basic(BasicMethod::CancelOk(ConsumerTag {
                        consumer_tag: cancel.consumer_tag,
                    }));
                    if let Ok(frame) = Frame::method(self.id, &ok) {
                        let _ = self.outbound.send(vec![frame]).await;
                    }
                }
                false
            }
            reply => self.resolve(reply),
        }
    }

    fn resolve(&self, reply: Method) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.take() else {
            warn!(channel = self.id, "Unsolicited {}", reply.name());
            return false;
        };
        if reply.id() != pending.expect {
            let _ = pending.reply.send(Err(ClientError::UnexpectedReply {
                expected: pending.expect_name,
                got: reply.name(),
            }));
            return false;
        }

        let mut finished = false;
        match &reply {
            Method::Basic(BasicMethod::ConsumeOk(ok)) => {
                if let Some(consumer) = pending.consumer {
                    state.consumers.insert(ok.consumer_tag.clone(), consumer);
                }
            }
            Method::Basic(BasicMethod::CancelOk(ok)) => {
                state.consumers.remove(&ok.consumer_tag);
            }
            Method::Channel(ChannelMethod::CloseOk) => {
                state.shutdown = Some(Shutdown::Channel {
                    code: REPLY_SUCCESS,
                    text: "channel closed".to_string(),
                });
                state.consumers.clear();
                state.returns_tx = None;
                finished = true;
            }
            _ => {}
        }
        let _ = pending.reply.send(Ok(reply));
        finished
    }

    fn begin_content(&self, method: Incoming) {
        let mut state = self.state.lock();
        if state.assembly.is_some() {
            warn!(channel = self.id, "Content method before previous content completed");
        }
        state.assembly = Some(Assembly {
            method,
            header: None,
            body: BytesMut::new(),
        });
    }

    async fn handle_header(&self, frame: &Frame) {
        let header = match frame.decode_header() {
            Ok(header) => header,
            Err(e) => {
                warn!(channel = self.id, "Dropping undecodable content header: {}", e);
                self.state.lock().assembly = None;
                return;
            }
        };
        let complete = {
            let mut state = self.state.lock();
            let Some(assembly) = state.assembly.as_mut() else {
                warn!(channel = self.id, "Content header without a content method");
                return;
            };
            let empty = header.body_size == 0;
            assembly.body.reserve(header.body_size as usize);
            assembly.header = Some(header);
            if empty {
                state.assembly.take()
            } else {
                None
            }
        };
        if let Some(assembly) = complete {
            self.complete_content(assembly).await;
        }
    }

    async fn handle_body(&self, payload: Bytes) {
        let complete = {
            let mut state = self.state.lock();
            let Some(assembly) = state.assembly.as_mut() else {
                warn!(channel = self.id, "Content body without a content method");
                return;
            };
            let Some(expected) = assembly.header.as_ref().map(|h| h.body_size) else {
                warn!(channel = self.id, "Content body before header");
                state.assembly = None;
                return;
            };
            assembly.body.extend_from_slice(&payload);
            if assembly.body.len() as u64 >= expected {
                state.assembly.take()
            } else {
                None
            }
        };
        if let Some(assembly) = complete {
            self.complete_content(assembly).await;
        }
    }

    async fn complete_content(&self, assembly: Assembly) {
        let properties = assembly
            .header
            .map(|h| h.properties)
            .unwrap_or_default();
        let body = assembly.body.freeze();

        match assembly.method {
            Incoming::Deliver(deliver) => {
                let consumer = self.state.lock().consumers.get(&deliver.consumer_tag).cloned();
                let Some(consumer) = consumer else {
                    debug!(
                        channel = self.id,
                        consumer_tag = %deliver.consumer_tag,
                        "Delivery for a cancelled consumer"
                    );
                    return;
                };
                let delivery = Delivery {
                    consumer_tag: deliver.consumer_tag,
                    delivery_tag: deliver.delivery_tag,
                    redelivered: deliver.redelivered,
                    exchange: deliver.exchange,
                    routing_key: deliver.routing_key,
                    properties,
                    body,
                };
                if consumer.send(delivery).await.is_err() {
                    debug!(channel = self.id, "Consumer dropped, delivery discarded");
                }
            }
            Incoming::Return(returned) => {
                let returns = self.state.lock().returns_tx.clone();
                let Some(returns) = returns else {
                    return;
                };
                let returned = Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text,
                    exchange: returned.exchange,
                    routing_key: returned.routing_key,
                    properties,
                    body,
                };
                if returns.try_send(returned).is_err() {
                    warn!(channel = self.id, "Return buffer full or unread, message dropped");
                }
            }
        }
    }
}

/// Handle to an open channel. Clones share the channel.
#[derive(Debug, Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn new(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().shutdown.is_some()
    }

    pub(crate) async fn open(&self) -> Result<()> {
        self.call(Method::Channel(ChannelMethod::Open)).await?;
        Ok(())
    }

    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: &str,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.call(Method::Exchange(ExchangeMethod::Declare(ExchangeDeclare {
            exchange: exchange.to_string(),
            kind: kind.to_string(),
            passive: options.passive,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            no_wait: false,
            arguments: FieldTable::new(),
        })))
        .await?;
        Ok(())
    }

    pub async fn exchange_delete(&self, exchange: &str, if_unused: bool) -> Result<()> {
        self.call(Method::Exchange(ExchangeMethod::Delete(ExchangeDelete {
            exchange: exchange.to_string(),
            if_unused,
            no_wait: false,
        })))
        .await?;
        Ok(())
    }

    /// Declare a queue. An empty name asks the broker to generate one; the
    /// reply carries the name plus message and consumer counts.
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueDeclareOk> {
        let reply = self
            .call(Method::Queue(QueueMethod::Declare(QueueDeclare {
                queue: queue.to_string(),
                passive: options.passive,
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                no_wait: false,
                arguments: FieldTable::new(),
            })))
            .await?;
        match reply {
            Method::Queue(QueueMethod::DeclareOk(ok)) => Ok(ok),
            other => Err(unexpected_reply("queue.declare-ok", &other)),
        }
    }

    pub async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.call(Method::Queue(QueueMethod::Bind(QueueBind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            no_wait: false,
            arguments: FieldTable::new(),
        })))
        .await?;
        Ok(())
    }

    pub async fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.call(Method::Queue(QueueMethod::Unbind(QueueUnbind {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments: FieldTable::new(),
        })))
        .await?;
        Ok(())
    }

    /// Delete a queue, returning the number of messages it still held.
    pub async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        let reply = self
            .call(Method::Queue(QueueMethod::Delete(QueueDelete {
                queue: queue.to_string(),
                if_unused: options.if_unused,
                if_empty: options.if_empty,
                no_wait: false,
            })))
            .await?;
        match reply {
            Method::Queue(QueueMethod::DeleteOk(ok)) => Ok(ok.message_count),
            other => Err(unexpected_reply("queue.delete-ok", &other)),
        }
    }

    /// Send `basic.publish` with its header and body frames in one batch.
    /// Publishing is asynchronous: routing failures come back through
    /// [`Channel::returns`] or as a channel close.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        let body = body.into();
        let method = Method::Basic(BasicMethod::Publish(BasicPublish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory: options.mandatory,
            immediate: options.immediate,
        }));
        let header = ContentHeader::new(body.len() as u64, properties);
        let frames = Frame::content(self.id(), &method, &header, &body, self.shared.frame_max)?;
        self.send(frames).await
    }

    /// Start a consumer on `queue`. An empty tag lets the broker pick one.
    pub async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer> {
        let (tx, rx) = mpsc::channel(self.shared.inbox_capacity);
        let method = Method::Basic(BasicMethod::Consume(BasicConsume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            no_local: false,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            no_wait: false,
            arguments: FieldTable::new(),
        }));
        match self.call_with(method, Some(tx)).await? {
            Method::Basic(BasicMethod::ConsumeOk(ok)) => {
                Ok(Consumer::new(ok.consumer_tag, self.clone(), rx))
            }
            other => Err(unexpected_reply("basic.consume-ok", &other)),
        }
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.call(Method::Basic(BasicMethod::Cancel(BasicCancel {
            consumer_tag: consumer_tag.to_string(),
            no_wait: false,
        })))
        .await?;
        Ok(())
    }

    /// Acknowledge `delivery_tag`, or everything up to it with `multiple`.
    /// Tag 0 with `multiple` acknowledges every outstanding delivery.
    pub async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let method = Method::Basic(BasicMethod::Ack(BasicAck {
            delivery_tag,
            multiple,
        }));
        self.send(vec![Frame::method(self.id(), &method)?]).await
    }

    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let method = Method::Basic(BasicMethod::Nack(BasicNack {
            delivery_tag,
            multiple,
            requeue,
        }));
        self.send(vec![Frame::method(self.id(), &method)?]).await
    }

    /// Pause (`false`) or resume (`true`) deliveries on this channel.
    pub async fn flow(&self, active: bool) -> Result<bool> {
        match self
            .call(Method::Channel(ChannelMethod::Flow(Flow { active })))
            .await?
        {
            Method::Channel(ChannelMethod::FlowOk(flow)) => Ok(flow.active),
            other => Err(unexpected_reply("channel.flow-ok", &other)),
        }
    }

    pub async fn tx_select(&self) -> Result<()> {
        self.call(Method::Tx(TxMethod::Select)).await?;
        Ok(())
    }

    pub async fn tx_commit(&self) -> Result<()> {
        self.call(Method::Tx(TxMethod::Commit)).await?;
        Ok(())
    }

    pub async fn tx_rollback(&self) -> Result<()> {
        self.call(Method::Tx(TxMethod::Rollback)).await?;
        Ok(())
    }

    /// Stream of `basic.return`ed messages. Available once per channel.
    pub fn returns(&self) -> Option<Returns> {
        self.shared.state.lock().returns_rx.take().map(Returns::new)
    }

    /// Close the channel. Closing an already closed channel is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        match self
            .call(Method::Channel(ChannelMethod::Close(Close::normal())))
            .await
        {
            Ok(_) => Ok(()),
            // The broker closed it first
            Err(ClientError::ChannelClosed { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send a synchronous method and wait for its reply.
    pub async fn call(&self, method: Method) -> Result<Method> {
        self.call_with(method, None).await
    }

    async fn call_with(
        &self,
        method: Method,
        consumer: Option<mpsc::Sender<Delivery>>,
    ) -> Result<Method> {
        let _rpc = self.shared.rpc.lock().await;

        let (class_id, method_id) = method.id();
        let expect = (class_id, method_id + 1);
        let expect_name = lookup(expect.0, expect.1).map_or("reply", |e| e.name);
        let frame = Frame::method(self.id(), &method)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if let Some(shutdown) = &state.shutdown {
                return Err(shutdown.error());
            }
            state.pending = Some(Pending {
                expect,
                expect_name,
                reply: reply_tx,
                consumer,
            });
        }

        if let Err(e) = self.send(vec![frame]).await {
            self.shared.state.lock().pending = None;
            return Err(e);
        }

        match timeout(self.shared.rpc_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.shared.closed_error().unwrap_or(ClientError::ConnectionClosed {
                code: 0,
                text: "connection lost".to_string(),
            })),
            Err(_) => {
                self.shared.state.lock().pending = None;
                Err(ClientError::timeout(self.shared.rpc_timeout.as_millis() as u64))
            }
        }
    }

    async fn send(&self, frames: Vec<Frame>) -> Result<()> {
        if let Some(err) = self.shared.closed_error() {
            return Err(err);
        }
        self.shared
            .outbound
            .send(frames)
            .await
            .map_err(|_| ClientError::ConnectionClosed {
                code: 0,
                text: "connection writer stopped".to_string(),
            })
    }
}

fn unexpected_reply(expected: &'static str, got: &Method) -> ClientError {
    ClientError::UnexpectedReply {
        expected,
        got: got.name(),
    }
}
