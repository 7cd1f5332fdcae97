//! Method catalog.
//!
//! Every method is a variant of a per-class enum wrapped in [`Method`]. The
//! `(class_id, method_id)` pair of each variant is fixed by the wire contract;
//! [`METHOD_TABLE`] maps each pair to its decoder, and decoding an unknown pair
//! fails with [`CodecError::BadClassMethod`].

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{self, CodecError, FieldTable, Result};
use super::constants::*;
use super::errors::ProtocolError;

/// Field layout of a method's arguments.
trait Fields: Sized {
    fn read(buf: &mut Bytes) -> Result<Self>;
    fn write(&self, buf: &mut BytesMut) -> Result<()>;
}

// ============================================================================
// Connection class
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: FieldTable,
    pub mechanisms: String,
    pub locales: String,
}

impl Fields for ConnectionStart {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            version_major: codec::get_octet(buf)?,
            version_minor: codec::get_octet(buf)?,
            server_properties: codec::get_table(buf)?,
            mechanisms: codec::get_long_string(buf)?,
            locales: codec::get_long_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        codec::put_table(buf, &self.server_properties)?;
        codec::put_long_string(buf, &self.mechanisms);
        codec::put_long_string(buf, &self.locales);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStartOk {
    pub client_properties: FieldTable,
    pub mechanism: String,
    pub response: String,
    pub locale: String,
}

impl Fields for ConnectionStartOk {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            client_properties: codec::get_table(buf)?,
            mechanism: codec::get_short_string(buf)?,
            response: codec::get_long_string(buf)?,
            locale: codec::get_short_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_table(buf, &self.client_properties)?;
        codec::put_short_string(buf, &self.mechanism)?;
        codec::put_long_string(buf, &self.response);
        codec::put_short_string(buf, &self.locale)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOpen {
    pub virtual_host: String,
}

impl Fields for ConnectionOpen {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            virtual_host: codec::get_short_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.virtual_host)
    }
}

/// Arguments of `connection.close` and `channel.close`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Close {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl Close {
    pub fn normal() -> Self {
        Self {
            reply_code: REPLY_SUCCESS,
            reply_text: "normal shutdown".to_string(),
            class_id: 0,
            method_id: 0,
        }
    }
}

impl From<&ProtocolError> for Close {
    fn from(err: &ProtocolError) -> Self {
        // reply_text is a short string
        let mut reply_text = err.text.clone();
        if reply_text.len() > u8::MAX as usize {
            let mut cut = u8::MAX as usize;
            while !reply_text.is_char_boundary(cut) {
                cut -= 1;
            }
            reply_text.truncate(cut);
        }
        Self {
            reply_code: err.code,
            reply_text,
            class_id: err.class_id,
            method_id: err.method_id,
        }
    }
}

impl Fields for Close {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            reply_code: codec::get_short(buf)?,
            reply_text: codec::get_short_string(buf)?,
            class_id: codec::get_short(buf)?,
            method_id: codec::get_short(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.reply_code);
        codec::put_short_string(buf, &self.reply_text)?;
        buf.put_u16(self.class_id);
        buf.put_u16(self.method_id);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMethod {
    Start(ConnectionStart),
    StartOk(ConnectionStartOk),
    Open(ConnectionOpen),
    OpenOk,
    Close(Close),
    CloseOk,
}

// ============================================================================
// Channel class
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub active: bool,
}

impl Fields for Flow {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self { active: bits[0] })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u8(codec::pack_bits(&[self.active]));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMethod {
    Open,
    OpenOk,
    Flow(Flow),
    FlowOk(Flow),
    Close(Close),
    CloseOk,
}

// ============================================================================
// Exchange class
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDeclare {
    pub exchange: String,
    pub kind: String,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Fields for ExchangeDeclare {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let exchange = codec::get_short_string(buf)?;
        let kind = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            exchange,
            kind,
            passive: bits[0],
            durable: bits[1],
            auto_delete: bits[2],
            internal: bits[3],
            no_wait: bits[4],
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.kind)?;
        buf.put_u8(codec::pack_bits(&[
            self.passive,
            self.durable,
            self.auto_delete,
            self.internal,
            self.no_wait,
        ]));
        codec::put_table(buf, &self.arguments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeDelete {
    pub exchange: String,
    pub if_unused: bool,
    pub no_wait: bool,
}

impl Fields for ExchangeDelete {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let exchange = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            exchange,
            if_unused: bits[0],
            no_wait: bits[1],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.exchange)?;
        buf.put_u8(codec::pack_bits(&[self.if_unused, self.no_wait]));
        Ok(())
    }
}

/// Exchange-to-exchange binding arguments (bind and unbind share a layout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeBind {
    pub destination: String,
    pub source: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Fields for ExchangeBind {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let destination = codec::get_short_string(buf)?;
        let source = codec::get_short_string(buf)?;
        let routing_key = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            destination,
            source,
            routing_key,
            no_wait: bits[0],
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.destination)?;
        codec::put_short_string(buf, &self.source)?;
        codec::put_short_string(buf, &self.routing_key)?;
        buf.put_u8(codec::pack_bits(&[self.no_wait]));
        codec::put_table(buf, &self.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeMethod {
    Declare(ExchangeDeclare),
    DeclareOk,
    Delete(ExchangeDelete),
    DeleteOk,
    Bind(ExchangeBind),
    BindOk,
    Unbind(ExchangeBind),
    UnbindOk,
}

// ============================================================================
// Queue class
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclare {
    pub queue: String,
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Fields for QueueDeclare {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let queue = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            queue,
            passive: bits[0],
            durable: bits[1],
            exclusive: bits[2],
            auto_delete: bits[3],
            no_wait: bits[4],
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        buf.put_u8(codec::pack_bits(&[
            self.passive,
            self.durable,
            self.exclusive,
            self.auto_delete,
            self.no_wait,
        ]));
        codec::put_table(buf, &self.arguments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

impl Fields for QueueDeclareOk {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            queue: codec::get_short_string(buf)?,
            message_count: codec::get_long(buf)?,
            consumer_count: codec::get_long(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        buf.put_u32(self.message_count);
        buf.put_u32(self.consumer_count);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Fields for QueueBind {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let queue = codec::get_short_string(buf)?;
        let exchange = codec::get_short_string(buf)?;
        let routing_key = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            queue,
            exchange,
            routing_key,
            no_wait: bits[0],
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.routing_key)?;
        buf.put_u8(codec::pack_bits(&[self.no_wait]));
        codec::put_table(buf, &self.arguments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueUnbind {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub arguments: FieldTable,
}

impl Fields for QueueUnbind {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            queue: codec::get_short_string(buf)?,
            exchange: codec::get_short_string(buf)?,
            routing_key: codec::get_short_string(buf)?,
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.routing_key)?;
        codec::put_table(buf, &self.arguments)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDelete {
    pub queue: String,
    pub if_unused: bool,
    pub if_empty: bool,
    pub no_wait: bool,
}

impl Fields for QueueDelete {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let queue = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            queue,
            if_unused: bits[0],
            if_empty: bits[1],
            no_wait: bits[2],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        buf.put_u8(codec::pack_bits(&[self.if_unused, self.if_empty, self.no_wait]));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeleteOk {
    pub message_count: u32,
}

impl Fields for QueueDeleteOk {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            message_count: codec::get_long(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32(self.message_count);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueMethod {
    Declare(QueueDeclare),
    DeclareOk(QueueDeclareOk),
    Bind(QueueBind),
    BindOk,
    Unbind(QueueUnbind),
    UnbindOk,
    Delete(QueueDelete),
    DeleteOk(QueueDeleteOk),
}

// ============================================================================
// Basic class
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicConsume {
    pub queue: String,
    pub consumer_tag: String,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub arguments: FieldTable,
}

impl Fields for BasicConsume {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let queue = codec::get_short_string(buf)?;
        let consumer_tag = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            queue,
            consumer_tag,
            no_local: bits[0],
            no_ack: bits[1],
            exclusive: bits[2],
            no_wait: bits[3],
            arguments: codec::get_table(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.queue)?;
        codec::put_short_string(buf, &self.consumer_tag)?;
        buf.put_u8(codec::pack_bits(&[
            self.no_local,
            self.no_ack,
            self.exclusive,
            self.no_wait,
        ]));
        codec::put_table(buf, &self.arguments)
    }
}

/// Consumer tag carried by consume-ok and cancel-ok.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerTag {
    pub consumer_tag: String,
}

impl Fields for ConsumerTag {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            consumer_tag: codec::get_short_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.consumer_tag)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicCancel {
    pub consumer_tag: String,
    pub no_wait: bool,
}

impl Fields for BasicCancel {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let consumer_tag = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            consumer_tag,
            no_wait: bits[0],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.consumer_tag)?;
        buf.put_u8(codec::pack_bits(&[self.no_wait]));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
}

impl Fields for BasicPublish {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let exchange = codec::get_short_string(buf)?;
        let routing_key = codec::get_short_string(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            exchange,
            routing_key,
            mandatory: bits[0],
            immediate: bits[1],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.routing_key)?;
        buf.put_u8(codec::pack_bits(&[self.mandatory, self.immediate]));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicReturn {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Fields for BasicReturn {
    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            reply_code: codec::get_short(buf)?,
            reply_text: codec::get_short_string(buf)?,
            exchange: codec::get_short_string(buf)?,
            routing_key: codec::get_short_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.reply_code);
        codec::put_short_string(buf, &self.reply_text)?;
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.routing_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BasicDeliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl Fields for BasicDeliver {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let consumer_tag = codec::get_short_string(buf)?;
        let delivery_tag = codec::get_longlong(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            consumer_tag,
            delivery_tag,
            redelivered: bits[0],
            exchange: codec::get_short_string(buf)?,
            routing_key: codec::get_short_string(buf)?,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        codec::put_short_string(buf, &self.consumer_tag)?;
        buf.put_u64(self.delivery_tag);
        buf.put_u8(codec::pack_bits(&[self.redelivered]));
        codec::put_short_string(buf, &self.exchange)?;
        codec::put_short_string(buf, &self.routing_key)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicAck {
    pub delivery_tag: u64,
    pub multiple: bool,
}

impl Fields for BasicAck {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let delivery_tag = codec::get_longlong(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            delivery_tag,
            multiple: bits[0],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u64(self.delivery_tag);
        buf.put_u8(codec::pack_bits(&[self.multiple]));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicNack {
    pub delivery_tag: u64,
    pub multiple: bool,
    pub requeue: bool,
}

impl Fields for BasicNack {
    fn read(buf: &mut Bytes) -> Result<Self> {
        let delivery_tag = codec::get_longlong(buf)?;
        let bits = codec::unpack_bits(codec::get_octet(buf)?);
        Ok(Self {
            delivery_tag,
            multiple: bits[0],
            requeue: bits[1],
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u64(self.delivery_tag);
        buf.put_u8(codec::pack_bits(&[self.multiple, self.requeue]));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BasicMethod {
    Consume(BasicConsume),
    ConsumeOk(ConsumerTag),
    Cancel(BasicCancel),
    CancelOk(ConsumerTag),
    Publish(BasicPublish),
    Return(BasicReturn),
    Deliver(BasicDeliver),
    Ack(BasicAck),
    Nack(BasicNack),
}

// ============================================================================
// Tx class
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMethod {
    Select,
    SelectOk,
    Commit,
    CommitOk,
    Rollback,
    RollbackOk,
}

// ============================================================================
// Method
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Connection(ConnectionMethod),
    Channel(ChannelMethod),
    Exchange(ExchangeMethod),
    Queue(QueueMethod),
    Basic(BasicMethod),
    Tx(TxMethod),
}

type DecodeFn = fn(&mut Bytes) -> Result<Method>;

/// One row of the `(class_id, method_id)` registry.
pub struct MethodEntry {
    pub class_id: u16,
    pub method_id: u16,
    pub name: &'static str,
    decode: DecodeFn,
}

macro_rules! entry {
    ($class:expr, $method:expr, $name:expr, $decode:expr) => {
        MethodEntry {
            class_id: $class,
            method_id: $method,
            name: $name,
            decode: $decode,
        }
    };
}

pub static METHOD_TABLE: &[MethodEntry] = &[
    entry!(CLASS_CONNECTION, CONNECTION_START, "connection.start", |b| Ok(
        Method::Connection(ConnectionMethod::Start(ConnectionStart::read(b)?))
    )),
    entry!(CLASS_CONNECTION, CONNECTION_START_OK, "connection.start-ok", |b| Ok(
        Method::Connection(ConnectionMethod::StartOk(ConnectionStartOk::read(b)?))
    )),
    entry!(CLASS_CONNECTION, CONNECTION_OPEN, "connection.open", |b| Ok(
        Method::Connection(ConnectionMethod::Open(ConnectionOpen::read(b)?))
    )),
    entry!(CLASS_CONNECTION, CONNECTION_OPEN_OK, "connection.open-ok", |_| Ok(
        Method::Connection(ConnectionMethod::OpenOk)
    )),
    entry!(CLASS_CONNECTION, CONNECTION_CLOSE, "connection.close", |b| Ok(
        Method::Connection(ConnectionMethod::Close(Close::read(b)?))
    )),
    entry!(CLASS_CONNECTION, CONNECTION_CLOSE_OK, "connection.close-ok", |_| Ok(
        Method::Connection(ConnectionMethod::CloseOk)
    )),
    entry!(CLASS_CHANNEL, CHANNEL_OPEN, "channel.open", |_| Ok(Method::Channel(
        ChannelMethod::Open
    ))),
    entry!(CLASS_CHANNEL, CHANNEL_OPEN_OK, "channel.open-ok", |_| Ok(
        Method::Channel(ChannelMethod::OpenOk)
    )),
    entry!(CLASS_CHANNEL, CHANNEL_FLOW, "channel.flow", |b| Ok(Method::Channel(
        ChannelMethod::Flow(Flow::read(b)?)
    ))),
    entry!(CLASS_CHANNEL, CHANNEL_FLOW_OK, "channel.flow-ok", |b| Ok(
        Method::Channel(ChannelMethod::FlowOk(Flow::read(b)?))
    )),
    entry!(CLASS_CHANNEL, CHANNEL_CLOSE, "channel.close", |b| Ok(Method::Channel(
        ChannelMethod::Close(Close::read(b)?)
    ))),
    entry!(CLASS_CHANNEL, CHANNEL_CLOSE_OK, "channel.close-ok", |_| Ok(
        Method::Channel(ChannelMethod::CloseOk)
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_DECLARE, "exchange.declare", |b| Ok(
        Method::Exchange(ExchangeMethod::Declare(ExchangeDeclare::read(b)?))
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_DECLARE_OK, "exchange.declare-ok", |_| Ok(
        Method::Exchange(ExchangeMethod::DeclareOk)
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_DELETE, "exchange.delete", |b| Ok(
        Method::Exchange(ExchangeMethod::Delete(ExchangeDelete::read(b)?))
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_DELETE_OK, "exchange.delete-ok", |_| Ok(
        Method::Exchange(ExchangeMethod::DeleteOk)
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_BIND, "exchange.bind", |b| Ok(
        Method::Exchange(ExchangeMethod::Bind(ExchangeBind::read(b)?))
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_BIND_OK, "exchange.bind-ok", |_| Ok(
        Method::Exchange(ExchangeMethod::BindOk)
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_UNBIND, "exchange.unbind", |b| Ok(
        Method::Exchange(ExchangeMethod::Unbind(ExchangeBind::read(b)?))
    )),
    entry!(CLASS_EXCHANGE, EXCHANGE_UNBIND_OK, "exchange.unbind-ok", |_| Ok(
        Method::Exchange(ExchangeMethod::UnbindOk)
    )),
    entry!(CLASS_QUEUE, QUEUE_DECLARE, "queue.declare", |b| Ok(Method::Queue(
        QueueMethod::Declare(QueueDeclare::read(b)?)
    ))),
    entry!(CLASS_QUEUE, QUEUE_DECLARE_OK, "queue.declare-ok", |b| Ok(
        Method::Queue(QueueMethod::DeclareOk(QueueDeclareOk::read(b)?))
    )),
    entry!(CLASS_QUEUE, QUEUE_BIND, "queue.bind", |b| Ok(Method::Queue(
        QueueMethod::Bind(QueueBind::read(b)?)
    ))),
    entry!(CLASS_QUEUE, QUEUE_BIND_OK, "queue.bind-ok", |_| Ok(Method::Queue(
        QueueMethod::BindOk
    ))),
    entry!(CLASS_QUEUE, QUEUE_UNBIND, "queue.unbind", |b| Ok(Method::Queue(
        QueueMethod::Unbind(QueueUnbind::read(b)?)
    ))),
    entry!(CLASS_QUEUE, QUEUE_UNBIND_OK, "queue.unbind-ok", |_| Ok(
        Method::Queue(QueueMethod::UnbindOk)
    )),
    entry!(CLASS_QUEUE, QUEUE_DELETE, "queue.delete", |b| Ok(Method::Queue(
        QueueMethod::Delete(QueueDelete::read(b)?)
    ))),
    entry!(CLASS_QUEUE, QUEUE_DELETE_OK, "queue.delete-ok", |b| Ok(
        Method::Queue(QueueMethod::DeleteOk(QueueDeleteOk::read(b)?))
    )),
    entry!(CLASS_BASIC, BASIC_CONSUME, "basic.consume", |b| Ok(Method::Basic(
        BasicMethod::Consume(BasicConsume::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_CONSUME_OK, "basic.consume-ok", |b| Ok(
        Method::Basic(BasicMethod::ConsumeOk(ConsumerTag::read(b)?))
    )),
    entry!(CLASS_BASIC, BASIC_CANCEL, "basic.cancel", |b| Ok(Method::Basic(
        BasicMethod::Cancel(BasicCancel::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_CANCEL_OK, "basic.cancel-ok", |b| Ok(
        Method::Basic(BasicMethod::CancelOk(ConsumerTag::read(b)?))
    )),
    entry!(CLASS_BASIC, BASIC_PUBLISH, "basic.publish", |b| Ok(Method::Basic(
        BasicMethod::Publish(BasicPublish::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_RETURN, "basic.return", |b| Ok(Method::Basic(
        BasicMethod::Return(BasicReturn::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_DELIVER, "basic.deliver", |b| Ok(Method::Basic(
        BasicMethod::Deliver(BasicDeliver::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_ACK, "basic.ack", |b| Ok(Method::Basic(
        BasicMethod::Ack(BasicAck::read(b)?)
    ))),
    entry!(CLASS_BASIC, BASIC_NACK, "basic.nack", |b| Ok(Method::Basic(
        BasicMethod::Nack(BasicNack::read(b)?)
    ))),
    entry!(CLASS_TX, TX_SELECT, "tx.select", |_| Ok(Method::Tx(TxMethod::Select))),
    entry!(CLASS_TX, TX_SELECT_OK, "tx.select-ok", |_| Ok(Method::Tx(
        TxMethod::SelectOk
    ))),
    entry!(CLASS_TX, TX_COMMIT, "tx.commit", |_| Ok(Method::Tx(TxMethod::Commit))),
    entry!(CLASS_TX, TX_COMMIT_OK, "tx.commit-ok", |_| Ok(Method::Tx(
        TxMethod::CommitOk
    ))),
    entry!(CLASS_TX, TX_ROLLBACK, "tx.rollback", |_| Ok(Method::Tx(
        TxMethod::Rollback
    ))),
    entry!(CLASS_TX, TX_ROLLBACK_OK, "tx.rollback-ok", |_| Ok(Method::Tx(
        TxMethod::RollbackOk
    ))),
];

/// Find the registry row for a `(class_id, method_id)` pair.
pub fn lookup(class_id: u16, method_id: u16) -> Option<&'static MethodEntry> {
    METHOD_TABLE
        .iter()
        .find(|e| e.class_id == class_id && e.method_id == method_id)
}

impl Method {
    /// `(class_id, method_id)` of this method.
    pub fn id(&self) -> (u16, u16) {
        match self {
            Method::Connection(m) => (
                CLASS_CONNECTION,
                match m {
                    ConnectionMethod::Start(_) => CONNECTION_START,
                    ConnectionMethod::StartOk(_) => CONNECTION_START_OK,
                    ConnectionMethod::Open(_) => CONNECTION_OPEN,
                    ConnectionMethod::OpenOk => CONNECTION_OPEN_OK,
                    ConnectionMethod::Close(_) => CONNECTION_CLOSE,
                    ConnectionMethod::CloseOk => CONNECTION_CLOSE_OK,
                },
            ),
            Method::Channel(m) => (
                CLASS_CHANNEL,
                match m {
                    ChannelMethod::Open => CHANNEL_OPEN,
                    ChannelMethod::OpenOk => CHANNEL_OPEN_OK,
                    ChannelMethod::Flow(_) => CHANNEL_FLOW,
                    ChannelMethod::FlowOk(_) => CHANNEL_FLOW_OK,
                    ChannelMethod::Close(_) => CHANNEL_CLOSE,
                    ChannelMethod::CloseOk => CHANNEL_CLOSE_OK,
                },
            ),
            Method::Exchange(m) => (
                CLASS_EXCHANGE,
                match m {
                    ExchangeMethod::Declare(_) => EXCHANGE_DECLARE,
                    ExchangeMethod::DeclareOk => EXCHANGE_DECLARE_OK,
                    ExchangeMethod::Delete(_) => EXCHANGE_DELETE,
                    ExchangeMethod::DeleteOk => EXCHANGE_DELETE_OK,
                    ExchangeMethod::Bind(_) => EXCHANGE_BIND,
                    ExchangeMethod::BindOk => EXCHANGE_BIND_OK,
                    ExchangeMethod::Unbind(_) => EXCHANGE_UNBIND,
                    ExchangeMethod::UnbindOk => EXCHANGE_UNBIND_OK,
                },
            ),
            Method::Queue(m) => (
                CLASS_QUEUE,
                match m {
                    QueueMethod::Declare(_) => QUEUE_DECLARE,
                    QueueMethod::DeclareOk(_) => QUEUE_DECLARE_OK,
                    QueueMethod::Bind(_) => QUEUE_BIND,
                    QueueMethod::BindOk => QUEUE_BIND_OK,
                    QueueMethod::Unbind(_) => QUEUE_UNBIND,
                    QueueMethod::UnbindOk => QUEUE_UNBIND_OK,
                    QueueMethod::Delete(_) => QUEUE_DELETE,
                    QueueMethod::DeleteOk(_) => QUEUE_DELETE_OK,
                },
            ),
            Method::Basic(m) => (
                CLASS_BASIC,
                match m {
                    BasicMethod::Consume(_) => BASIC_CONSUME,
                    BasicMethod::ConsumeOk(_) => BASIC_CONSUME_OK,
                    BasicMethod::Cancel(_) => BASIC_CANCEL,
                    BasicMethod::CancelOk(_) => BASIC_CANCEL_OK,
                    BasicMethod::Publish(_) => BASIC_PUBLISH,
                    BasicMethod::Return(_) => BASIC_RETURN,
                    BasicMethod::Deliver(_) => BASIC_DELIVER,
                    BasicMethod::Ack(_) => BASIC_ACK,
                    BasicMethod::Nack(_) => BASIC_NACK,
                },
            ),
            Method::Tx(m) => (
                CLASS_TX,
                match m {
                    TxMethod::Select => TX_SELECT,
                    TxMethod::SelectOk => TX_SELECT_OK,
                    TxMethod::Commit => TX_COMMIT,
                    TxMethod::CommitOk => TX_COMMIT_OK,
                    TxMethod::Rollback => TX_ROLLBACK,
                    TxMethod::RollbackOk => TX_ROLLBACK_OK,
                },
            ),
        }
    }

    pub fn class_id(&self) -> u16 {
        self.id().0
    }

    pub fn method_id(&self) -> u16 {
        self.id().1
    }

    pub fn name(&self) -> &'static str {
        let (class_id, method_id) = self.id();
        lookup(class_id, method_id).map_or("unknown", |e| e.name)
    }

    /// Whether the sender blocks for a synchronous reply.
    pub fn wait(&self) -> bool {
        match self {
            Method::Connection(m) => matches!(
                m,
                ConnectionMethod::Start(_)
                    | ConnectionMethod::Open(_)
                    | ConnectionMethod::Close(_)
            ),
            Method::Channel(m) => matches!(
                m,
                ChannelMethod::Open | ChannelMethod::Flow(_) | ChannelMethod::Close(_)
            ),
            Method::Exchange(m) => match m {
                ExchangeMethod::Declare(a) => !a.no_wait,
                ExchangeMethod::Delete(a) => !a.no_wait,
                ExchangeMethod::Bind(a) | ExchangeMethod::Unbind(a) => !a.no_wait,
                _ => false,
            },
            Method::Queue(m) => match m {
                QueueMethod::Declare(a) => !a.no_wait,
                QueueMethod::Bind(a) => !a.no_wait,
                QueueMethod::Unbind(_) => true,
                QueueMethod::Delete(a) => !a.no_wait,
                _ => false,
            },
            Method::Basic(m) => match m {
                BasicMethod::Consume(a) => !a.no_wait,
                BasicMethod::Cancel(a) => !a.no_wait,
                _ => false,
            },
            Method::Tx(m) => matches!(m, TxMethod::Select | TxMethod::Commit | TxMethod::Rollback),
        }
    }

    /// Content methods are followed by one header frame and zero or more body
    /// frames.
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            Method::Basic(BasicMethod::Publish(_))
                | Method::Basic(BasicMethod::Return(_))
                | Method::Basic(BasicMethod::Deliver(_))
        )
    }

    /// Whether `reply` is the `*-Ok` answer to this request.
    pub fn is_reply(&self, reply: &Method) -> bool {
        let (class_id, method_id) = self.id();
        let (reply_class, reply_method) = reply.id();
        self.wait() && reply_class == class_id && reply_method == method_id + 1
    }

    pub fn encode(&self) -> Result<Bytes> {
        let (class_id, method_id) = self.id();
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16(class_id);
        buf.put_u16(method_id);
        match self {
            Method::Connection(m) => match m {
                ConnectionMethod::Start(a) => a.write(&mut buf)?,
                ConnectionMethod::StartOk(a) => a.write(&mut buf)?,
                ConnectionMethod::Open(a) => a.write(&mut buf)?,
                ConnectionMethod::Close(a) => a.write(&mut buf)?,
                ConnectionMethod::OpenOk | ConnectionMethod::CloseOk => {}
            },
            Method::Channel(m) => match m {
                ChannelMethod::Flow(a) | ChannelMethod::FlowOk(a) => a.write(&mut buf)?,
                ChannelMethod::Close(a) => a.write(&mut buf)?,
                ChannelMethod::Open | ChannelMethod::OpenOk | ChannelMethod::CloseOk => {}
            },
            Method::Exchange(m) => match m {
                ExchangeMethod::Declare(a) => a.write(&mut buf)?,
                ExchangeMethod::Delete(a) => a.write(&mut buf)?,
                ExchangeMethod::Bind(a) | ExchangeMethod::Unbind(a) => a.write(&mut buf)?,
                ExchangeMethod::DeclareOk
                | ExchangeMethod::DeleteOk
                | ExchangeMethod::BindOk
                | ExchangeMethod::UnbindOk => {}
            },
            Method::Queue(m) => match m {
                QueueMethod::Declare(a) => a.write(&mut buf)?,
                QueueMethod::DeclareOk(a) => a.write(&mut buf)?,
                QueueMethod::Bind(a) => a.write(&mut buf)?,
                QueueMethod::Unbind(a) => a.write(&mut buf)?,
                QueueMethod::Delete(a) => a.write(&mut buf)?,
                QueueMethod::DeleteOk(a) => a.write(&mut buf)?,
                QueueMethod::BindOk | QueueMethod::UnbindOk => {}
            },
            Method::Basic(m) => match m {
                BasicMethod::Consume(a) => a.write(&mut buf)?,
                BasicMethod::ConsumeOk(a) | BasicMethod::CancelOk(a) => a.write(&mut buf)?,
                BasicMethod::Cancel(a) => a.write(&mut buf)?,
                BasicMethod::Publish(a) => a.write(&mut buf)?,
                BasicMethod::Return(a) => a.write(&mut buf)?,
                BasicMethod::Deliver(a) => a.write(&mut buf)?,
                BasicMethod::Ack(a) => a.write(&mut buf)?,
                BasicMethod::Nack(a) => a.write(&mut buf)?,
            },
            Method::Tx(_) => {}
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let class_id = codec::get_short(&mut payload)?;
        let method_id = codec::get_short(&mut payload)?;
        let entry =
            lookup(class_id, method_id).ok_or(CodecError::BadClassMethod(class_id, method_id))?;
        (entry.decode)(&mut payload)
    }
}
