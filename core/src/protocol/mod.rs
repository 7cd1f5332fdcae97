//! # Wire protocol
//!
//! Binary framing and the method catalog spoken between broker and clients.
//!
//! A frame is `[type:1][channel:2][length:4][payload][0xCE]`. Method payloads
//! begin with `(class_id, method_id)`; content methods are followed by one
//! header frame and zero or more body frames.
//!
//! ## Modules
//!
//! - [`codec`] - primitive encodings, field tables and the tokio frame codec
//! - [`frame`] - frame envelope and content header properties
//! - [`methods`] - method catalog and `(class, method)` decode table
//! - [`channel_id`] - per-connection channel ID allocator
//! - [`errors`] - soft/hard protocol errors carried by close methods

pub mod channel_id;
pub mod codec;
pub mod constants;
pub mod errors;
pub mod frame;
pub mod methods;
#[cfg(test)]
mod tests;

pub use channel_id::{ChannelIdAllocator, MaxChannels};
pub use codec::{CodecError, FieldTable, FieldValue, FrameCodec};
pub use errors::{ErrorKind, ProtocolError};
pub use frame::{BasicProperties, ContentHeader, Frame, FrameType};
pub use methods::{
    BasicAck, BasicCancel, BasicConsume, BasicDeliver, BasicMethod, BasicNack, BasicPublish,
    BasicReturn, ChannelMethod, Close, ConnectionMethod, ConnectionOpen, ConnectionStart,
    ConnectionStartOk, ConsumerTag, ExchangeBind, ExchangeDeclare, ExchangeDelete,
    ExchangeMethod, Flow, Method, QueueBind, QueueDeclare, QueueDeclareOk, QueueDelete,
    QueueDeleteOk, QueueMethod, QueueUnbind, TxMethod,
};
