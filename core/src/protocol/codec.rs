//! Wire codec
//!
//! Primitive encodings (all integers big-endian):
//!
//! ```text
//! octet      => u8
//! short      => u16
//! long       => u32
//! longlong   => u64
//! shortstr   => len:u8  bytes
//! longstr    => len:u32 bytes
//! bits       => packed LSB-first into one octet
//! table      => len:u32 (name:shortstr tag:u8 value)*
//! ```
//!
//! Frames are `[type:1][channel:2][size:4][payload:size][0xCE]`. [`FrameCodec`]
//! plugs the frame layer into `tokio_util::codec::Framed`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::constants::*;
use super::errors::ProtocolError;
use super::frame::{Frame, FrameType};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame type: {0}")]
    BadFrameType(u8),
    #[error("bad frame end marker: 0x{0:02x}")]
    BadFrameEnd(u8),
    #[error("frame of {size} bytes exceeds frame_max {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("truncated payload: needed {needed}, available {available}")]
    Truncated { needed: usize, available: usize },
    #[error("bad class/method: {0}.{1}")]
    BadClassMethod(u16, u16),
    #[error("short string of {0} bytes exceeds 255")]
    StringTooLong(usize),
    #[error("bad field value type: {0:?}")]
    BadFieldType(char),
    #[error("invalid UTF-8 in string field")]
    Utf8,
}

pub type Result<T> = std::result::Result<T, CodecError>;

impl From<CodecError> for ProtocolError {
    /// Decode errors are always connection-fatal: the stream position can no
    /// longer be trusted.
    fn from(err: CodecError) -> Self {
        let code = match err {
            CodecError::BadFrameType(_)
            | CodecError::BadFrameEnd(_)
            | CodecError::FrameTooLarge { .. } => FRAME_ERROR,
            CodecError::BadClassMethod(..) => COMMAND_INVALID,
            _ => SYNTAX_ERROR,
        };
        ProtocolError::hard(code, err.to_string())
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_octet(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_short(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn get_long(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn get_longlong(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

fn get_utf8(buf: &mut Bytes, len: usize) -> Result<String> {
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Utf8)
}

pub fn get_short_string(buf: &mut Bytes) -> Result<String> {
    let len = get_octet(buf)? as usize;
    get_utf8(buf, len)
}

pub fn get_long_string(buf: &mut Bytes) -> Result<String> {
    let len = get_long(buf)? as usize;
    get_utf8(buf, len)
}

pub fn put_short_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = value.len();
    if len > u8::MAX as usize {
        return Err(CodecError::StringTooLong(len));
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub fn put_long_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

/// Pack flags LSB-first: `bits[0]` lands in bit 0.
pub fn pack_bits(bits: &[bool]) -> u8 {
    debug_assert!(bits.len() <= 8);
    bits.iter()
        .enumerate()
        .fold(0u8, |acc, (i, &set)| if set { acc | (1 << i) } else { acc })
}

pub fn unpack_bits(octet: u8) -> [bool; 8] {
    let mut bits = [false; 8];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = octet & (1 << i) != 0;
    }
    bits
}

/// Field table used for properties, arguments and message headers.
pub type FieldTable = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    LongString(String),
    Table(FieldTable),
    Void,
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::LongString(value.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::I64(value)
    }
}

pub fn get_table(buf: &mut Bytes) -> Result<FieldTable> {
    let len = get_long(buf)? as usize;
    ensure(buf, len)?;
    let mut data = buf.split_to(len);
    let mut table = FieldTable::new();
    while data.has_remaining() {
        let name = get_short_string(&mut data)?;
        let value = get_field_value(&mut data)?;
        table.insert(name, value);
    }
    Ok(table)
}

fn get_field_value(buf: &mut Bytes) -> Result<FieldValue> {
    let tag = get_octet(buf)? as char;
    let value = match tag {
        't' => FieldValue::Bool(get_octet(buf)? != 0),
        'b' => FieldValue::I8(get_octet(buf)? as i8),
        's' => FieldValue::I16(get_short(buf)? as i16),
        'I' => FieldValue::I32(get_long(buf)? as i32),
        'l' => FieldValue::I64(get_longlong(buf)? as i64),
        'S' => FieldValue::LongString(get_long_string(buf)?),
        'F' => FieldValue::Table(get_table(buf)?),
        'V' => FieldValue::Void,
        other => return Err(CodecError::BadFieldType(other)),
    };
    Ok(value)
}

pub fn put_table(buf: &mut BytesMut, table: &FieldTable) -> Result<()> {
    let mut body = BytesMut::new();
    for (name, value) in table {
        put_short_string(&mut body, name)?;
        put_field_value(&mut body, value)?;
    }
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

fn put_field_value(buf: &mut BytesMut, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Bool(v) => {
            buf.put_u8(b't');
            buf.put_u8(*v as u8);
        }
        FieldValue::I8(v) => {
            buf.put_u8(b'b');
            buf.put_i8(*v);
        }
        FieldValue::I16(v) => {
            buf.put_u8(b's');
            buf.put_i16(*v);
        }
        FieldValue::I32(v) => {
            buf.put_u8(b'I');
            buf.put_i32(*v);
        }
        FieldValue::I64(v) => {
            buf.put_u8(b'l');
            buf.put_i64(*v);
        }
        FieldValue::LongString(v) => {
            buf.put_u8(b'S');
            put_long_string(buf, v);
        }
        FieldValue::Table(v) => {
            buf.put_u8(b'F');
            put_table(buf, v)?;
        }
        FieldValue::Void => buf.put_u8(b'V'),
    }
    Ok(())
}

/// Frame layer codec for `Framed` transports.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    frame_max: usize,
}

impl FrameCodec {
    pub fn new(frame_max: u32) -> Self {
        Self {
            frame_max: frame_max.max(FRAME_MIN_SIZE) as usize,
        }
    }

    pub fn frame_max(&self) -> usize {
        self.frame_max
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_FRAME_MAX)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let frame_type = FrameType::try_from(src[0])?;
        let channel = u16::from_be_bytes([src[1], src[2]]);
        let size = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

        if size + FRAME_OVERHEAD > self.frame_max {
            return Err(CodecError::FrameTooLarge {
                size: size + FRAME_OVERHEAD,
                max: self.frame_max,
            });
        }

        let total = FRAME_HEADER_SIZE + size + 1;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let end = src[total - 1];
        if end != FRAME_END {
            return Err(CodecError::BadFrameEnd(end));
        }

        let mut data = src.split_to(total);
        data.advance(FRAME_HEADER_SIZE);
        data.truncate(size);
        trace!(?frame_type, channel, size, "decoded frame");

        Ok(Some(Frame {
            frame_type,
            channel,
            payload: data.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let size = frame.payload.len() + FRAME_OVERHEAD;
        if size > self.frame_max {
            return Err(CodecError::FrameTooLarge {
                size,
                max: self.frame_max,
            });
        }
        dst.reserve(size);
        dst.put_u8(frame.frame_type as u8);
        dst.put_u16(frame.channel);
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        dst.put_u8(FRAME_END);
        Ok(())
    }
}
