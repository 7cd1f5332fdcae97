//! Frames and content headers.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::codec::{self, CodecError, FieldTable, Result};
use super::constants::*;
use super::methods::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Method = FRAME_METHOD,
    Header = FRAME_HEADER,
    Body = FRAME_BODY,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            FRAME_METHOD => Ok(FrameType::Method),
            FRAME_HEADER => Ok(FrameType::Header),
            FRAME_BODY => Ok(FrameType::Body),
            other => Err(CodecError::BadFrameType(other)),
        }
    }
}

/// One wire frame. Constructed per send/receive, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn method(channel: u16, method: &Method) -> Result<Self> {
        Ok(Self {
            frame_type: FrameType::Method,
            channel,
            payload: method.encode()?,
        })
    }

    pub fn header(channel: u16, header: &ContentHeader) -> Result<Self> {
        Ok(Self {
            frame_type: FrameType::Header,
            channel,
            payload: header.encode()?,
        })
    }

    pub fn body(channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type: FrameType::Body,
            channel,
            payload,
        }
    }

    /// Build the method/header/body sequence for a content method. The body is
    /// split so no frame exceeds `frame_max`.
    pub fn content(
        channel: u16,
        method: &Method,
        header: &ContentHeader,
        body: &Bytes,
        frame_max: usize,
    ) -> Result<Vec<Self>> {
        let chunk = frame_max.saturating_sub(FRAME_OVERHEAD).max(1);
        let mut frames = Vec::with_capacity(2 + body.len() / chunk + 1);
        frames.push(Self::method(channel, method)?);
        frames.push(Self::header(channel, header)?);
        let mut offset = 0;
        while offset < body.len() {
            let end = (offset + chunk).min(body.len());
            frames.push(Self::body(channel, body.slice(offset..end)));
            offset = end;
        }
        Ok(frames)
    }

    pub fn decode_method(&self) -> Result<Method> {
        Method::decode(self.payload.clone())
    }

    pub fn decode_header(&self) -> Result<ContentHeader> {
        ContentHeader::decode(self.payload.clone())
    }
}

/// Message properties carried in the content header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;

impl BasicProperties {
    pub fn with_content_type<S: Into<String>>(mut self, value: S) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: u8) -> Self {
        self.delivery_mode = Some(mode);
        self
    }

    pub fn with_header<K: Into<String>, V: Into<codec::FieldValue>>(
        mut self,
        key: K,
        value: V,
    ) -> Self {
        self.headers
            .get_or_insert_with(FieldTable::new)
            .insert(key.into(), value.into());
        self
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        let pairs = [
            (self.content_type.is_some(), FLAG_CONTENT_TYPE),
            (self.content_encoding.is_some(), FLAG_CONTENT_ENCODING),
            (self.headers.is_some(), FLAG_HEADERS),
            (self.delivery_mode.is_some(), FLAG_DELIVERY_MODE),
            (self.priority.is_some(), FLAG_PRIORITY),
            (self.correlation_id.is_some(), FLAG_CORRELATION_ID),
            (self.reply_to.is_some(), FLAG_REPLY_TO),
            (self.expiration.is_some(), FLAG_EXPIRATION),
            (self.message_id.is_some(), FLAG_MESSAGE_ID),
            (self.timestamp.is_some(), FLAG_TIMESTAMP),
            (self.kind.is_some(), FLAG_TYPE),
            (self.user_id.is_some(), FLAG_USER_ID),
            (self.app_id.is_some(), FLAG_APP_ID),
        ];
        for (present, flag) in pairs {
            if present {
                flags |= flag;
            }
        }
        flags
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.content_encoding {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.headers {
            codec::put_table(buf, v)?;
        }
        if let Some(v) = self.delivery_mode {
            buf.put_u8(v);
        }
        if let Some(v) = self.priority {
            buf.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.reply_to {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.expiration {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.message_id {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = self.timestamp {
            buf.put_u64(v);
        }
        if let Some(v) = &self.kind {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.user_id {
            codec::put_short_string(buf, v)?;
        }
        if let Some(v) = &self.app_id {
            codec::put_short_string(buf, v)?;
        }
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        let flags = codec::get_short(buf)?;
        let has = |flag: u16| flags & flag != 0;
        let mut props = BasicProperties::default();
        if has(FLAG_CONTENT_TYPE) {
            props.content_type = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_CONTENT_ENCODING) {
            props.content_encoding = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_HEADERS) {
            props.headers = Some(codec::get_table(buf)?);
        }
        if has(FLAG_DELIVERY_MODE) {
            props.delivery_mode = Some(codec::get_octet(buf)?);
        }
        if has(FLAG_PRIORITY) {
            props.priority = Some(codec::get_octet(buf)?);
        }
        if has(FLAG_CORRELATION_ID) {
            props.correlation_id = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_REPLY_TO) {
            props.reply_to = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_EXPIRATION) {
            props.expiration = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_MESSAGE_ID) {
            props.message_id = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_TIMESTAMP) {
            props.timestamp = Some(codec::get_longlong(buf)?);
        }
        if has(FLAG_TYPE) {
            props.kind = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_USER_ID) {
            props.user_id = Some(codec::get_short_string(buf)?);
        }
        if has(FLAG_APP_ID) {
            props.app_id = Some(codec::get_short_string(buf)?);
        }
        Ok(props)
    }
}

/// Payload of a Header frame: announces the body size of a content method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn new(body_size: u64, properties: BasicProperties) -> Self {
        Self {
            class_id: CLASS_BASIC,
            body_size,
            properties,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u16(self.class_id);
        buf.put_u16(0); // weight
        buf.put_u64(self.body_size);
        self.properties.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        let class_id = codec::get_short(&mut payload)?;
        let _weight = codec::get_short(&mut payload)?;
        let body_size = codec::get_longlong(&mut payload)?;
        let properties = BasicProperties::read(&mut payload)?;
        Ok(Self {
            class_id,
            body_size,
            properties,
        })
    }
}
