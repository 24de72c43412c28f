// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message codec.
//!
//! A message is a type tag, an ordered set of typed properties and an
//! optional payload. All integers are little-endian:
//!
//! ```text
//! u32  total length of everything after this field
//! i32  message type tag
//! i32  property count
//!      repeated: i32 name length, name bytes, u8 kind tag, value bytes
//! i32  payload length (-1 = no payload), payload bytes
//! ```
//!
//! Reading an absent property returns the caller's default. Reading a
//! present property as the wrong kind is a [`CodecError::TypeMismatch`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::message_type::MessageType;
use crate::props;

/// Maximum encoded message size (64 MB), length prefix included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Size of the total-length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors that can occur during message encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(i32),

    #[error("invalid kind tag {tag} for property '{name}'")]
    InvalidPropertyKind { name: String, tag: u8 },

    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid length: {0}")]
    InvalidLength(i64),

    #[error("message too large: {0} bytes (max: {MAX_MESSAGE_SIZE})")]
    MessageTooLarge(usize),

    #[error("length prefix {declared} does not match body length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(String),

    #[error("invalid bool byte {value} for property '{name}'")]
    InvalidBool { name: String, value: u8 },

    #[error("invalid timestamp for property '{0}'")]
    InvalidTimestamp(String),

    #[error("invalid duration for property '{0}'")]
    InvalidDuration(String),

    #[error("property '{name}' is {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: PropertyKind,
        actual: PropertyKind,
    },
}

impl CodecError {
    /// Whether the error is a wrong-type property read rather than a
    /// malformed frame.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, CodecError::TypeMismatch { .. })
    }
}

/// Kind tag of a property value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyKind {
    String = 1,
    Int32 = 2,
    Int64 = 3,
    Bool = 4,
    Double = 5,
    Timestamp = 6,
    Duration = 7,
}

impl PropertyKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PropertyKind::String),
            2 => Some(PropertyKind::Int32),
            3 => Some(PropertyKind::Int64),
            4 => Some(PropertyKind::Bool),
            5 => Some(PropertyKind::Double),
            6 => Some(PropertyKind::Timestamp),
            7 => Some(PropertyKind::Duration),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyKind::String => "string",
            PropertyKind::Int32 => "int32",
            PropertyKind::Int64 => "int64",
            PropertyKind::Bool => "bool",
            PropertyKind::Double => "double",
            PropertyKind::Timestamp => "timestamp",
            PropertyKind::Duration => "duration",
        };
        f.write_str(name)
    }
}

/// A typed property value
#[derive(Debug, Clone)]
pub enum PropertyValue {
    String(String),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Double(f64),
    Timestamp(DateTime<Utc>),
    Duration(Duration),
}

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Int32(_) => PropertyKind::Int32,
            PropertyValue::Int64(_) => PropertyKind::Int64,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::Double(_) => PropertyKind::Double,
            PropertyValue::Timestamp(_) => PropertyKind::Timestamp,
            PropertyValue::Duration(_) => PropertyKind::Duration,
        }
    }
}

// Doubles compare by bit pattern so that NaN payloads round-trip exactly.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
            (PropertyValue::Int32(a), PropertyValue::Int32(b)) => a == b,
            (PropertyValue::Int64(a), PropertyValue::Int64(b)) => a == b,
            (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
            (PropertyValue::Double(a), PropertyValue::Double(b)) => a.to_bits() == b.to_bits(),
            (PropertyValue::Timestamp(a), PropertyValue::Timestamp(b)) => a == b,
            (PropertyValue::Duration(a), PropertyValue::Duration(b)) => a == b,
            _ => false,
        }
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int32(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int64(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Double(value)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(value: DateTime<Utc>) -> Self {
        PropertyValue::Timestamp(value)
    }
}

impl From<Duration> for PropertyValue {
    fn from(value: Duration) -> Self {
        PropertyValue::Duration(value)
    }
}

/// Error details carried by a failed reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyError {
    pub error_type: String,
    pub message: String,
}

macro_rules! typed_accessors {
    ($( $get:ident, $set:ident, $with:ident, $variant:ident, $ty:ty );* $(;)?) => {
        $(
            #[doc = concat!("Read a ", stringify!($variant), " property, `default` when absent.")]
            pub fn $get(&self, name: &str, default: $ty) -> Result<$ty, CodecError> {
                match self.properties.get(name) {
                    None => Ok(default),
                    Some(PropertyValue::$variant(value)) => Ok(*value),
                    Some(other) => Err(CodecError::TypeMismatch {
                        name: name.to_string(),
                        expected: PropertyKind::$variant,
                        actual: other.kind(),
                    }),
                }
            }

            pub fn $set(&mut self, name: impl Into<String>, value: $ty) {
                self.properties.insert(name.into(), PropertyValue::$variant(value));
            }

            pub fn $with(mut self, name: impl Into<String>, value: $ty) -> Self {
                self.$set(name, value);
                self
            }
        )*
    };
}

/// A protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    message_type: MessageType,
    properties: BTreeMap<String, PropertyValue>,
    payload: Option<Bytes>,
}

impl Message {
    /// Create an empty message of the given type
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            properties: BTreeMap::new(),
            payload: None,
        }
    }

    /// Create the reply for `request`, carrying its request id.
    ///
    /// Returns `None` when `request` is itself a reply.
    pub fn reply_to(request: &Message) -> Option<Message> {
        let reply_type = request.message_type.reply_type()?;
        let mut reply = Message::new(reply_type);
        if let Some(id) = request.properties.get(props::REQUEST_ID) {
            reply
                .properties
                .insert(props::REQUEST_ID.to_string(), id.clone());
        }
        Some(reply)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = message_type;
    }

    // ========== Properties ==========

    /// Iterate over properties in name order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &PropertyValue)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Read a string property, `default` when absent.
    pub fn get_string(&self, name: &str, default: &str) -> Result<String, CodecError> {
        match self.properties.get(name) {
            None => Ok(default.to_string()),
            Some(PropertyValue::String(value)) => Ok(value.clone()),
            Some(other) => Err(CodecError::TypeMismatch {
                name: name.to_string(),
                expected: PropertyKind::String,
                actual: other.kind(),
            }),
        }
    }

    /// Read a string property, `None` when absent.
    pub fn get_optional_string(&self, name: &str) -> Result<Option<String>, CodecError> {
        if self.contains(name) {
            self.get_string(name, "").map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn set_string(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties
            .insert(name.into(), PropertyValue::String(value.into()));
    }

    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_string(name, value);
        self
    }

    typed_accessors! {
        get_i32, set_i32, with_i32, Int32, i32;
        get_i64, set_i64, with_i64, Int64, i64;
        get_bool, set_bool, with_bool, Bool, bool;
        get_f64, set_f64, with_f64, Double, f64;
        get_timestamp, set_timestamp, with_timestamp, Timestamp, DateTime<Utc>;
        get_duration, set_duration, with_duration, Duration, Duration;
    }

    // ========== Common properties ==========

    /// Correlation id, 0 when unset.
    pub fn request_id(&self) -> Result<i64, CodecError> {
        self.get_i64(props::REQUEST_ID, 0)
    }

    pub fn set_request_id(&mut self, id: i64) {
        self.set_i64(props::REQUEST_ID, id);
    }

    /// Workflow execution context id, 0 when unset.
    pub fn context_id(&self) -> Result<i64, CodecError> {
        self.get_i64(props::CONTEXT_ID, 0)
    }

    /// Mark this (reply) message as failed.
    pub fn set_error(&mut self, error_type: impl Into<String>, message: impl Into<String>) {
        self.set_string(props::ERROR_TYPE, error_type);
        self.set_string(props::ERROR, message);
    }

    pub fn with_error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.set_error(error_type, message);
        self
    }

    /// Error details, `None` for a successful reply.
    pub fn reply_error(&self) -> Result<Option<ReplyError>, CodecError> {
        if !self.contains(props::ERROR_TYPE) && !self.contains(props::ERROR) {
            return Ok(None);
        }
        Ok(Some(ReplyError {
            error_type: self.get_string(props::ERROR_TYPE, "Error")?,
            message: self.get_string(props::ERROR, "")?,
        }))
    }

    // ========== Payload ==========

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = Some(payload.into());
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.set_payload(payload);
        self
    }

    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    // ========== Encoding ==========

    /// Encode the message to bytes for wire transmission, length prefix included.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(self.estimated_size());
        buf.put_u32_le(0);
        buf.put_i32_le(self.message_type.tag());
        buf.put_i32_le(checked_len(self.properties.len())?);

        for (name, value) in &self.properties {
            put_string(&mut buf, name)?;
            buf.put_u8(value.kind() as u8);
            match value {
                PropertyValue::String(s) => put_string(&mut buf, s)?,
                PropertyValue::Int32(v) => buf.put_i32_le(*v),
                PropertyValue::Int64(v) => buf.put_i64_le(*v),
                PropertyValue::Bool(v) => buf.put_u8(u8::from(*v)),
                PropertyValue::Double(v) => buf.put_u64_le(v.to_bits()),
                PropertyValue::Timestamp(ts) => {
                    buf.put_i64_le(ts.timestamp());
                    buf.put_u32_le(ts.timestamp_subsec_nanos());
                }
                PropertyValue::Duration(d) => {
                    buf.put_u64_le(d.as_secs());
                    buf.put_u32_le(d.subsec_nanos());
                }
            }
        }

        match &self.payload {
            None => buf.put_i32_le(-1),
            Some(payload) => {
                buf.put_i32_le(checked_len(payload.len())?);
                buf.put_slice(payload);
            }
        }

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(buf.len()));
        }
        let body_len = (buf.len() - LENGTH_PREFIX_SIZE) as u32;
        buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&body_len.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Decode a complete frame, length prefix included.
    pub fn decode(mut bytes: Bytes) -> Result<Message, CodecError> {
        need(&bytes, LENGTH_PREFIX_SIZE)?;
        let declared = bytes.get_u32_le() as usize;
        if declared + LENGTH_PREFIX_SIZE > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(declared + LENGTH_PREFIX_SIZE));
        }
        if bytes.len() != declared {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }
        Self::decode_body(bytes)
    }

    /// Decode a message body, i.e. everything after the length prefix.
    pub fn decode_body(mut buf: Bytes) -> Result<Message, CodecError> {
        need(&buf, 8)?;
        let message_type = MessageType::try_from(buf.get_i32_le())?;
        let count = buf.get_i32_le();
        if count < 0 {
            return Err(CodecError::InvalidLength(count as i64));
        }

        let mut properties = BTreeMap::new();
        for _ in 0..count {
            let name = get_string(&mut buf, "property name")?;
            need(&buf, 1)?;
            let tag = buf.get_u8();
            let kind = PropertyKind::from_tag(tag).ok_or_else(|| {
                CodecError::InvalidPropertyKind {
                    name: name.clone(),
                    tag,
                }
            })?;
            let value = get_value(&mut buf, &name, kind)?;
            properties.insert(name, value);
        }

        need(&buf, 4)?;
        let payload_len = buf.get_i32_le();
        let payload = match payload_len {
            -1 => None,
            len if len < -1 => return Err(CodecError::InvalidLength(len as i64)),
            len => {
                let len = len as usize;
                need(&buf, len)?;
                Some(buf.split_to(len))
            }
        };

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }

        Ok(Message {
            message_type,
            properties,
            payload,
        })
    }

    fn estimated_size(&self) -> usize {
        let props: usize = self
            .properties
            .iter()
            .map(|(k, v)| {
                4 + k.len()
                    + 1
                    + match v {
                        PropertyValue::String(s) => 4 + s.len(),
                        _ => 12,
                    }
            })
            .sum();
        LENGTH_PREFIX_SIZE + 12 + props + self.payload.as_ref().map_or(0, |p| p.len())
    }
}

fn checked_len(len: usize) -> Result<i32, CodecError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge(len));
    }
    Ok(len as i32)
}

fn need(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    buf.put_i32_le(checked_len(value.len())?);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String, CodecError> {
    need(buf, 4)?;
    let len = buf.get_i32_le();
    if len < 0 {
        return Err(CodecError::InvalidLength(len as i64));
    }
    let len = len as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8(what.to_string()))
}

fn get_value(buf: &mut Bytes, name: &str, kind: PropertyKind) -> Result<PropertyValue, CodecError> {
    let value = match kind {
        PropertyKind::String => PropertyValue::String(get_string(buf, name)?),
        PropertyKind::Int32 => {
            need(buf, 4)?;
            PropertyValue::Int32(buf.get_i32_le())
        }
        PropertyKind::Int64 => {
            need(buf, 8)?;
            PropertyValue::Int64(buf.get_i64_le())
        }
        PropertyKind::Bool => {
            need(buf, 1)?;
            match buf.get_u8() {
                0 => PropertyValue::Bool(false),
                1 => PropertyValue::Bool(true),
                value => {
                    return Err(CodecError::InvalidBool {
                        name: name.to_string(),
                        value,
                    });
                }
            }
        }
        PropertyKind::Double => {
            need(buf, 8)?;
            PropertyValue::Double(f64::from_bits(buf.get_u64_le()))
        }
        PropertyKind::Timestamp => {
            need(buf, 12)?;
            let secs = buf.get_i64_le();
            let nanos = buf.get_u32_le();
            let ts = DateTime::from_timestamp(secs, nanos)
                .ok_or_else(|| CodecError::InvalidTimestamp(name.to_string()))?;
            PropertyValue::Timestamp(ts)
        }
        PropertyKind::Duration => {
            need(buf, 12)?;
            let secs = buf.get_u64_le();
            let nanos = buf.get_u32_le();
            if nanos >= 1_000_000_000 {
                return Err(CodecError::InvalidDuration(name.to_string()));
            }
            PropertyValue::Duration(Duration::new(secs, nanos))
        }
    };
    Ok(value)
}
