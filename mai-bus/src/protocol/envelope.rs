// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Envelope and message-type taxonomy.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{ProtocolError, StandardMessage};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Prefix reserved for application-defined message types.
pub const CUSTOM_PREFIX: &str = "custom_";

/// Prefix reserved for protocol message types.
pub const SYSTEM_PREFIX: &str = "sys_";

const TYPE_STANDARD: &str = "sys_std";
const TYPE_ACK: &str = "sys_ack";
const TYPE_PING: &str = "sys_ping";
const TYPE_PONG: &str = "sys_pong";

/// Longest raw frame echoed back in an unrecognized envelope.
const MAX_RAW_ECHO: usize = 4096;

/// Message type carried in the envelope `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `sys_std`: payload is a [`StandardMessage`].
    Standard,
    /// `sys_ack`: payload is `{"acked_msg_id": ...}`.
    Ack,
    /// `sys_ping`: liveness check.
    Ping,
    /// `sys_pong`: liveness reply.
    Pong,
    /// `custom_<name>`, stored without the prefix.
    Custom(String),
    /// Any other type string. The empty string marks a frame that could not
    /// be parsed at all.
    Unrecognized(String),
}

impl MessageType {
    /// Parses a wire type string. Never fails.
    pub fn parse(raw: &str) -> Self {
        match raw {
            TYPE_STANDARD => MessageType::Standard,
            TYPE_ACK => MessageType::Ack,
            TYPE_PING => MessageType::Ping,
            TYPE_PONG => MessageType::Pong,
            other => match other.strip_prefix(CUSTOM_PREFIX) {
                Some(name) if custom_name(name).is_ok() => MessageType::Custom(name.to_string()),
                _ => MessageType::Unrecognized(other.to_string()),
            },
        }
    }

    /// Builds a custom type from a user supplied name.
    pub fn custom(name: &str) -> Result<Self, ProtocolError> {
        custom_name(name).map(MessageType::Custom)
    }

    /// Returns the string written on the wire.
    pub fn wire_name(&self) -> String {
        match self {
            MessageType::Standard => TYPE_STANDARD.to_string(),
            MessageType::Ack => TYPE_ACK.to_string(),
            MessageType::Ping => TYPE_PING.to_string(),
            MessageType::Pong => TYPE_PONG.to_string(),
            MessageType::Custom(name) => format!("{}{}", CUSTOM_PREFIX, name),
            MessageType::Unrecognized(raw) => raw.clone(),
        }
    }

    /// Whether the type belongs to the protocol itself (ack, ping, pong).
    pub fn is_control(&self) -> bool {
        matches!(self, MessageType::Ack | MessageType::Ping | MessageType::Pong)
    }

    /// Only business traffic may be held for later delivery.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, MessageType::Standard | MessageType::Custom(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Unrecognized(raw) if raw.is_empty() => f.write_str("<malformed>"),
            other => f.write_str(&other.wire_name()),
        }
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.wire_name())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::parse(&raw))
    }
}

/// Validates and normalizes a custom message type name.
///
/// A leading `custom_` is stripped; the remaining name must be non-empty and
/// must not start with the reserved `sys_` prefix.
pub fn custom_name(name: &str) -> Result<String, ProtocolError> {
    let trimmed = name.trim();
    let bare = trimmed.strip_prefix(CUSTOM_PREFIX).unwrap_or(trimmed);
    if bare.is_empty() {
        return Err(ProtocolError::InvalidCustomType(
            "custom type name must not be empty".to_string(),
        ));
    }
    if bare.starts_with(SYSTEM_PREFIX) {
        return Err(ProtocolError::InvalidCustomType(format!(
            "'{}' uses the reserved {} prefix",
            bare, SYSTEM_PREFIX
        )));
    }
    Ok(bare.to_string())
}

/// A single framed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version.
    pub ver: u32,
    /// Unique message id (UUID v4 unless fixed by the caller).
    pub msg_id: String,
    /// Message type.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Timestamps and addressing metadata.
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Type-specific payload.
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Current unix time in fractional seconds.
pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Envelope {
    /// Creates an envelope with a fresh msg_id and a `timestamp` meta entry.
    pub fn new(msg_type: MessageType, payload: Value) -> Self {
        let mut meta = Map::new();
        meta.insert("timestamp".to_string(), json!(unix_time()));
        Envelope {
            ver: PROTOCOL_VERSION,
            msg_id: Uuid::new_v4().to_string(),
            msg_type,
            meta,
            payload,
        }
    }

    /// Replaces the generated msg_id.
    pub fn with_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    /// Wraps a standard message.
    pub fn standard(message: &StandardMessage) -> Result<Self, ProtocolError> {
        Ok(Envelope::new(
            MessageType::Standard,
            serde_json::to_value(message)?,
        ))
    }

    /// Wraps an application payload under `custom_<name>`.
    pub fn custom(name: &str, payload: Value) -> Result<Self, ProtocolError> {
        Ok(Envelope::new(MessageType::custom(name)?, payload))
    }

    /// Acknowledgement for `msg_id`.
    pub fn ack_for(msg_id: &str) -> Self {
        Envelope::new(MessageType::Ack, json!({ "acked_msg_id": msg_id }))
    }

    pub fn ping() -> Self {
        Envelope::new(MessageType::Ping, empty_object())
    }

    pub fn pong() -> Self {
        Envelope::new(MessageType::Pong, empty_object())
    }

    /// Envelope standing in for a frame that failed to parse or carried an
    /// unknown type.
    pub(crate) fn unrecognized(raw: &str, error: &str) -> Self {
        let mut end = raw.len().min(MAX_RAW_ECHO);
        while !raw.is_char_boundary(end) {
            end -= 1;
        }
        Envelope {
            ver: PROTOCOL_VERSION,
            msg_id: String::new(),
            msg_type: MessageType::Unrecognized(String::new()),
            meta: Map::new(),
            payload: json!({ "raw": &raw[..end], "error": error }),
        }
    }

    /// The acknowledged msg_id of a `sys_ack`.
    pub fn acked_msg_id(&self) -> Option<&str> {
        match self.msg_type {
            MessageType::Ack => self.payload.get("acked_msg_id")?.as_str(),
            _ => None,
        }
    }

    /// Decodes the payload of a `sys_std` envelope.
    pub fn standard_message(&self) -> Result<StandardMessage, ProtocolError> {
        if self.msg_type != MessageType::Standard {
            return Err(ProtocolError::WrongType {
                expected: TYPE_STANDARD,
                actual: self.msg_type.wire_name(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Whether the receiver answers this envelope with a `sys_ack`.
    pub fn requires_ack(&self) -> bool {
        !self.msg_id.is_empty() && !matches!(self.msg_type, MessageType::Ack | MessageType::Ping)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<Value>) {
        self.meta.insert(key.to_string(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    /// Sender timestamp in unix seconds, if present.
    pub fn timestamp(&self) -> Option<f64> {
        self.meta.get("timestamp").and_then(Value::as_f64)
    }
}
