// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Broker-agnostic representations of an inbound delivery (`Message`) and of an
//! outbound publication (`PublishMessage`). Header values are kept in a typed
//! map; the transport converts them to and from AMQP field tables without
//! dropping nested arrays, tables, timestamps or binary values, so a message
//! republished from a delivery carries the same headers and properties.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// A typed header value.
///
/// Integers are widened to 64 bits. `Binary` holds a long string that is not
/// valid UTF-8, `Bytes` a RabbitMQ byte array.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    String(String),
    Binary(Vec<u8>),
    Bytes(Vec<u8>),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Float(f64),
    Decimal { scale: u8, value: u32 },
    Timestamp(u64),
    Array(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    /// Reads the value as an unsigned counter, accepting any integer-like form.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HeaderValue::UInt(v) => Some(*v),
            HeaderValue::Int(v) => u64::try_from(*v).ok(),
            HeaderValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::UInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// `delivery_mode` of a message that is not written to disk.
pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
/// `delivery_mode` of a message that survives a broker restart in a durable queue.
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// AMQP basic properties other than `type` and `headers`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl MessageProperties {
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }
}

/// A delivery received from a queue.
///
/// Immutable once received: the builder methods are meant for transports and
/// tests constructing the delivery, handlers only read it.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    delivery_tag: u64,
    redelivered: bool,
    exchange: String,
    routing_key: String,
    msg_type: Option<String>,
    headers: Headers,
    properties: MessageProperties,
    death_count: Option<u64>,
    payload: Vec<u8>,
}

impl Message {
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            msg_type: None,
            headers: Headers::default(),
            properties: MessageProperties::default(),
            death_count: None,
            payload: payload.into(),
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Count of the broker's own `x-death` bookkeeping for this message.
    pub fn death_count(mut self, count: u64) -> Self {
        self.death_count = Some(count);
        self
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub fn kind(&self) -> Option<&str> {
        self.msg_type.as_deref()
    }

    pub fn header_map(&self) -> &Headers {
        &self.headers
    }

    pub fn get_header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn message_properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn deaths(&self) -> Option<u64> {
        self.death_count
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Deserializes a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: String,
    pub msg_type: Option<String>,
    pub headers: Headers,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

impl PublishMessage {
    pub fn new(exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            msg_type: None,
            headers: Headers::default(),
            properties: MessageProperties::default(),
            payload: payload.into(),
        }
    }

    /// Copy of a received message for `exchange` and `routing_key`, keeping
    /// its type, headers, properties and payload.
    pub fn republish(msg: &Message, exchange: &str, routing_key: &str) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            msg_type: msg.msg_type.clone(),
            headers: msg.headers.clone(),
            properties: msg.properties.clone(),
            payload: msg.payload.clone(),
        }
    }

    /// Serializes `data` as the JSON payload.
    pub fn json<T: Serialize>(
        exchange: &str,
        routing_key: &str,
        data: &T,
    ) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(data).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(PublishMessage::new(exchange, routing_key, payload))
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Marks the message persistent, so a durable queue keeps it across
    /// broker restarts.
    pub fn persistent(mut self) -> Self {
        self.properties.delivery_mode = Some(DELIVERY_MODE_PERSISTENT);
        self
    }

    pub fn properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}
