// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! `Transport` is the capability the topology manager, the consumer runtime
//! and the publisher are built on: declarations, flow control, consumption,
//! settlement and publishing. `AmqpTransport` implements it on a `lapin`
//! channel.
//!
//! A transport wraps a single channel. Its operations must not be invoked
//! concurrently from several tasks; the consumer runtime serializes every
//! call from its dispatch loop.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers, Message, MessageProperties, PublishMessage},
    policy::{AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{
        AMQPValue, ByteArray, DecimalValue, FieldArray, FieldTable, LongLongInt, LongString,
        ShortString,
    },
    BasicProperties, Channel,
};
#[cfg(test)]
use mockall::automock;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Stream of deliveries of one consumer.
pub type Deliveries = BoxStream<'static, Result<Message, AmqpError>>;

/// A started consumer: the tag the broker knows it by and its deliveries.
pub struct Subscription {
    pub consumer_tag: String,
    pub deliveries: Deliveries,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries sent to this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Starts consuming `queue` with manual acknowledgement. An empty
    /// `consumer_tag` lets the broker pick one.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, AmqpError>;

    /// Stops the broker from pushing more deliveries to the consumer.
    /// Deliveries already received stay unacknowledged until settled.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// `Transport` over a `lapin` channel.
pub struct AmqpTransport {
    channel: Arc<Channel>,
}

impl AmqpTransport {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport { channel })
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(declare_error(&err, &def.name, || {
                    AmqpError::DeclareExchangeError(def.name.clone())
                }))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(declare_error(&err, &def.name, || {
                    AmqpError::DeclareQueueError(def.name.clone())
                }))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Subscription, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = consumer.tag().to_string();
        debug!(queue, consumer_tag, "consumer created");

        Ok(Subscription {
            consumer_tag,
            deliveries: consumer
                .map(|result| match result {
                    Ok(delivery) => Ok(from_delivery(delivery)),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        Err(AmqpError::BrokerDisconnected(err.to_string()))
                    }
                })
                .boxed(),
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                Err(settle_error(
                    &err,
                    AmqpError::CancelConsumerError(consumer_tag.to_owned()),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(settle_error(&err, AmqpError::AckMessageError))
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                Err(settle_error(&err, AmqpError::NackMessageError))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &PublishMessage) -> Result<(), AmqpError> {
        let properties = basic_properties(msg);

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(settle_error(&err, AmqpError::PublishingError))
            }
            _ => Ok(()),
        }
    }
}

/// Declaration arguments of a queue, including its dead-letter wiring.
fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(dl) = &def.dead_letter {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dl.exchange.clone())),
        );
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dl.routing_key.clone())),
        );
    }

    let limits = [
        (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
        (AMQP_HEADERS_MAX_LENGTH, def.max_length),
        (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
    ];

    for (key, value) in limits {
        if let Some(value) = value {
            args.insert(
                ShortString::from(key),
                AMQPValue::LongLongInt(LongLongInt::from(value)),
            );
        }
    }

    FieldTable::from(args)
}

/// PRECONDITION_FAILED means the entity exists with other parameters.
fn declare_error(err: &lapin::Error, name: &str, fallback: impl FnOnce() -> AmqpError) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(amqp_err)
            if matches!(
                amqp_err.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            AmqpError::TopologyConflict(name.to_owned())
        }
        _ => fallback(),
    }
}

/// Settlement on a closed channel or connection can't be retried here.
fn settle_error(err: &lapin::Error, fallback: AmqpError) -> AmqpError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => AmqpError::BrokerDisconnected(err.to_string()),
        _ => fallback,
    }
}

/// Properties of an outgoing message. Content type and message id default to
/// JSON and a fresh uuid; everything else is only set when present.
fn basic_properties(msg: &PublishMessage) -> BasicProperties {
    let props = &msg.properties;

    let content_type = props
        .content_type
        .clone()
        .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned());
    let message_id = props
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut properties = BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_message_id(ShortString::from(message_id))
        .with_headers(field_table(&msg.headers));

    if let Some(msg_type) = &msg.msg_type {
        properties = properties.with_type(ShortString::from(msg_type.clone()));
    }
    if let Some(mode) = props.delivery_mode {
        properties = properties.with_delivery_mode(mode);
    }
    if let Some(priority) = props.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(timestamp) = props.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(v) = &props.content_encoding {
        properties = properties.with_content_encoding(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.expiration {
        properties = properties.with_expiration(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.user_id {
        properties = properties.with_user_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &props.app_id {
        properties = properties.with_app_id(ShortString::from(v.clone()));
    }

    properties
}

fn message_properties(properties: &BasicProperties) -> MessageProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(ShortString::to_string);

    MessageProperties {
        content_type: text(properties.content_type()),
        content_encoding: text(properties.content_encoding()),
        delivery_mode: *properties.delivery_mode(),
        priority: *properties.priority(),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        expiration: text(properties.expiration()),
        message_id: text(properties.message_id()),
        timestamp: *properties.timestamp(),
        user_id: text(properties.user_id()),
        app_id: text(properties.app_id()),
    }
}

fn from_delivery(mut delivery: Delivery) -> Message {
    let table = delivery.properties.headers().clone().unwrap_or_default();
    let kind = delivery.properties.kind().clone();
    let properties = message_properties(&delivery.properties);

    let mut msg = Message::new(delivery.delivery_tag, std::mem::take(&mut delivery.data))
        .redelivered(delivery.redelivered)
        .exchange(delivery.exchange.as_str())
        .routing_key(delivery.routing_key.as_str())
        .headers(headers(&table))
        .properties(properties);

    if let Some(kind) = kind {
        msg = msg.msg_type(kind.as_str());
    }

    if let Some(count) = death_count(&table) {
        msg = msg.death_count(count);
    }

    msg
}

/// Reads the count of the most recent `x-death` entry.
fn death_count(table: &FieldTable) -> Option<u64> {
    table
        .inner()
        .get(AMQP_HEADERS_X_DEATH)?
        .as_array()?
        .as_slice()
        .first()?
        .as_field_table()?
        .inner()
        .get(AMQP_HEADERS_COUNT)?
        .as_long_long_int()
        .and_then(|count| u64::try_from(count).ok())
}

fn headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), header_value(value)))
        .collect()
}

fn header_value(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::LongString(v) => match std::str::from_utf8(v.as_bytes()) {
            Ok(text) => HeaderValue::String(text.to_owned()),
            Err(_) => HeaderValue::Binary(v.as_bytes().to_vec()),
        },
        AMQPValue::ShortString(v) => HeaderValue::String(v.to_string()),
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::ShortShortUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::UInt(u64::from(*v)),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(v) => HeaderValue::Decimal {
            scale: v.scale,
            value: v.value,
        },
        AMQPValue::Timestamp(v) => HeaderValue::Timestamp(*v),
        AMQPValue::FieldArray(v) => {
            HeaderValue::Array(v.as_slice().iter().map(header_value).collect())
        }
        AMQPValue::FieldTable(v) => HeaderValue::Table(headers(v)),
        AMQPValue::Void => HeaderValue::Void,
    }
}

fn field_table(headers: &Headers) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect();

    FieldTable::from(btree)
}

fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Binary(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
        // AMQP tables have no unsigned 64-bit integer besides the timestamp.
        HeaderValue::UInt(v) => match LongLongInt::try_from(*v) {
            Ok(v) => AMQPValue::LongLongInt(v),
            Err(_) => AMQPValue::Timestamp(*v),
        },
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Decimal { scale, value } => AMQPValue::DecimalValue(DecimalValue {
            scale: *scale,
            value: *value,
        }),
        HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
        HeaderValue::Array(values) => {
            AMQPValue::FieldArray(FieldArray::from(values.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        HeaderValue::Table(headers) => AMQPValue::FieldTable(field_table(headers)),
        HeaderValue::Void => AMQPValue::Void,
    }
}
