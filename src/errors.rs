// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Runtime
//!
//! This module provides the error type shared by every layer of the crate.
//! The `AmqpError` enum covers connection and channel setup, topology
//! declaration, message settlement, acknowledgement bookkeeping and
//! consumer-loop failures.

use thiserror::Error;

/// Represents errors that can occur while declaring topology, consuming or
/// publishing messages.
///
/// Each variant provides specific context about what operation failed.
/// `TopologyConflict`, `AlreadyFinalized` and `BrokerDisconnected` are the
/// conditions the consumer runtime surfaces to its caller; handler failures
/// never escape as errors, they are turned into a `PermanentFailure` outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Configuration values that cannot drive a consumer or a connection
    #[error("invalid configs: {0}")]
    InvalidConfigs(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// An entity was redeclared with parameters that differ from the declared ones
    #[error("topology conflict on `{0}`")]
    TopologyConflict(String),

    /// The topology references entities that are not part of it
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeue message")]
    RequeuingMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDLQError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// A delivery tag was acquired while a previous delivery with the same tag is still held
    #[error("delivery `{0}` is already in flight")]
    DuplicateDelivery(u64),

    /// A disposition was applied twice to the same ticket
    #[error("delivery `{0}` was already finalized")]
    AlreadyFinalized(u64),

    /// A handler terminated abnormally
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The connection or channel is gone; the broker owns redelivery from here
    #[error("broker disconnected: {0}")]
    BrokerDisconnected(String),
}
