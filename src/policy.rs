// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Policy
//!
//! Maps a handler outcome and the message's attempt count to a disposition:
//!
//! | outcome            | attempt < max_retries | attempt >= max_retries |
//! |--------------------|-----------------------|------------------------|
//! | `Success`          | `Ack`                 | `Ack`                  |
//! | `RetriableFailure` | `Requeue`             | `DeadLetter`           |
//! | `PermanentFailure` | `DeadLetter`          | `DeadLetter`           |
//!
//! The attempt count travels with the message in the `x-retry-count` header,
//! which the consumer increments every time it requeues a message.

use crate::message::{HeaderValue, Headers, Message};

/// Header carrying the number of times a message was requeued by the consumer
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Result of handling a message, produced by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    RetriableFailure,
    PermanentFailure,
}

/// What the broker is told about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    DeadLetter,
}

/// Maps a handler outcome to what happens to the message.
///
/// # Parameters
/// * `outcome` - Result reported by the handler
/// * `attempt` - Number of earlier attempts, 0 for a first delivery
/// * `max_retries` - Requeues a retriable failure gets before being dead-lettered
///
/// # Returns
/// `Ack` on success, `Requeue` for a retriable failure with budget left,
/// `DeadLetter` otherwise
pub fn decide(outcome: DeliveryOutcome, attempt: u32, max_retries: u32) -> Disposition {
    match outcome {
        DeliveryOutcome::Success => Disposition::Ack,
        DeliveryOutcome::RetriableFailure if attempt < max_retries => Disposition::Requeue,
        DeliveryOutcome::RetriableFailure | DeliveryOutcome::PermanentFailure => {
            Disposition::DeadLetter
        }
    }
}

/// Retry budget of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    max_retries: u32,
}

impl DeliveryPolicy {
    pub fn new(max_retries: u32) -> Self {
        DeliveryPolicy { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// [`decide`] with this policy's retry budget.
    pub fn decide(&self, outcome: DeliveryOutcome, attempt: u32) -> Disposition {
        decide(outcome, attempt, self.max_retries)
    }

    /// Number of earlier attempts at processing `msg`.
    ///
    /// A redelivered message without any counter may already have been
    /// processed an unknown number of times, so it gets no retry budget left.
    pub fn attempt_of(&self, msg: &Message) -> u32 {
        if let Some(count) = msg
            .get_header(AMQP_HEADERS_RETRY_COUNT)
            .and_then(HeaderValue::as_u64)
        {
            return saturate(count);
        }

        if let Some(count) = msg.deaths() {
            return saturate(count);
        }

        if msg.is_redelivered() {
            return self.max_retries;
        }

        0
    }

    /// Headers of the republished copy of `msg` after `attempt` failed.
    pub fn requeue_headers(&self, msg: &Message, attempt: u32) -> Headers {
        let mut headers = msg.header_map().clone();
        headers.insert(
            AMQP_HEADERS_RETRY_COUNT.to_owned(),
            HeaderValue::UInt(u64::from(attempt) + 1),
        );
        headers
    }
}

fn saturate(count: u64) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}
