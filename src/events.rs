// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Events
//!
//! Structured events emitted by the consumer runtime and the topology manager.
//! `DeliveryObserver` is the seam for metrics or audit sinks; `TracingObserver`
//! writes every event to the `tracing` log.

use crate::policy::DeliveryOutcome;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryEvent {
    Dispatched {
        queue: String,
        delivery_tag: u64,
        attempt: u32,
    },
    Acked {
        queue: String,
        delivery_tag: u64,
    },
    Requeued {
        queue: String,
        delivery_tag: u64,
        next_attempt: u32,
    },
    DeadLettered {
        queue: String,
        delivery_tag: u64,
        outcome: DeliveryOutcome,
        attempt: u32,
    },
    TopologyConflict {
        name: String,
    },
    HandlerPanic {
        queue: String,
        delivery_tag: u64,
        reason: String,
    },
    Stuck {
        queue: String,
        delivery_tag: u64,
        held_for: Duration,
    },
    BrokerDisconnected {
        queue: String,
        delivery_tag: Option<u64>,
        reason: String,
    },
    /// The consumed queue has no known dead-letter exchange and no explicit
    /// target is set; rejected messages are dropped unless a broker policy
    /// routes them.
    DeadLetterUnrouted {
        queue: String,
    },
}

pub trait DeliveryObserver: Send + Sync {
    fn on_event(&self, event: &DeliveryEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_event(&self, event: &DeliveryEvent) {
        match event {
            DeliveryEvent::Dispatched {
                queue,
                delivery_tag,
                attempt,
            } => debug!(queue, delivery_tag, attempt, "message dispatched"),
            DeliveryEvent::Acked {
                queue,
                delivery_tag,
            } => debug!(queue, delivery_tag, "message successfully processed"),
            DeliveryEvent::Requeued {
                queue,
                delivery_tag,
                next_attempt,
            } => warn!(
                queue,
                delivery_tag, next_attempt, "error whiling handling msg, requeuing for latter"
            ),
            DeliveryEvent::DeadLettered {
                queue,
                delivery_tag,
                outcome,
                attempt,
            } => error!(
                queue,
                delivery_tag,
                attempt,
                outcome = ?outcome,
                "sending message to dlq"
            ),
            DeliveryEvent::TopologyConflict { name } => {
                error!(name, "topology redeclared with different parameters")
            }
            DeliveryEvent::HandlerPanic {
                queue,
                delivery_tag,
                reason,
            } => error!(queue, delivery_tag, reason, "handler panicked"),
            DeliveryEvent::Stuck {
                queue,
                delivery_tag,
                held_for,
            } => warn!(
                queue,
                delivery_tag,
                held_for_ms = held_for.as_millis() as u64,
                "message held by handler for too long"
            ),
            DeliveryEvent::BrokerDisconnected {
                queue,
                delivery_tag,
                reason,
            } => error!(
                queue,
                delivery_tag = ?delivery_tag,
                reason,
                "broker disconnected, disposition left to the broker"
            ),
            DeliveryEvent::DeadLetterUnrouted { queue } => {
                warn!(queue, "dead-lettered messages have no known destination")
            }
        }
    }
}
