// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Routes messages of one queue to a handler per message type, using the
//! AMQP `type` property. The dispatcher is itself a [`ConsumerHandler`] and
//! is handed to the consumer runtime as-is.

use crate::{handler::ConsumerHandler, message::Message, policy::DeliveryOutcome};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

#[derive(Default, Clone)]
pub struct RabbitMQDispatcher {
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
    fallback: Option<Arc<dyn ConsumerHandler>>,
}

impl RabbitMQDispatcher {
    pub fn new() -> Self {
        RabbitMQDispatcher::default()
    }

    /// Registers `handler` for messages whose type is `msg_type`. A later
    /// registration for the same type replaces the earlier one.
    pub fn register(mut self, msg_type: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.handlers.insert(msg_type.to_owned(), handler);
        self
    }

    /// Handles messages without a type or with an unregistered one.
    pub fn fallback(mut self, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn is_registered(&self, msg_type: &str) -> bool {
        self.handlers.contains_key(msg_type)
    }
}

#[async_trait]
impl ConsumerHandler for RabbitMQDispatcher {
    async fn exec(&self, ctx: &Context, msg: &Message) -> DeliveryOutcome {
        let handler = msg
            .kind()
            .and_then(|kind| self.handlers.get(kind))
            .or(self.fallback.as_ref());

        match handler {
            Some(handler) => handler.exec(ctx, msg).await,
            None => {
                warn!(
                    delivery_tag = msg.delivery_tag(),
                    msg_type = msg.kind().unwrap_or_default(),
                    "no handler registered for message type"
                );
                DeliveryOutcome::PermanentFailure
            }
        }
    }
}
