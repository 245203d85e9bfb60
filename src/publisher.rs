// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes messages through a [`Transport`], carrying the caller's trace
//! context in the message headers.

use crate::{
    errors::AmqpError,
    message::{Headers, PublishMessage},
    otel,
    transport::Transport,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

pub struct RabbitMQPublisher {
    transport: Arc<dyn Transport>,
}

impl RabbitMQPublisher {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { transport })
    }

    /// Publishes `msg` with the trace context of `ctx` injected into its
    /// headers. Headers set on `msg` win over propagated entries.
    pub async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let mut headers = Headers::default();
        otel::inject(ctx, &mut headers);
        headers.extend(msg.headers.clone());

        let outgoing = PublishMessage {
            headers,
            ..msg.clone()
        };

        match self.transport.publish(&outgoing).await {
            Ok(()) => {
                debug!(
                    exchange = %msg.exchange,
                    routing_key = %msg.routing_key,
                    "message published"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
        }
    }

    /// Serializes `data` as JSON and publishes it.
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        msg_type: &str,
        data: &T,
    ) -> Result<(), AmqpError> {
        let msg = PublishMessage::json(exchange, routing_key, data)?.msg_type(msg_type);
        self.publish(ctx, &msg).await
    }
}
