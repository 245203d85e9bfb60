// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Configuration
//!
//! Connection and consumer settings are plain structs passed at construction.
//! Both can be deserialized with `serde`; `RabbitMQConfigs::from_env` reads
//! the `RABBITMQ_*` environment variables through the `config` crate.

use crate::errors::AmqpError;
use config::{Config, Environment};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds, `0` disables heartbeats.
    pub heartbeat_interval: u16,
    /// Name reported to the broker for the connection.
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "user".to_owned(),
            password: "password".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_interval: 60,
            connection_name: "rabbitmq-runtime".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the connection settings from `RABBITMQ_HOST`, `RABBITMQ_PORT`,
    /// `RABBITMQ_USER`, `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST`,
    /// `RABBITMQ_HEARTBEAT_INTERVAL` and `RABBITMQ_CONNECTION_NAME`.
    ///
    /// Missing variables keep their default value.
    pub fn from_env() -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(Environment::with_prefix("RABBITMQ").try_parsing(true))
            .build()
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read rabbitmq env");
                AmqpError::InvalidConfigs(err.to_string())
            })?;

        cfg.try_deserialize().map_err(|err| {
            error!(error = err.to_string(), "failure to deserialize rabbitmq configs");
            AmqpError::InvalidConfigs(err.to_string())
        })
    }

    /// Builds the AMQP URI used to open the connection.
    ///
    /// User, password and vhost are percent-encoded, so the default `/` vhost
    /// becomes `%2F` and a password may hold `@`, `:` or `/`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(&self.vhost),
            self.heartbeat_interval
        )
    }
}

/// Everything outside the URI unreserved set is percent-encoded.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode(component: &str) -> String {
    utf8_percent_encode(component, URI_COMPONENT).to_string()
}

/// Settings of a single consumer loop.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigs {
    /// Maximum number of handlers running at the same time.
    pub concurrency: usize,
    /// Maximum number of unacknowledged messages, also sent as `basic.qos`.
    pub prefetch: u16,
    /// Number of requeues a retriable failure gets before being dead-lettered.
    pub max_retries: u32,
    /// How long in-flight handlers may drain after cancellation.
    pub shutdown_deadline_ms: u64,
    /// Handlers running longer than this are treated as a retriable failure.
    pub handler_timeout_ms: Option<u64>,
    /// Messages held longer than this are reported as stuck.
    pub stuck_after_ms: Option<u64>,
    /// Consumer tag, empty lets the broker generate one.
    pub consumer_tag: String,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        ConsumerConfigs {
            concurrency: 1,
            prefetch: 1,
            max_retries: 3,
            shutdown_deadline_ms: 30_000,
            handler_timeout_ms: None,
            stuck_after_ms: None,
            consumer_tag: String::new(),
        }
    }
}

impl ConsumerConfigs {
    pub fn new(concurrency: usize, prefetch: u16) -> Self {
        ConsumerConfigs {
            concurrency,
            prefetch,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn stuck_after(mut self, max_age: Duration) -> Self {
        self.stuck_after_ms = Some(max_age.as_millis() as u64);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Rejects settings that would never dispatch a message.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.concurrency == 0 {
            return Err(AmqpError::InvalidConfigs(
                "concurrency must be at least 1".to_owned(),
            ));
        }

        if self.prefetch == 0 {
            return Err(AmqpError::InvalidConfigs(
                "prefetch must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }

    /// Worker slots actually usable: a handler can't hold more messages than
    /// the broker is allowed to deliver unacknowledged.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.min(self.prefetch as usize)
    }

    pub fn shutdown_deadline_duration(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn handler_timeout_duration(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn stuck_after_duration(&self) -> Option<Duration> {
        self.stuck_after_ms.map(Duration::from_millis)
    }
}
