// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Runtime
//!
//! Reliable message delivery on top of RabbitMQ: idempotent topology
//! declaration, a bounded-concurrency consumer loop and a retry policy that
//! requeues or dead-letters failed messages.

mod otel;
#[cfg(test)]
mod test_utils;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod policy;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod tracker;
pub mod transport;
