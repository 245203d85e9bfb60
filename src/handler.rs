// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler
//!
//! The user-supplied processing step. A handler may perform arbitrary I/O and
//! take as long as it needs; the runtime bounds how many run at once.

use crate::{message::Message, policy::DeliveryOutcome};
use async_trait::async_trait;
use opentelemetry::Context;

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one message. `ctx` carries the trace context extracted
    /// from the message headers.
    ///
    /// A panic is caught by the runtime and handled as `PermanentFailure`.
    async fn exec(&self, ctx: &Context, msg: &Message) -> DeliveryOutcome;
}
