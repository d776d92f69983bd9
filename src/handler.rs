// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A `MessageHandler` is the business logic plugged into the consumer loop. It
//! receives the raw payload with its delivery metadata and decides what
//! happens to the message through a `Disposition`; it never talks to the
//! broker itself.

use async_trait::async_trait;
use opentelemetry::Context;
use tracing::info;

/// What the consumer loop does with a delivery once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing succeeded, acknowledge the delivery.
    Ack,
    /// Processing failed. With `requeue` the broker redelivers the message,
    /// otherwise it is dropped or dead-lettered per queue configuration.
    Reject { requeue: bool },
}

/// A delivery as seen by a handler.
#[derive(Debug)]
pub struct IncomingMessage<'m> {
    pub payload: &'m [u8],
    pub exchange: &'m str,
    pub routing_key: &'m str,
    pub redelivered: bool,
    /// Trace context propagated by the publisher, if any.
    pub ctx: &'m Context,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: &IncomingMessage<'_>) -> Disposition;
}

/// Logs every payload as UTF-8 and acknowledges it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, msg: &IncomingMessage<'_>) -> Disposition {
        info!(
            routing_key = msg.routing_key,
            "consumer received {}",
            String::from_utf8_lossy(msg.payload)
        );
        Disposition::Ack
    }
}

/// Adapts a plain function of the payload into a handler.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&[u8]) -> Disposition + Send + Sync,
{
    FnHandler { f }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&[u8]) -> Disposition + Send + Sync,
{
    async fn handle(&self, msg: &IncomingMessage<'_>) -> Disposition {
        (self.f)(msg.payload)
    }
}
