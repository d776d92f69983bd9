// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! This module defines the exchange side of the consumer topology. Exchanges
//! are the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues; the consumer declares exactly one of them, a topic
//! exchange by default.

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Two declarations of the same name succeed only when every attribute
/// matches; the broker answers any difference with a precondition failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
}

impl ExchangeDefinition {
    /// Creates a new, transient topic exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive: the declaration only checks it exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub(crate) fn options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: false,
        }
    }
}
