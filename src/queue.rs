// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! This module provides the queue and binding halves of the consumer topology,
//! including the optional Dead Letter Queue that receives messages rejected
//! without requeue.

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default the queue is non-durable, non-exclusive and not auto-deleted.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Makes the declaration passive: it only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named `<queue>-dlq`.
    ///
    /// Messages rejected without requeue, expired, or overflowing are routed
    /// there instead of being dropped.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    pub(crate) fn options(&self) -> lapin::options::QueueDeclareOptions {
        lapin::options::QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: false,
        }
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key are empty until set.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key pattern for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
