// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides the static topology the consumer needs and the code
//! that declares it on a channel. The topology is one exchange, one queue
//! (with an optional Dead Letter Queue), one binding and the channel prefetch.
//!
//! Every declaration is idempotent by name and attributes, so `declare` can
//! run again on every new channel after a reconnect.

use crate::{
    broker::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Prefetch used when none is configured: one unacknowledged delivery at a time.
pub const DEFAULT_PREFETCH: u16 = 1;

/// The exchange, queue, binding and prefetch a consumer depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
    pub(crate) prefetch: u16,
}

impl TopologySpec {
    /// Topic exchange `exchange`, transient queue `queue` bound with `pattern`,
    /// prefetch 1.
    pub fn new(exchange: &str, queue: &str, pattern: &str) -> TopologySpec {
        TopologySpec {
            exchange: ExchangeDefinition::new(exchange),
            queue: QueueDefinition::new(queue),
            binding: QueueBinding::new(queue)
                .exchange(exchange)
                .routing_key(pattern),
            prefetch: DEFAULT_PREFETCH,
        }
    }

    /// Replaces the exchange definition and rebinds the queue to it.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.binding = self.binding.exchange(&def.name);
        self.exchange = def;
        self
    }

    /// Replaces the queue definition and rebinds it to the exchange.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.binding = QueueBinding::new(&def.name)
            .exchange(&self.exchange.name)
            .routing_key(&self.binding.routing_key);
        self.queue = def;
        self
    }

    pub fn routing_key(mut self, pattern: &str) -> Self {
        self.binding = self.binding.routing_key(pattern);
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange.name
    }

    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }
}

impl Default for TopologySpec {
    fn default() -> Self {
        TopologySpec::new("demo.exchange", "demo.queue.log", "demo.queue.*")
    }
}

/// Declares `spec` on `channel`.
///
/// The operations run in this order:
/// 1. Sets the per-consumer prefetch, before any consumer registers
/// 2. Declares the exchange
/// 3. Declares the DLQ, if configured
/// 4. Declares the queue with its arguments
/// 5. Binds the queue to the exchange
///
/// Any broker refusal is returned as a topology error naming the entity.
pub async fn declare(channel: &dyn BrokerChannel, spec: &TopologySpec) -> Result<(), AmqpError> {
    install_qos(channel, spec.prefetch).await?;
    install_exchange(channel, &spec.exchange).await?;
    install_queue(channel, &spec.queue).await?;
    binding_queue(channel, &spec.binding).await
}

async fn install_qos(channel: &dyn BrokerChannel, prefetch: u16) -> Result<(), AmqpError> {
    debug!("configuring prefetch: {}", prefetch);

    channel.basic_qos(prefetch).await.map_err(|err| {
        error!(error = err.to_string(), prefetch, "error to configure qos");
        AmqpError::QoSDeclarationError(err.to_string())
    })
}

async fn install_exchange(
    channel: &dyn BrokerChannel,
    exch: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exch.name);

    match channel.exchange_declare(exch).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exch.name.as_str(),
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError {
                name: exch.name.clone(),
                reason: err.to_string(),
            })
        }
        _ => {
            debug!("exchange: {} was created", exch.name);
            Ok(())
        }
    }
}

async fn install_queue(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    let mut queue_args = BTreeMap::new();

    if let Some(dlq_name) = &def.dlq_name {
        declare_dlq(channel, def, dlq_name, &mut queue_args).await?;
    }

    if let Some(ttl) = def.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    if let Some(max_bytes) = def.max_length_bytes {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
    }

    match channel.queue_declare(def, FieldTable::from(queue_args)).await {
        Err(err) => {
            error!(
                error = err.to_string(),
                queue = def.name.as_str(),
                "error to declare the queue"
            );
            Err(AmqpError::DeclareQueueError {
                name: def.name.clone(),
                reason: err.to_string(),
            })
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

/// Declares the DLQ with the same flags as its queue and points the queue's
/// dead-lettering at it through the default exchange.
async fn declare_dlq(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
    dlq_name: &str,
    queue_args: &mut BTreeMap<ShortString, AMQPValue>,
) -> Result<(), AmqpError> {
    let mut dlq = def.clone();
    dlq.name = dlq_name.to_owned();
    dlq.dlq_name = None;

    if let Err(err) = channel.queue_declare(&dlq, FieldTable::default()).await {
        error!(error = err.to_string(), queue = dlq_name, "failure to declare dlq");
        return Err(AmqpError::DeclareQueueError {
            name: dlq_name.to_owned(),
            reason: err.to_string(),
        });
    }

    queue_args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    queue_args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(dlq_name)),
    );

    Ok(())
}

async fn binding_queue(
    channel: &dyn BrokerChannel,
    binding: &QueueBinding,
) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel.queue_bind(binding).await {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");

            Err(AmqpError::BindingExchangeToQueueError {
                exchange: binding.exchange_name.clone(),
                queue: binding.queue_name.clone(),
                reason: err.to_string(),
            })
        }
        _ => {
            debug!("queue was bound");
            Ok(())
        }
    }
}
