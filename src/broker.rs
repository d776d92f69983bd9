// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The host, the topology declarer and the consumer loop only talk to the
//! broker through the traits in this module. `channel` provides the lapin
//! backed implementations; tests provide in-memory ones.
//!
//! A `BrokerChannel` has a single owner at a time: once a consumer is started
//! on it, only the consumer's delivery task issues acks, rejects and the
//! consumer cancel. The host closes the channel only after that task ended.

use crate::{
    config::ConnectionConfig,
    delivery::{AckToken, Delivery},
    errors::AmqpError,
    events::EventSender,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::types::FieldTable;
use std::sync::Arc;

/// Stream of deliveries for one registered consumer.
///
/// The stream ends when the consumer is cancelled and yields an error when the
/// channel fails.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a connection and wires its shutdown notification to `events`.
    async fn open(
        &self,
        cfg: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport session to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Closes the connection. Closing an already closed connection is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical session multiplexed over a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Process-unique identifier of this channel instance, carried by every
    /// `AckToken` it issues.
    fn epoch(&self) -> u64;

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition, args: FieldTable)
        -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Registers a manual-ack consumer on `queue`.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, token: AckToken) -> Result<(), AmqpError>;

    async fn basic_reject(&self, token: AckToken, requeue: bool) -> Result<(), AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel. Closing an already closed channel is a no-op.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Fails with `StaleAckToken` when `token` was not issued by `channel_epoch`.
pub fn check_token(channel_epoch: u64, token: &AckToken) -> Result<(), AmqpError> {
    if token.epoch() == channel_epoch {
        return Ok(());
    }

    Err(AmqpError::StaleAckToken {
        delivery_tag: token.delivery_tag(),
        token_epoch: token.epoch(),
        channel_epoch,
    })
}
