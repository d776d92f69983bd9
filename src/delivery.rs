// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A `Delivery` is one message pushed by the broker to this consumer. It is
//! acknowledged or rejected exactly once through its `AckToken`, which is only
//! valid on the channel instance that produced it.

use lapin::BasicProperties;

/// Opaque acknowledgment handle for a single delivery.
///
/// Delivery tags restart at 1 on every channel, so the token also carries the
/// epoch of the channel that issued it. A channel refuses tokens minted by any
/// other channel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken {
    epoch: u64,
    delivery_tag: u64,
}

impl AckToken {
    /// Mints a token. Only broker channel implementations should call this.
    pub fn new(epoch: u64, delivery_tag: u64) -> Self {
        AckToken {
            epoch,
            delivery_tag,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: AckToken,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub(crate) fn from_lapin(epoch: u64, delivery: lapin::message::Delivery) -> Self {
        Delivery {
            token: AckToken::new(epoch, delivery.delivery_tag),
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            payload: delivery.data,
        }
    }
}
