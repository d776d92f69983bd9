// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Consumer
//!
//! This module provides the error type shared by every part of the consumer.
//! The `AmqpError` enum groups failures the same way the service reacts to them:
//! connection failures and topology conflicts are fatal at startup, channel
//! failures end the current session, and handler failures never leave the
//! consumer loop.

use thiserror::Error;

/// Represents errors that can occur while connecting to, declaring on, or
/// consuming from RabbitMQ.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect to `{host}:{port}`: {reason}")]
    ConnectionError {
        host: String,
        port: u16,
        reason: String,
    },

    /// The connection attempt did not complete within the configured timeout
    #[error("timed out after {millis}ms connecting to `{host}:{port}`")]
    ConnectionTimeout { host: String, port: u16, millis: u64 },

    /// Error creating or using a channel
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{name}`: {reason}")]
    DeclareExchangeError { name: String, reason: String },

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{name}`: {reason}")]
    DeclareQueueError { name: String, reason: String },

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{exchange}` to queue `{queue}`: {reason}")]
    BindingExchangeToQueueError {
        exchange: String,
        queue: String,
        reason: String,
    },

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer on `{queue}`: {reason}")]
    ConsumerDeclarationError { queue: String, reason: String },

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// An ack token was presented to a channel other than the one that issued it
    #[error(
        "ack token for delivery {delivery_tag} belongs to channel epoch {token_epoch}, \
         not {channel_epoch}"
    )]
    StaleAckToken {
        delivery_tag: u64,
        token_epoch: u64,
        channel_epoch: u64,
    },

    /// The message handler failed while processing a delivery
    #[error("failure to handle message: {0}")]
    HandlerError(String),

    /// The host gave up re-establishing the session
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl AmqpError {
    /// Whether the error comes from a broker-side declaration conflict.
    ///
    /// These are misconfigurations: retrying the same declaration cannot succeed.
    pub fn is_topology_error(&self) -> bool {
        matches!(
            self,
            AmqpError::QoSDeclarationError(_)
                | AmqpError::DeclareExchangeError { .. }
                | AmqpError::DeclareQueueError { .. }
                | AmqpError::BindingExchangeToQueueError { .. }
        )
    }

    /// Whether the error was raised while establishing the connection.
    pub fn is_connect_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError { .. } | AmqpError::ConnectionTimeout { .. }
        )
    }
}
