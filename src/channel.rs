// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module implements the broker traits on top of lapin. It establishes
//! connections to the RabbitMQ server, registers the connection shutdown
//! notification, and creates the channels used for declaring topology and
//! consuming.

use crate::{
    broker::{check_token, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream},
    config::ConnectionConfig,
    delivery::{AckToken, Delivery},
    errors::AmqpError,
    events::{EventSender, LifecycleEvent},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions, QueueBindOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

static CHANNEL_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Opens lapin connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn open(
        &self,
        cfg: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        Ok(Arc::new(AmqpConnection::open(cfg, events).await?))
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    conn: Connection,
    closed: AtomicBool,
}

impl AmqpConnection {
    /// Connects to the broker described by `cfg`.
    ///
    /// The attempt is bounded by the configured connect timeout. Once
    /// connected, any connection level error is reported on `events` as
    /// `ConnectionShutdown`.
    pub async fn open(cfg: &ConnectionConfig, events: EventSender) -> Result<Self, AmqpError> {
        debug!(host = cfg.host.as_str(), port = cfg.port, "creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let conn = match tokio::time::timeout(
            cfg.timeout(),
            Connection::connect_uri(cfg.uri(), options),
        )
        .await
        {
            Err(_) => {
                error!(
                    host = cfg.host.as_str(),
                    port = cfg.port,
                    timeout_ms = cfg.connect_timeout_ms,
                    "timed out connecting"
                );
                Err(AmqpError::ConnectionTimeout {
                    host: cfg.host.clone(),
                    port: cfg.port,
                    millis: cfg.connect_timeout_ms,
                })
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    host = cfg.host.as_str(),
                    port = cfg.port,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError {
                    host: cfg.host.clone(),
                    port: cfg.port,
                    reason: err.to_string(),
                })
            }
            Ok(Ok(c)) => Ok(c),
        }?;
        debug!("amqp connected");

        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection shutdown");
            let _ = events.send(LifecycleEvent::ConnectionShutdown {
                reason: err.to_string(),
            });
        });

        Ok(AmqpConnection {
            conn,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("connection already closed");
            return Ok(());
        }

        if !self.conn.status().connected() {
            debug!("connection already gone, nothing to close");
            return Ok(());
        }

        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            warn!(error = err.to_string(), "error closing connection");
            AmqpError::InternalError(err.to_string())
        })
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    channel: Channel,
    epoch: u64,
    closed: AtomicBool,
}

impl AmqpChannel {
    pub fn new(channel: Channel) -> Self {
        AmqpChannel {
            channel,
            epoch: CHANNEL_EPOCH.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                def.options(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn queue_declare(
        &self,
        def: &QueueDefinition,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(def.name(), def.options(), args)
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        let epoch = self.epoch;
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Delivery::from_lapin(epoch, delivery)),
                Err(err) => Err(AmqpError::ChannelError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_ack(&self, token: AckToken) -> Result<(), AmqpError> {
        check_token(self.epoch, &token)?;

        self.channel
            .basic_ack(token.delivery_tag(), BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn basic_reject(&self, token: AckToken, requeue: bool) -> Result<(), AmqpError> {
        check_token(self.epoch, &token)?;

        self.channel
            .basic_reject(token.delivery_tag(), BasicRejectOptions { requeue })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| AmqpError::CancelConsumerError(format!("{consumer_tag}: {err}")))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("channel already closed");
            return Ok(());
        }

        if !self.channel.status().connected() {
            debug!("channel already gone, nothing to close");
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "error closing channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}
