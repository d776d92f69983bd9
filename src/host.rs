// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Lifecycle Host
//!
//! The host owns the connection, the channel and the consumer of the current
//! session. It starts a session with connect → open channel → declare
//! topology → start consuming, and tears it down in the reverse order:
//! stop consuming → close channel → close connection.
//!
//! Startup failures on the first session are returned to the caller. When a
//! running session is lost (connection error, channel failure, broker-side
//! cancel) the host tears it down and, if the reconnect policy allows it,
//! starts a fresh session with exponential backoff.
//!
//! Every broker call made while tearing down is bounded by the configured
//! connect timeout, so an unresponsive broker cannot hold the process. Only a
//! handler that is already running is waited for without a limit.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector},
    config::{ConnectionConfig, ReconnectPolicy},
    consumer::{ConsumerHandle, ConsumerLoop},
    errors::AmqpError,
    events::{EventReceiver, EventSender, LifecycleEvent},
    handler::MessageHandler,
    topology::{self, TopologySpec},
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Session {
    connection: Arc<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    consumer: ConsumerHandle,
    events: EventReceiver,
}

/// Supervises one consumer for the lifetime of the process.
pub struct LifecycleHost {
    connector: Arc<dyn BrokerConnector>,
    config: ConnectionConfig,
    topology: TopologySpec,
    handler: Arc<dyn MessageHandler>,
    reconnect: ReconnectPolicy,
    observer: Option<EventSender>,
}

impl LifecycleHost {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        config: ConnectionConfig,
        topology: TopologySpec,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        LifecycleHost {
            connector,
            config,
            topology,
            handler,
            reconnect: ReconnectPolicy::default(),
            observer: None,
        }
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Forwards every lifecycle event to `observer` as well as logging it.
    pub fn observer(mut self, observer: EventSender) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs sessions until `shutdown` is cancelled.
    ///
    /// Returns `Ok(())` after an orderly teardown. Returns an error when the
    /// first session cannot be started, when a topology conflict shows up on
    /// reconnect, or when reconnect attempts are exhausted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AmqpError> {
        let mut session = self.start().await?;

        loop {
            let lost = tokio::select! {
                _ = shutdown.cancelled() => None,
                reason = self.watch(&mut session.events) => Some(reason),
            };

            let Some(reason) = lost else {
                info!("shutdown requested, stopping consumer");
                self.teardown(session).await;
                return Ok(());
            };

            warn!(
                reason = reason.as_str(),
                queue = self.topology.queue_name(),
                "consumer session lost"
            );
            self.teardown(session).await;

            if !self.reconnect.enabled {
                info!("reconnect disabled, waiting for shutdown");
                shutdown.cancelled().await;
                return Ok(());
            }

            session = match self.restart(&shutdown).await? {
                Some(s) => s,
                None => return Ok(()),
            };
        }
    }

    /// connect → open channel → declare → start consuming.
    ///
    /// Whatever was opened before a failing step is closed again.
    async fn start(&self) -> Result<Session, AmqpError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            host = self.config.host.as_str(),
            port = self.config.port,
            "connecting to broker"
        );

        let connection = match self.connector.open(&self.config, events_tx.clone()).await {
            Ok(c) => c,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    host = self.config.host.as_str(),
                    port = self.config.port,
                    "failure to connect"
                );
                return Err(err);
            }
        };

        let channel = match connection.open_channel().await {
            Ok(c) => c,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    host = self.config.host.as_str(),
                    "failure to open channel"
                );
                close_connection(connection.as_ref(), self.config.timeout()).await;
                return Err(err);
            }
        };

        if let Err(err) = topology::declare(channel.as_ref(), &self.topology).await {
            error!(
                error = err.to_string(),
                host = self.config.host.as_str(),
                exchange = self.topology.exchange_name(),
                queue = self.topology.queue_name(),
                "failure to declare topology"
            );
            close_channel(channel.as_ref(), self.config.timeout()).await;
            close_connection(connection.as_ref(), self.config.timeout()).await;
            return Err(err);
        }

        let consumer = match ConsumerLoop::new(
            channel.clone(),
            self.topology.queue_name(),
            self.handler.clone(),
            events_tx,
        )
        .cancel_timeout(self.config.timeout())
        .start()
        .await
        {
            Ok(c) => c,
            Err(err) => {
                close_channel(channel.as_ref(), self.config.timeout()).await;
                close_connection(connection.as_ref(), self.config.timeout()).await;
                return Err(err);
            }
        };

        info!(
            host = self.config.host.as_str(),
            queue = self.topology.queue_name(),
            consumer_tag = consumer.consumer_tag(),
            "consumer session started"
        );

        Ok(Session {
            connection,
            channel,
            consumer,
            events: events_rx,
        })
    }

    /// Starts a new session with backoff between attempts.
    ///
    /// Returns `None` when shutdown was requested while waiting.
    async fn restart(&self, shutdown: &CancellationToken) -> Result<Option<Session>, AmqpError> {
        for attempt in 1..=self.reconnect.max_retries {
            let delay = self.reconnect.delay(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnecting to broker"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.start().await {
                Ok(session) => return Ok(Some(session)),
                Err(err) if err.is_topology_error() => return Err(err),
                Err(err) => warn!(error = err.to_string(), attempt, "reconnect attempt failed"),
            }
        }

        error!(
            attempts = self.reconnect.max_retries,
            host = self.config.host.as_str(),
            "giving up reconnecting"
        );
        Err(AmqpError::ReconnectExhausted {
            attempts: self.reconnect.max_retries,
        })
    }

    /// Logs and forwards events until one ends the session; returns its reason.
    async fn watch(&self, events: &mut EventReceiver) -> String {
        while let Some(event) = events.recv().await {
            debug!(event = ?event, "lifecycle event");
            self.forward(&event);

            if event.ends_session() {
                return event.reason();
            }
        }

        "event queue closed".to_owned()
    }

    /// stop consuming → close channel → close connection, each best-effort.
    async fn teardown(&self, mut session: Session) {
        if let Err(err) = session.consumer.stop().await {
            warn!(error = err.to_string(), "failure stopping consumer");
        }

        let limit = self.config.timeout();
        close_channel(session.channel.as_ref(), limit).await;
        session.consumer.mark_shut_down();
        close_connection(session.connection.as_ref(), limit).await;

        while let Ok(event) = session.events.try_recv() {
            debug!(event = ?event, "lifecycle event");
            self.forward(&event);
        }

        info!(queue = self.topology.queue_name(), "consumer session closed");
    }

    fn forward(&self, event: &LifecycleEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event.clone());
        }
    }
}

async fn close_channel(channel: &dyn BrokerChannel, limit: Duration) {
    match tokio::time::timeout(limit, channel.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = err.to_string(), "failure closing channel"),
        Err(_) => warn!(
            timeout_ms = limit.as_millis() as u64,
            "timed out closing channel"
        ),
    }
}

async fn close_connection(connection: &dyn BrokerConnection, limit: Duration) {
    match tokio::time::timeout(limit, connection.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = err.to_string(), "failure closing connection"),
        Err(_) => warn!(
            timeout_ms = limit.as_millis() as u64,
            "timed out closing connection"
        ),
    }
}
