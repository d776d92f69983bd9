// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module registers a manual-ack consumer on a queue and runs its
//! delivery loop. Deliveries are handled one at a time in arrival order: the
//! handler runs, then its disposition is sent back to the broker, and only
//! then is the next delivery taken from the stream. Together with the channel
//! prefetch this bounds the number of unacknowledged messages held by the
//! consumer.
//!
//! The loop runs on its own task, which is the only place that issues acks,
//! rejects and the consumer cancel on the channel. `ConsumerHandle::stop` only
//! signals the task and waits for it, so a stop request is observed at the
//! next delivery boundary and never interrupts a running handler.

use crate::{
    broker::{BrokerChannel, DeliveryStream},
    delivery::Delivery,
    errors::AmqpError,
    events::{EventSender, LifecycleEvent},
    handler::{Disposition, IncomingMessage, MessageHandler},
    otel,
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a consumer is in its lifecycle.
///
/// Unregistered → Registered → Consuming → Cancelled → ShutDown. A consumer
/// whose channel fails jumps straight to ShutDown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unregistered,
    Registered,
    Consuming,
    Cancelled,
    ShutDown,
}

/// Starts consumers.
pub struct ConsumerLoop {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    events: EventSender,
    cancel_timeout: Duration,
}

impl ConsumerLoop {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        events: EventSender,
    ) -> Self {
        ConsumerLoop {
            channel,
            queue: queue.to_owned(),
            handler,
            events,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
        }
    }

    /// Bounds how long the consumer cancel may wait on the broker when
    /// stopping. A running handler is always waited for in full.
    pub fn cancel_timeout(mut self, timeout: Duration) -> Self {
        self.cancel_timeout = timeout;
        self
    }

    /// Registers the consumer on the broker and spawns its delivery loop.
    ///
    /// The channel prefetch must already be configured.
    pub async fn start(self) -> Result<ConsumerHandle, AmqpError> {
        let consumer_tag = format!("{}-{}", self.queue, Uuid::new_v4());
        let (state_tx, state_rx) = watch::channel(ConsumerState::Unregistered);

        debug!(queue = self.queue.as_str(), "registering consumer...");

        let stream = match self.channel.basic_consume(&self.queue, &consumer_tag).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = self.queue.as_str(),
                    "error to create the consumer"
                );
                Err(AmqpError::ConsumerDeclarationError {
                    queue: self.queue.clone(),
                    reason: err.to_string(),
                })
            }
            Ok(s) => Ok(s),
        }?;

        state_tx.send_replace(ConsumerState::Registered);
        let _ = self.events.send(LifecycleEvent::Registered {
            consumer_tag: consumer_tag.clone(),
        });
        info!(
            queue = self.queue.as_str(),
            consumer_tag = consumer_tag.as_str(),
            "consumer registered"
        );

        let state_tx = Arc::new(state_tx);
        let (stop_tx, stop_rx) = watch::channel(false);

        let delivery_loop = DeliveryLoop {
            channel: self.channel,
            handler: self.handler,
            events: self.events,
            consumer_tag: consumer_tag.clone(),
            state: state_tx.clone(),
            cancel_timeout: self.cancel_timeout,
            tracer: global::tracer("amqp consumer"),
        };
        let task = tokio::spawn(delivery_loop.run(stream, stop_rx));

        Ok(ConsumerHandle {
            consumer_tag,
            state_tx,
            state_rx,
            stop_tx,
            task: Some(task),
        })
    }
}

/// Control handle of a running consumer, owned by the host.
pub struct ConsumerHandle {
    consumer_tag: String,
    state_tx: Arc<watch::Sender<ConsumerState>>,
    state_rx: watch::Receiver<ConsumerState>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn state(&self) -> ConsumerState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.state_rx.clone()
    }

    /// Stops accepting deliveries.
    ///
    /// Returns once the handler in progress, if any, finished and its
    /// disposition reached the broker, and the consumer was cancelled.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<(), AmqpError> {
        self.stop_tx.send_replace(true);

        let Some(task) = self.task.take() else {
            return Ok(());
        };

        task.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failure");
            AmqpError::InternalError(err.to_string())
        })
    }

    /// Records that the consumer's channel was closed by the host.
    pub fn mark_shut_down(&self) {
        self.state_tx.send_replace(ConsumerState::ShutDown);
    }
}

enum Step {
    Stop,
    Next(Option<Result<Delivery, AmqpError>>),
}

struct DeliveryLoop {
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn MessageHandler>,
    events: EventSender,
    consumer_tag: String,
    state: Arc<watch::Sender<ConsumerState>>,
    cancel_timeout: Duration,
    tracer: BoxedTracer,
}

impl DeliveryLoop {
    async fn run(self, mut stream: DeliveryStream, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                self.cancel().await;
                return;
            }

            let step = tokio::select! {
                biased;
                _ = stop.changed() => Step::Stop,
                next = stream.next() => Step::Next(next),
            };

            match step {
                Step::Stop => {
                    self.cancel().await;
                    return;
                }

                Step::Next(Some(Ok(delivery))) => {
                    if *self.state.borrow() == ConsumerState::Registered {
                        self.state.send_replace(ConsumerState::Consuming);
                        self.emit(LifecycleEvent::Consuming {
                            consumer_tag: self.consumer_tag.clone(),
                        });
                    }

                    if let Err(err) = self.consume(&delivery).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }

                Step::Next(Some(Err(err))) => {
                    error!(
                        error = err.to_string(),
                        consumer_tag = self.consumer_tag.as_str(),
                        "consumer channel failure"
                    );
                    self.emit(LifecycleEvent::Shutdown {
                        consumer_tag: self.consumer_tag.clone(),
                        reason: err.to_string(),
                    });
                    self.state.send_replace(ConsumerState::ShutDown);
                    return;
                }

                Step::Next(None) => {
                    warn!(
                        consumer_tag = self.consumer_tag.as_str(),
                        "consumer cancelled by the broker"
                    );
                    self.emit(LifecycleEvent::Cancelled {
                        consumer_tag: self.consumer_tag.clone(),
                    });
                    self.state.send_replace(ConsumerState::Cancelled);
                    return;
                }
            }
        }
    }

    /// Runs the handler for one delivery and settles it with the broker.
    ///
    /// A panicking handler counts as a failed one: the message is rejected
    /// without requeue and the loop carries on.
    async fn consume(&self, delivery: &Delivery) -> Result<Disposition, AmqpError> {
        let (ctx, mut span) =
            otel::new_span(&delivery.properties, &self.tracer, &delivery.routing_key);

        debug!(
            "received: {} - exchange: {}",
            delivery.routing_key, delivery.exchange,
        );

        let msg = IncomingMessage {
            payload: &delivery.payload,
            exchange: &delivery.exchange,
            routing_key: &delivery.routing_key,
            redelivered: delivery.redelivered,
            ctx: &ctx,
        };

        let disposition = match AssertUnwindSafe(self.handler.handle(&msg))
            .catch_unwind()
            .await
        {
            Ok(disposition) => disposition,
            Err(panic) => {
                let err = AmqpError::HandlerError(panic_message(panic.as_ref()));
                error!(error = err.to_string(), "handler panicked");
                span.record_error(&err);
                Disposition::Reject { requeue: false }
            }
        };

        match disposition {
            Disposition::Ack => {
                debug!("message successfully processed");
                if let Err(e) = self.channel.basic_ack(delivery.token).await {
                    error!("error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    return Err(AmqpError::AckMessageError(e.to_string()));
                }
                span.set_status(Status::Ok);
            }

            Disposition::Reject { requeue } => {
                warn!(requeue, "error whiling handling msg, rejecting");
                if let Err(e) = self.channel.basic_reject(delivery.token, requeue).await {
                    error!("error whiling reject msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to reject msg"),
                    });
                    return Err(AmqpError::RejectMessageError(e.to_string()));
                }
                span.set_status(Status::Error {
                    description: Cow::from("message rejected by handler"),
                });
            }
        }

        Ok(disposition)
    }

    async fn cancel(&self) {
        debug!(consumer_tag = self.consumer_tag.as_str(), "cancelling consumer...");

        let cancel = self.channel.basic_cancel(&self.consumer_tag);
        match tokio::time::timeout(self.cancel_timeout, cancel).await {
            Ok(Ok(_)) => {
                self.emit(LifecycleEvent::Unregistered {
                    consumer_tag: self.consumer_tag.clone(),
                });
            }
            Ok(Err(err)) => {
                warn!(
                    error = err.to_string(),
                    consumer_tag = self.consumer_tag.as_str(),
                    "failure to cancel consumer"
                );
            }
            Err(_) => {
                warn!(
                    consumer_tag = self.consumer_tag.as_str(),
                    timeout_ms = self.cancel_timeout.as_millis() as u64,
                    "timed out cancelling consumer"
                );
            }
        }

        self.state.send_replace(ConsumerState::Cancelled);
    }

    fn emit(&self, event: LifecycleEvent) {
        if self.events.send(event).is_err() {
            debug!("lifecycle event dropped, nobody is listening");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    if let Some(msg) = panic.downcast_ref::<String>() {
        return msg.clone();
    }
    "handler panicked".to_owned()
}
