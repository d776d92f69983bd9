// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the broker traits for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{types::FieldTable, BasicProperties};
use rabbitmq_consumer::{
    broker::{check_token, BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream},
    config::ConnectionConfig,
    delivery::{AckToken, Delivery},
    errors::AmqpError,
    events::{EventSender, LifecycleEvent},
    exchange::ExchangeDefinition,
    handler::{Disposition, IncomingMessage, MessageHandler},
    queue::{QueueBinding, QueueDefinition},
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

static EPOCH: AtomicU64 = AtomicU64::new(1_000);

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct ConsumerSlot {
    epoch: u64,
    queue: String,
    tag: String,
    tx: DeliverySender,
}

struct ChannelState {
    connection: usize,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
    open: bool,
}

struct ConnectionState {
    open: bool,
    events: EventSender,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, (QueueDefinition, String)>,
    bindings: Vec<QueueBinding>,
    messages: HashMap<String, VecDeque<Message>>,
    consumers: Vec<ConsumerSlot>,
    channels: HashMap<u64, ChannelState>,
    connections: Vec<ConnectionState>,
    acks: Vec<Vec<u8>>,
    rejects: Vec<(Vec<u8>, bool)>,
    deliveries: usize,
    ops: Vec<String>,
    max_outstanding: usize,
    fail_next_connects: usize,
    unresponsive: bool,
}

impl State {
    fn requeue_channel(&mut self, epoch: u64) {
        let Some(channel) = self.channels.get_mut(&epoch) else {
            return;
        };
        let unacked = std::mem::take(&mut channel.unacked);
        for (_, (queue, mut msg)) in unacked.into_iter().rev() {
            msg.redelivered = true;
            self.messages.entry(queue).or_default().push_front(msg);
        }
    }

    /// Pushes ready messages to consumers while their channel has prefetch room.
    fn pump(&mut self) {
        let State {
            consumers,
            channels,
            messages,
            max_outstanding,
            deliveries,
            ..
        } = self;

        consumers.retain(|slot| !slot.tx.is_closed());

        for slot in consumers.iter() {
            let Some(channel) = channels.get_mut(&slot.epoch) else {
                continue;
            };
            if !channel.open {
                continue;
            }

            loop {
                let limit = channel.prefetch as usize;
                if limit != 0 && channel.unacked.len() >= limit {
                    break;
                }
                let Some(msg) = messages.get_mut(&slot.queue).and_then(|q| q.pop_front()) else {
                    break;
                };

                channel.next_tag += 1;
                let tag = channel.next_tag;
                let delivery = Delivery {
                    token: AckToken::new(slot.epoch, tag),
                    exchange: "demo.exchange".to_owned(),
                    routing_key: slot.queue.clone(),
                    redelivered: msg.redelivered,
                    properties: BasicProperties::default(),
                    payload: msg.payload.clone(),
                };

                if slot.tx.send(Ok(delivery)).is_err() {
                    messages.entry(slot.queue.clone()).or_default().push_front(msg);
                    break;
                }

                channel.unacked.insert(tag, (slot.queue.clone(), msg));
                *deliveries += 1;
                let outstanding = channel.unacked.len();
                if outstanding > *max_outstanding {
                    *max_outstanding = outstanding;
                }
            }
        }
    }
}

/// Shared handle on the in-memory broker.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        FakeBroker::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    /// Opens a connection and channel directly, bypassing the host.
    pub async fn open_channel(
        &self,
        events: EventSender,
    ) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let connection = self
            .connector()
            .open(&ConnectionConfig::default(), events)
            .await
            .unwrap();
        let channel = connection.open_channel().await.unwrap();
        (connection, channel)
    }

    pub fn publish(&self, queue: &str, payload: &[u8]) {
        let mut state = self.lock();
        state
            .messages
            .entry(queue.to_owned())
            .or_default()
            .push_back(Message {
                payload: payload.to_vec(),
                redelivered: false,
            });
        state.pump();
    }

    /// Drops every open connection as if the network went away.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.ops.push("connection.dropped".to_owned());

        let epochs: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.open && state.connections[ch.connection].open)
            .map(|(epoch, _)| *epoch)
            .collect();

        for epoch in epochs {
            state.requeue_channel(epoch);
            if let Some(channel) = state.channels.get_mut(&epoch) {
                channel.open = false;
            }
            for slot in state.consumers.iter().filter(|s| s.epoch == epoch) {
                let _ = slot
                    .tx
                    .send(Err(AmqpError::ChannelError("connection reset by peer".to_owned())));
            }
            state.consumers.retain(|s| s.epoch != epoch);
        }

        for conn in state.connections.iter_mut().filter(|c| c.open) {
            conn.open = false;
            let _ = conn.events.send(LifecycleEvent::ConnectionShutdown {
                reason: "connection reset by peer".to_owned(),
            });
        }
    }

    /// Makes every later consumer cancel and close call wait forever, like a
    /// broker behind a half-open link.
    pub fn stop_answering(&self) {
        self.lock().unresponsive = true;
    }

    /// Cancels every consumer on `queue` from the broker side.
    pub fn cancel_consumers(&self, queue: &str) {
        let mut state = self.lock();
        state.ops.push("broker.cancel".to_owned());
        state.consumers.retain(|slot| slot.queue != queue);
    }

    async fn hang_if_unresponsive(&self) {
        let unresponsive = self.lock().unresponsive;
        if unresponsive {
            std::future::pending::<()>().await;
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.lock().fail_next_connects = count;
    }

    pub fn acks(&self) -> Vec<Vec<u8>> {
        self.lock().acks.clone()
    }

    pub fn rejects(&self) -> Vec<(Vec<u8>, bool)> {
        self.lock().rejects.clone()
    }

    pub fn deliveries(&self) -> usize {
        self.lock().deliveries
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().messages.get(queue).map_or(0, |q| q.len())
    }

    pub fn unacked(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn count_op(&self, op: &str) -> usize {
        self.lock().ops.iter().filter(|o| o.as_str() == op).count()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.iter().filter(|c| c.open).count()
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.lock().bindings.clone()
    }
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn open(
        &self,
        cfg: &ConnectionConfig,
        events: EventSender,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.broker.lock();
        state.ops.push("connection.open".to_owned());

        if state.fail_next_connects > 0 {
            state.fail_next_connects -= 1;
            return Err(AmqpError::ConnectionError {
                host: cfg.host.clone(),
                port: cfg.port,
                reason: "connection refused".to_owned(),
            });
        }

        state.connections.push(ConnectionState { open: true, events });
        let id = state.connections.len() - 1;

        Ok(Arc::new(FakeConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct FakeConnection {
    broker: FakeBroker,
    id: usize,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections[self.id].open {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let epoch = EPOCH.fetch_add(1, Ordering::SeqCst);
        state.channels.insert(
            epoch,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                open: true,
            },
        );
        state.ops.push("channel.open".to_owned());

        Ok(Arc::new(FakeChannel {
            broker: self.broker.clone(),
            epoch,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.hang_if_unresponsive().await;
        let mut state = self.broker.lock();
        state.ops.push("connection.close".to_owned());

        if !state.connections[self.id].open {
            return Ok(());
        }
        state.connections[self.id].open = false;

        let epochs: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, ch)| ch.connection == self.id && ch.open)
            .map(|(epoch, _)| *epoch)
            .collect();
        for epoch in epochs {
            state.requeue_channel(epoch);
            if let Some(channel) = state.channels.get_mut(&epoch) {
                channel.open = false;
            }
            state.consumers.retain(|s| s.epoch != epoch);
        }
        state.pump();

        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    epoch: u64,
}

impl FakeChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, State>, AmqpError> {
        let state = self.broker.lock();
        let open = state.channels.get(&self.epoch).is_some_and(|ch| ch.open);
        if !open {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn epoch(&self) -> u64 {
        self.epoch
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.ops.push(format!("basic.qos {prefetch}"));
        if let Some(channel) = state.channels.get_mut(&self.epoch) {
            channel.prefetch = prefetch;
        }
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.ops.push("exchange.declare".to_owned());

        match state.exchanges.get(def.name()) {
            Some(existing) if existing != def => Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                def.name()
            ))),
            _ => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        def: &QueueDefinition,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.ops.push("queue.declare".to_owned());

        let declared = (def.clone(), format!("{:?}", args));
        match state.queues.get(def.name()) {
            Some(existing) if *existing != declared => Err(AmqpError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                def.name()
            ))),
            _ => {
                state.queues.insert(def.name().to_owned(), declared);
                state.messages.entry(def.name().to_owned()).or_default();
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.ops.push("queue.bind".to_owned());

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ChannelError(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        }
        state.ops.push("basic.consume".to_owned());

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerSlot {
            epoch: self.epoch,
            queue: queue.to_owned(),
            tag: consumer_tag.to_owned(),
            tx,
        });
        state.pump();

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, token: AckToken) -> Result<(), AmqpError> {
        check_token(self.epoch, &token)?;
        let mut state = self.open_state()?;

        let removed = state
            .channels
            .get_mut(&self.epoch)
            .and_then(|ch| ch.unacked.remove(&token.delivery_tag()));
        let Some((_, msg)) = removed else {
            return Err(AmqpError::AckMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                token.delivery_tag()
            )));
        };

        state.acks.push(msg.payload);
        state.pump();
        Ok(())
    }

    async fn basic_reject(&self, token: AckToken, requeue: bool) -> Result<(), AmqpError> {
        check_token(self.epoch, &token)?;
        let mut state = self.open_state()?;

        let removed = state
            .channels
            .get_mut(&self.epoch)
            .and_then(|ch| ch.unacked.remove(&token.delivery_tag()));
        let Some((queue, mut msg)) = removed else {
            return Err(AmqpError::RejectMessageError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                token.delivery_tag()
            )));
        };

        state.rejects.push((msg.payload.clone(), requeue));
        if requeue {
            msg.redelivered = true;
            state.messages.entry(queue).or_default().push_front(msg);
        }
        state.pump();
        Ok(())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.broker.hang_if_unresponsive().await;
        let mut state = self.open_state()?;
        state.ops.push("basic.cancel".to_owned());
        state.consumers.retain(|s| s.tag != consumer_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.hang_if_unresponsive().await;
        let mut state = self.broker.lock();
        state.ops.push("channel.close".to_owned());

        let open = state.channels.get(&self.epoch).is_some_and(|ch| ch.open);
        if !open {
            return Ok(());
        }

        state.requeue_channel(self.epoch);
        if let Some(channel) = state.channels.get_mut(&self.epoch) {
            channel.open = false;
        }
        state.consumers.retain(|s| s.epoch != self.epoch);
        state.pump();
        Ok(())
    }
}

/// Records payloads, sleeps, then answers with a fixed disposition.
pub struct RecordingHandler {
    pub seen: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    delay: Duration,
    disposition: Box<dyn Fn(&[u8], bool) -> Disposition + Send + Sync>,
}

impl RecordingHandler {
    pub fn new<F>(delay: Duration, disposition: F) -> Self
    where
        F: Fn(&[u8], bool) -> Disposition + Send + Sync + 'static,
    {
        RecordingHandler {
            seen: Arc::default(),
            delay,
            disposition: Box::new(disposition),
        }
    }

    pub fn acking() -> Self {
        RecordingHandler::new(Duration::ZERO, |_, _| Disposition::Ack)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, msg: &IncomingMessage<'_>) -> Disposition {
        self.seen
            .lock()
            .unwrap()
            .push((msg.payload.to_vec(), msg.redelivered));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.disposition)(msg.payload, msg.redelivered)
    }
}

/// Blocks inside `handle` until released, announcing each start.
pub struct GatedHandler {
    pub started: mpsc::UnboundedSender<Vec<u8>>,
    pub release: Arc<Notify>,
}

#[async_trait]
impl MessageHandler for GatedHandler {
    async fn handle(&self, msg: &IncomingMessage<'_>) -> Disposition {
        let _ = self.started.send(msg.payload.to_vec());
        self.release.notified().await;
        Disposition::Ack
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
