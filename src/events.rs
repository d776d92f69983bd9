// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Events
//!
//! Everything the broker tells us about the consumer or the connection arrives
//! as a `LifecycleEvent` on a single queue owned by the host. Each session gets
//! its own queue, so events from a torn down session are never observed by the
//! next one.

use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<LifecycleEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<LifecycleEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The broker accepted the consumer registration.
    Registered { consumer_tag: String },
    /// The first delivery reached the consumer.
    Consuming { consumer_tag: String },
    /// The consumer was cancelled at our request.
    Unregistered { consumer_tag: String },
    /// The broker cancelled the consumer (queue deleted, node failover).
    Cancelled { consumer_tag: String },
    /// The consumer's channel failed underneath it.
    Shutdown { consumer_tag: String, reason: String },
    /// The connection reported an error and is going away.
    ConnectionShutdown { reason: String },
}

impl LifecycleEvent {
    /// Whether the event means the current session can no longer consume.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::Cancelled { .. }
                | LifecycleEvent::Shutdown { .. }
                | LifecycleEvent::ConnectionShutdown { .. }
        )
    }

    pub fn reason(&self) -> String {
        match self {
            LifecycleEvent::Registered { consumer_tag } => {
                format!("consumer {consumer_tag} registered")
            }
            LifecycleEvent::Consuming { consumer_tag } => {
                format!("consumer {consumer_tag} consuming")
            }
            LifecycleEvent::Unregistered { consumer_tag } => {
                format!("consumer {consumer_tag} unregistered")
            }
            LifecycleEvent::Cancelled { consumer_tag } => {
                format!("consumer {consumer_tag} cancelled by broker")
            }
            LifecycleEvent::Shutdown { reason, .. } => reason.clone(),
            LifecycleEvent::ConnectionShutdown { reason } => reason.clone(),
        }
    }
}
