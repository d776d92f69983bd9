// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection and Reconnect Configuration
//!
//! Values in this module are supplied by whoever bootstraps the process and
//! never change afterwards. Both types deserialize with serde so they can be
//! embedded in a larger application configuration.

use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::{fmt, time::Duration};

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Broker address and credentials.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_name: String,
    /// Bound on the initial connect and on each teardown step, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            connection_name: "rabbitmq-consumer".to_owned(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        ConnectionConfig {
            host: host.to_owned(),
            port,
            user: user.to_owned(),
            password: password.to_owned(),
            ..Default::default()
        }
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Sets the connect timeout with millisecond precision.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Structured AMQP URI for this configuration.
    ///
    /// Credentials and vhost are carried as-is, never spliced into a URI
    /// string, so `/`, `#`, `?` or `%` in them need no escaping.
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..AMQPUri::default()
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("connection_name", &self.connection_name)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .finish()
    }
}

/// How the host re-establishes a session after the broker drops it.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects: the host only records the shutdown.
    pub fn disabled() -> Self {
        ReconnectPolicy {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    /// Delay before the given 1-based attempt, doubling from the initial
    /// backoff and capped at the max backoff.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(2_u64.saturating_pow(exp))
            .min(self.max_backoff_ms);

        Duration::from_millis(millis)
    }
}
