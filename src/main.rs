// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Runs a single topic consumer until interrupted.

use clap::Parser;
use rabbitmq_consumer::{
    channel::LapinConnector,
    config::{ConnectionConfig, ReconnectPolicy},
    handler::LoggingHandler,
    host::LifecycleHost,
    topology::TopologySpec,
};
use std::{process::ExitCode, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "rabbitmq-consumer",
    about = "Consumes and logs messages from a RabbitMQ topic queue"
)]
struct Args {
    #[arg(long, env = "RABBITMQ_HOST", default_value = "localhost")]
    host: String,

    #[arg(long, env = "RABBITMQ_PORT", default_value_t = 5672)]
    port: u16,

    #[arg(long, env = "RABBITMQ_USER", default_value = "guest")]
    user: String,

    #[arg(long, env = "RABBITMQ_PASSWORD", default_value = "guest", hide_env_values = true)]
    password: String,

    #[arg(long, env = "RABBITMQ_VHOST", default_value = "/")]
    vhost: String,

    #[arg(long, env = "RABBITMQ_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    connect_timeout_secs: u64,

    #[arg(long, env = "RABBITMQ_EXCHANGE", default_value = "demo.exchange")]
    exchange: String,

    #[arg(long, env = "RABBITMQ_QUEUE", default_value = "demo.queue.log")]
    queue: String,

    #[arg(long, env = "RABBITMQ_ROUTING_KEY", default_value = "demo.queue.*")]
    routing_key: String,

    #[arg(long, env = "RABBITMQ_PREFETCH", default_value_t = 1)]
    prefetch: u16,

    /// Re-establish the session when the broker drops it
    #[arg(long, env = "RABBITMQ_RECONNECT", default_value_t = true, action = clap::ArgAction::Set)]
    reconnect: bool,

    #[arg(long, env = "RABBITMQ_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,
}

impl Args {
    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig::new(&self.host, self.port, &self.user, &self.password)
            .vhost(&self.vhost)
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    fn topology(&self) -> TopologySpec {
        TopologySpec::new(&self.exchange, &self.queue, &self.routing_key).prefetch(self.prefetch)
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        let policy = ReconnectPolicy::default().max_retries(self.max_retries);
        if self.reconnect {
            policy
        } else {
            ReconnectPolicy::disabled()
        }
    }
}

/// `RUST_LOG` filters (default `info`), `LOG_FORMAT=json` switches to JSON lines.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args = Args::parse();
    let config = args.connection();
    info!(config = ?config, "starting consumer");

    let host = LifecycleHost::new(
        Arc::new(LapinConnector),
        config,
        args.topology(),
        Arc::new(LoggingHandler),
    )
    .reconnect(args.reconnect_policy());

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = err.to_string(), "failure to listen for shutdown signal");
            return;
        }
        info!("shutdown signal received");
        signal.cancel();
    });

    match host.run(shutdown).await {
        Ok(()) => {
            info!("consumer stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), "consumer failed");
            ExitCode::FAILURE
        }
    }
}
