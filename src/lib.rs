// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod host;
pub mod queue;
pub mod topology;
