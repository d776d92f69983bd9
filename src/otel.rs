// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Extracts the trace context a publisher propagated through the message
//! headers and opens a consumer span for processing the message.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Reads OpenTelemetry context from RabbitMQ message headers.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Gets a trace context value from RabbitMQ message headers.
    ///
    /// Only long-string headers holding valid UTF-8 are readable.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Creates a consumer span for one delivery.
///
/// Returns the context extracted from the headers together with the new span,
/// which is a child of that context.
pub fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let headers = props.headers().clone().unwrap_or_default();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(headers.inner()))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
