// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries the OpenTelemetry context from the publisher to the consumer inside
//! the AMQP message headers, using whatever text-map propagator the
//! application registered globally. Without a registered propagator both
//! sides are no-ops.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

const TRACER_NAME: &str = "amqp consumer";

struct HeaderInjector<'a>(&'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

struct HeaderExtractor<'a>(&'a BTreeMap<ShortString, AMQPValue>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0.get(&ShortString::from(key)) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("error decoding header value {:?}", e))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|key| key.as_str()).collect()
    }
}

/// Headers carrying the current trace context.
pub(crate) fn context_headers() -> FieldTable {
    let mut headers = BTreeMap::new();
    let ctx = Context::current();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector(&mut headers))
    });

    FieldTable::from(headers)
}

/// Context a delivery is handled in: the trace context found in its headers,
/// with a new consumer span named after the queue as the active span.
pub(crate) fn consumer_context(props: &BasicProperties, name: &str) -> Context {
    let parent = global::get_text_map_propagator(|propagator| extract_context(propagator, props));

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent);

    parent.with_span(span)
}

fn extract_context(propagator: &dyn TextMapPropagator, props: &BasicProperties) -> Context {
    let headers = props.headers().clone().unwrap_or_default();
    propagator.extract(&HeaderExtractor(headers.inner()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use opentelemetry::propagation::text_map_propagator::FieldIter;

    pub(crate) const TRACE_HEADER: &str = "x-trace";

    /// Value a [`HeaderPropagator`] puts in the extracted context.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) struct TraceTag(pub(crate) String);

    /// Propagates a plain [`TraceTag`] through the `x-trace` header.
    #[derive(Debug)]
    pub(crate) struct HeaderPropagator {
        fields: Vec<String>,
    }

    impl Default for HeaderPropagator {
        fn default() -> Self {
            HeaderPropagator {
                fields: vec![TRACE_HEADER.to_owned()],
            }
        }
    }

    impl TextMapPropagator for HeaderPropagator {
        fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
            if let Some(tag) = cx.get::<TraceTag>() {
                injector.set(TRACE_HEADER, tag.0.clone());
            }
        }

        fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
            match extractor.get(TRACE_HEADER) {
                Some(tag) => cx.with_value(TraceTag(tag.to_owned())),
                None => cx.clone(),
            }
        }

        fn fields(&self) -> FieldIter<'_> {
            FieldIter::new(&self.fields)
        }
    }

    #[test]
    fn injected_headers_are_extractable() {
        let mut headers = BTreeMap::new();
        HeaderInjector(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
        assert_eq!(extractor.get("missing"), None);
    }

    #[test]
    fn extracts_through_the_given_propagator() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(TRACE_HEADER),
            AMQPValue::LongString("trace-42".into()),
        );
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));

        let cx = extract_context(&HeaderPropagator::default(), &props);
        assert_eq!(cx.get::<TraceTag>(), Some(&TraceTag("trace-42".to_owned())));

        let cx = extract_context(&HeaderPropagator::default(), &BasicProperties::default());
        assert_eq!(cx.get::<TraceTag>(), None);
    }

    #[test]
    fn non_string_headers_are_ignored() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("retries"), AMQPValue::LongInt(2));

        assert_eq!(HeaderExtractor(&headers).get("retries"), None);
    }
}
