//! Trace-context propagation through NATS message headers.
//!
//! Outgoing messages carry the active context injected by the global
//! text-map propagator; incoming messages have it extracted and set as the
//! parent of the per-message span.

use async_nats::HeaderMap;
use opentelemetry::{
    Context,
    propagation::{Extractor, Injector},
};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Writes propagation fields into a NATS [`HeaderMap`].
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

/// Reads propagation fields from a NATS [`HeaderMap`].
pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .iter()
            .map(|(name, _)| -> &str { name.as_ref() })
            .collect()
    }
}

/// Inject `cx` into `headers` with the globally installed propagator.
pub fn inject_context(cx: &Context, headers: &mut HeaderMap) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(headers));
    });
}

/// Inject the context of the current `tracing` span.
pub fn inject_current(headers: &mut HeaderMap) {
    let cx = tracing::Span::current().context();
    inject_context(&cx, headers);
}

/// Extract a remote context from `headers` with the global propagator.
pub fn extract_context(headers: &HeaderMap) -> Context {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor(headers))
    })
}

/// Parent `span` on the context carried by `headers`.
pub fn continue_from(span: &tracing::Span, headers: &HeaderMap) {
    span.set_parent(extract_context(headers));
}
