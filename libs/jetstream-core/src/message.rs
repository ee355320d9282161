//! Message envelope helpers: broker metadata and span attributes.

use std::{collections::BTreeMap, time::SystemTime};

use async_nats::HeaderMap;
use async_nats::jetstream::message::Info;
use serde_json::json;

use crate::metrics::system_time_from_unix_nanos;

/// A JetStream message as delivered to handlers. Final acknowledgement
/// (`ack`, `ack_with`) is a capability of the message itself.
pub use async_nats::jetstream::Message;

/// Broker-assigned metadata of a received message, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub stream: String,
    pub consumer: String,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
    pub delivered: i64,
    pub pending: u64,
    /// When the broker stored the message.
    pub timestamp: Option<SystemTime>,
}

impl Metadata {
    /// Metadata of a JetStream message, if it carries any.
    pub fn of(message: &Message) -> Option<Self> {
        message.info().ok().map(|info| Self::from_info(&info))
    }

    pub(crate) fn from_info(info: &Info<'_>) -> Self {
        Self {
            stream: info.stream.to_owned(),
            consumer: info.consumer.to_owned(),
            stream_sequence: info.stream_sequence,
            consumer_sequence: info.consumer_sequence,
            delivered: info.delivered,
            pending: info.pending,
            timestamp: system_time_from_unix_nanos(info.published.unix_timestamp_nanos()),
        }
    }

    fn to_json(&self) -> String {
        let timestamp_ms = self
            .timestamp
            .and_then(|ts| ts.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        json!({
            "stream": self.stream,
            "consumer": self.consumer,
            "stream_sequence": self.stream_sequence,
            "consumer_sequence": self.consumer_sequence,
            "delivered": self.delivered,
            "pending": self.pending,
            "timestamp_ms": timestamp_ms,
        })
        .to_string()
    }
}

/// Make sure the message has a header map so trace extraction and handlers
/// never see `None`.
pub fn ensure_headers(message: &mut async_nats::Message) -> &HeaderMap {
    message.headers.get_or_insert_with(HeaderMap::new)
}

/// Render headers as a JSON object of name to value list.
pub fn headers_json(headers: Option<&HeaderMap>) -> String {
    let map = headers
        .map(|headers| {
            headers
                .iter()
                .map(|(name, values)| {
                    let name: &str = name.as_ref();
                    (
                        name.to_owned(),
                        values.iter().map(|v| v.as_str().to_owned()).collect::<Vec<_>>(),
                    )
                })
                .collect::<BTreeMap<_, _>>()
        })
        .unwrap_or_default();
    serde_json::to_string(&map).unwrap_or_default()
}

/// Attributes attached to a span when processing of a message fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttributes {
    pub subject: String,
    pub payload: String,
    pub reply: String,
    pub headers: String,
    pub metadata: String,
}

impl MessageAttributes {
    /// Collect attributes from the core message and optional broker metadata.
    pub fn collect(message: &async_nats::Message, metadata: Option<&Metadata>) -> Self {
        Self {
            subject: message.subject.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            reply: message
                .reply
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default(),
            headers: headers_json(message.headers.as_ref()),
            metadata: metadata.map(Metadata::to_json).unwrap_or_default(),
        }
    }

    /// Record onto a span declared with the `messaging.*` fields.
    pub fn record(&self, span: &tracing::Span) {
        span.record("messaging.payload", self.payload.as_str());
        span.record("messaging.reply", self.reply.as_str());
        span.record("messaging.headers", self.headers.as_str());
        span.record("messaging.metadata", self.metadata.as_str());
    }
}
