//! # jetstream-core
//!
//! Durable messaging client core backed by NATS JetStream.
//!
//! This library provides:
//! - **Connection manager** opening the transport with token or
//!   username/password credentials, optional connection statistics hooks and
//!   a drained, idempotent close.
//! - **Stream provisioner** with composable stream policies and subject
//!   namespacing under the stream name.
//! - **Health monitor** probing liveness on an interval and reporting it to an
//!   availability gauge and an injected health checker.
//! - **Publish pipeline** with synchronous and pipelined acknowledged publish.
//! - **Subscribe pipeline** over durable pull consumers: batch fetch, a
//!   cancellable sync loop and background async dispatch.
//! - **Metrics and tracing bridge**: delivery/processing latency histograms
//!   and trace-context propagation through message headers.
//!
//! ## Design Principles
//!
//! - Configuration is resolved once at build time and immutable afterwards.
//! - Metrics are registered against a registry owned by the caller.
//! - Async handler failures are logged, never propagated: dispatch has no
//!   caller frame to return them to.
//! - Final ack/nak stays with the handler; the core only extends the ack
//!   window of messages it is dispatching.

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lease;
pub mod message;
pub mod metrics;
pub mod publish;
pub mod stream;
pub mod subscribe;
pub mod trace;

// Re-export key types for convenient access
pub use client::Connection;
pub use config::{ClientConfig, ClientConfigBuilder, Credentials, HealthPolicy};
pub use error::{ClientError, ClientResult};
pub use health::{HealthChecker, HealthMonitor, HealthStatus, LivenessProbe, StatusCell};
pub use lease::AckLease;
pub use message::{Message, MessageAttributes, Metadata};
pub use metrics::{ClientMetrics, ProcessingTimer};
pub use publish::{AckFuture, PublishAck};
pub use stream::{DiscardPolicy, RetentionPolicy, StorageType, StreamSpec, namespace_subject};
pub use subscribe::{AsyncSubscription, MessageHandler, PullSubscription};
