// each test binary uses a different subset of these helpers
#![allow(dead_code)]

pub mod broker;

use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use jetstream_core::{ClientConfig, ClientMetrics, Connection, StreamSpec};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";

static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Server under test, overridable with `NATS_URL`.
pub fn nats_url() -> String {
    env::var("NATS_URL").unwrap_or_else(|_| DEFAULT_NATS_URL.to_owned())
}

/// Name unique to this test run, so repeated runs never share streams.
pub fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{nanos}_{n}")
}

pub struct TestEnv {
    pub conn: Connection,
    pub registry: Registry,
    pub token: CancellationToken,
}

impl TestEnv {
    pub async fn connect(consumer_id: &str) -> Self {
        let config = ClientConfig::builder([nats_url()], consumer_id)
            .connect_timeout(Duration::from_secs(2))
            .fetch_max_wait(Duration::from_secs(1))
            .interval_check(Duration::from_millis(100))
            .build()
            .expect("valid config");
        Self::connect_with(config).await
    }

    pub async fn connect_with(config: ClientConfig) -> Self {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).expect("register metrics");
        let token = CancellationToken::new();
        let conn = Connection::connect(config, metrics, token.clone())
            .await
            .expect("connect to nats-server");
        Self {
            conn,
            registry,
            token,
        }
    }

    /// Provision a fresh stream with a single subject and return the
    /// namespaced subject.
    pub async fn stream(&self, name: &str, subject: &str) -> String {
        self.conn
            .create_stream(StreamSpec::new(name).subjects([subject]))
            .await
            .expect("create stream");
        format!("{name}.{subject}")
    }
}

pub fn shared<T>(value: T) -> Arc<parking_lot::Mutex<T>> {
    Arc::new(parking_lot::Mutex::new(value))
}
