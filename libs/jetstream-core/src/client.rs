//! Connection manager: transport lifecycle and the derived JetStream context.
//!
//! Wraps `async-nats` to open the connection with the resolved credential,
//! optionally log connection statistics on connection events, verify that
//! JetStream is reachable and start the [`HealthMonitor`]. After
//! construction the client handle and JetStream context are shared read-only
//! by every pipeline.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_nats::{ConnectOptions, Event, jetstream};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, Credentials};
use crate::error::{ClientError, ClientResult};
use crate::health::{HealthMonitor, HealthStatus, StatusCell};
use crate::metrics::ClientMetrics;

/// Base delay for retrying initial NATS connections.
const CONNECT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for retry backoff during initial NATS connect.
const MAX_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(30);

/// A live broker connection and its JetStream context.
///
/// Cheap to clone; clones share the connection, the ack tracker and the
/// shutdown token.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    config: ClientConfig,
    client: async_nats::Client,
    jetstream: jetstream::Context,
    metrics: ClientMetrics,
    /// Outstanding async publish acknowledgements.
    acks: TaskTracker,
    /// Cancels the health monitor and async dispatch tasks.
    shutdown: CancellationToken,
    health: StatusCell,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Connection {
    /// Open the transport, derive the JetStream context and start the health
    /// monitor. The monitor lives until `token` is cancelled or the connection
    /// is closed.
    pub async fn connect(
        config: ClientConfig,
        metrics: ClientMetrics,
        token: CancellationToken,
    ) -> ClientResult<Self> {
        info!(
            servers = ?config.servers(),
            consumer_id = config.consumer_id(),
            credentials = ?config.credentials(),
            "connecting to NATS"
        );

        let client = connect_with_retry(&config).await?;

        let jetstream = jetstream::new(client.clone());
        jetstream.query_account().await.map_err(|e| {
            ClientError::Connection(format!("derive JetStream context: {e}"))
        })?;

        let shutdown = token.child_token();
        let monitor = HealthMonitor::new(
            client.clone(),
            config.health().checker.clone(),
            config.health().name.clone(),
            config.health().interval,
            metrics.availability(&config.endpoint(), config.consumer_id()),
        );
        let health = monitor.status();
        let handle = monitor.spawn(shutdown.clone());

        info!(endpoint = %config.endpoint(), "NATS connection established");
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                config,
                client,
                jetstream,
                metrics,
                acks: TaskTracker::new(),
                shutdown,
                health,
                monitor: parking_lot::Mutex::new(Some(handle)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// JetStream context derived from the connection.
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.inner.jetstream
    }

    /// Underlying core NATS client.
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.inner.client
    }

    pub fn metrics(&self) -> &ClientMetrics {
        &self.inner.metrics
    }

    /// Native liveness flag of the transport. Always false once closed.
    pub fn is_connected(&self) -> bool {
        !self.is_closed()
            && matches!(
                self.inner.client.connection_state(),
                async_nats::connection::State::Connected
            )
    }

    /// Status last reported by the health monitor.
    pub fn health_status(&self) -> HealthStatus {
        self.inner.health.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn acks(&self) -> &TaskTracker {
        &self.inner.acks
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub(crate) fn ensure_open(&self, op: &str) -> ClientResult<()> {
        if self.is_closed() {
            return Err(ClientError::Connection(format!("{op}: connection closed")));
        }
        Ok(())
    }

    /// Drain outstanding async acknowledgements, flush and close.
    ///
    /// Idempotent: closing an already-closed connection returns `Ok`.
    pub async fn close(&self) -> ClientResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("NATS connection already closed");
            return Ok(());
        }

        self.inner.acks.close();
        self.inner.acks.wait().await;
        debug!("outstanding publish acknowledgements drained");

        if self.inner.config.debug() {
            self.log_consumers().await;
        }

        let flushed = self.inner.client.flush().await;

        self.inner.shutdown.cancel();
        let monitor = self.inner.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(err) = handle.await {
                warn!(?err, "health monitor task failed");
            }
        }

        if flushed.is_ok() {
            self.close_transport().await;
        }

        flushed.map_err(|e| ClientError::Connection(format!("flush: {e}")))?;
        info!("NATS connection closed");
        Ok(())
    }

    /// Drain the client and wait for its connection handler to drop the
    /// socket. A transport that is already gone is left alone.
    async fn close_transport(&self) {
        let client = &self.inner.client;
        let state = client.connection_state();
        if !matches!(state, async_nats::connection::State::Connected) {
            debug!(?state, "NATS transport not connected, skipping drain");
            return;
        }
        if let Err(err) = client.drain().await {
            debug!(error = %err, "NATS transport already closed");
            return;
        }

        // The handler only exits on the wakeup after the drain command, so
        // keep it busy until it stops accepting commands.
        let handler_exited = async {
            while client.flush().await.is_ok() {
                tokio::task::yield_now().await;
            }
        };
        let timeout = self.inner.config.connect_timeout();
        if tokio::time::timeout(timeout, handler_exited).await.is_err() {
            warn!(?timeout, "NATS transport did not close in time");
        } else {
            debug!("NATS transport closed");
        }
    }

    /// Diagnostic listing of every consumer of every stream, bounded by the
    /// configured listing timeout.
    async fn log_consumers(&self) {
        let timeout = self.inner.config.close_listing_timeout();
        let listing = async {
            let mut names = self.inner.jetstream.stream_names();
            while let Some(stream) = names.next().await {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!(error = %err, "list streams failed");
                        return;
                    }
                };
                let Ok(handle) = self.inner.jetstream.get_stream(&stream).await else {
                    continue;
                };
                let mut consumers = handle.consumer_names();
                while let Some(Ok(consumer)) = consumers.next().await {
                    debug!(stream = %stream, consumer = %consumer, "consumer present at close");
                }
            }
        };
        if tokio::time::timeout(timeout, listing).await.is_err() {
            debug!(?timeout, "consumer listing timed out");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.inner.config)
            .field("health", &self.inner.health.get())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Build connect options from the config, applying the resolved credential
/// and, in debug mode, the connection event hooks.
fn build_connect_options(
    config: &ClientConfig,
    hook_client: Arc<OnceLock<async_nats::Client>>,
) -> ConnectOptions {
    let mut opts = match config.credentials() {
        Credentials::Token(token) => ConnectOptions::with_token(token.clone()),
        Credentials::UserPassword { username, password } => {
            ConnectOptions::with_user_and_password(username.clone(), password.clone())
        }
        Credentials::Anonymous => ConnectOptions::new(),
    };

    if config.debug() {
        opts = opts.event_callback(move |event| {
            let client = hook_client.clone();
            async move { log_connection_event(client.get(), &event) }
        });
    }

    opts.connection_timeout(config.connect_timeout())
}

/// Open the transport, retrying with exponential backoff.
async fn connect_with_retry(config: &ClientConfig) -> ClientResult<async_nats::Client> {
    let total_attempts = config.connect_retry_max().saturating_add(1);
    for attempt in 0..total_attempts {
        let hook_client = Arc::new(OnceLock::new());
        let opts = build_connect_options(config, hook_client.clone());

        match opts.connect(config.servers().to_vec()).await {
            Ok(client) => {
                let _ = hook_client.set(client.clone());
                debug!(attempt = attempt + 1, total_attempts, "NATS transport open");
                return Ok(client);
            }
            Err(err) => {
                let attempt_num = attempt + 1;
                if attempt_num >= total_attempts {
                    error!(
                        attempts = total_attempts,
                        error = %err,
                        "NATS connection failed after all retry attempts"
                    );
                    return Err(ClientError::Connection(format!(
                        "connect failed after {total_attempts} attempt(s): {err}"
                    )));
                }

                let delay = CONNECT_RETRY_BASE_DELAY
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(MAX_CONNECT_RETRY_DELAY);
                warn!(
                    attempt = attempt_num,
                    total_attempts,
                    retry_in_ms = delay.as_millis(),
                    error = %err,
                    "NATS connection attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(ClientError::Connection("connect: no attempts made".into()))
}

/// Log a connection event together with the connection statistics.
fn log_connection_event(client: Option<&async_nats::Client>, event: &Event) {
    let message = match event {
        Event::Closed => "NATS closed callback",
        Event::Connected => "NATS reconnected callback",
        Event::Disconnected => "NATS disconnected callback",
        Event::ServerError(_) | Event::ClientError(_) | Event::SlowConsumer(_) => {
            "NATS async error callback"
        }
        _ => "NATS connection event",
    };

    let Some(client) = client else {
        info!(%event, "{message}");
        return;
    };

    let stats = client.statistics();
    let connects = stats.connects.load(Ordering::Relaxed);
    let last_error = match event {
        Event::ServerError(err) => Some(err.to_string()),
        Event::ClientError(err) => Some(err.to_string()),
        _ => None,
    };
    info!(
        status = ?client.connection_state(),
        stats.reconnects = connects.saturating_sub(1),
        stats.in_messages = stats.in_messages.load(Ordering::Relaxed),
        stats.out_messages = stats.out_messages.load(Ordering::Relaxed),
        stats.in_bytes = stats.in_bytes.load(Ordering::Relaxed),
        stats.out_bytes = stats.out_bytes.load(Ordering::Relaxed),
        error = last_error.as_deref(),
        %event,
        "{message}"
    );
}
