//! # Healthcheck & API
//!
//! This crate provides http api's for healthcheck, dependency status and metrics
//! It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /dependencies
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity, clippy::too_many_arguments)]

use std::{net::SocketAddr, time::Instant};

use anyhow::Result;
use axum::{Router, extract::Extension, routing};
use prometheus::{IntGauge, Registry};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, trace};

pub use crate::models::{Dependencies, Health, State};

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Process uptime exported alongside the client metrics.
#[derive(Debug, Clone)]
struct Uptime {
    started: Instant,
    gauge: IntGauge,
}

impl Uptime {
    fn refresh(&self) {
        self.gauge.set(self.started.elapsed().as_secs() as i64);
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    deps: Dependencies,
    registry: Registry,
    uptime: Uptime,
}

impl ExternalApi {
    /// Create a new ExternalApi instance exposing the metrics of `registry`
    pub fn new(addr: SocketAddr, registry: Registry) -> Result<Self> {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let gauge = IntGauge::new("uptime", "server uptime (seconds)")?;
        registry.register(Box::new(gauge.clone()))?;
        Ok(Self {
            tx,
            rx,
            addr,
            state: models::blank_health(),
            deps: Dependencies::default(),
            registry,
            uptime: Uptime {
                started: Instant::now(),
                gauge,
            },
        })
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Named dependency statuses, usable as the client's health checker
    pub fn dependencies(&self) -> Dependencies {
        self.deps.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self, token: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                health = self.rx.recv() => match health {
                    Some(health) => {
                        let mut guard = self.state.lock();
                        if *guard != health {
                            *guard = health;
                        }
                    }
                    None => break,
                },
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// serve the HTTP external api
    async fn run(
        addr: SocketAddr,
        state: State,
        deps: Dependencies,
        registry: Registry,
        uptime: Uptime,
        token: CancellationToken,
    ) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/dependencies", routing::get(handlers::dependencies))
            .layer(TraceLayer::new_for_http())
            .layer(Extension(state))
            .layer(Extension(deps))
            .layer(Extension(registry))
            .layer(Extension(uptime));

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
        info!("external API stopped");
        Ok(())
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self, token: CancellationToken) -> JoinHandle<()> {
        let state = self.state.clone();
        let deps = self.deps.clone();
        let registry = self.registry.clone();
        let uptime = self.uptime.clone();
        let addr = self.addr;

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, deps, registry, uptime, token.clone()),
                self.listen_status(token.clone())
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self, token: CancellationToken) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(token),
        }
    }
}

mod handlers {
    use axum::{
        Json,
        body::Body,
        extract::Extension,
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use prometheus::{Encoder, ProtobufEncoder, Registry, TextEncoder};
    use tracing::error;

    use crate::Uptime;
    use crate::models::{Dependencies, Health, ServerResult, State};

    pub(crate) async fn ok(
        Extension(state): Extension<State>,
        Extension(deps): Extension<Dependencies>,
    ) -> ServerResult<impl IntoResponse> {
        let health = *state.lock();
        Ok(match health {
            Health::Good if deps.all_up() => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn dependencies(
        Extension(deps): Extension<Dependencies>,
    ) -> ServerResult<impl IntoResponse> {
        Ok(Json(deps.snapshot()))
    }

    pub(crate) async fn metrics(
        Extension(registry): Extension<Registry>,
        Extension(uptime): Extension<Uptime>,
    ) -> ServerResult<impl IntoResponse> {
        uptime.refresh();
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = registry.gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text(
        Extension(registry): Extension<Registry>,
        Extension(uptime): Extension<Uptime>,
    ) -> ServerResult<impl IntoResponse> {
        uptime.refresh();
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = registry.gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use std::{collections::BTreeMap, fmt, sync::Arc};

    use axum::response::IntoResponse;
    use jetstream_core::HealthChecker;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tracing::debug;

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Up/down status of named dependencies, fed by the connection health
    /// monitor
    #[derive(Debug, Clone, Default)]
    pub struct Dependencies(Arc<Mutex<BTreeMap<String, bool>>>);

    impl Dependencies {
        /// Last reported status of `name`, if it ever reported
        pub fn status(&self, name: &str) -> Option<bool> {
            self.0.lock().get(name).copied()
        }

        /// True when every reported dependency is up
        pub fn all_up(&self) -> bool {
            self.0.lock().values().all(|up| *up)
        }

        /// Copy of all statuses
        pub fn snapshot(&self) -> BTreeMap<String, bool> {
            self.0.lock().clone()
        }
    }

    impl HealthChecker for Dependencies {
        fn set_status(&self, name: &str, up: bool) {
            let previous = self.0.lock().insert(name.to_owned(), up);
            if previous != Some(up) {
                debug!(name, up, "dependency status changed");
            }
        }
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }
}
