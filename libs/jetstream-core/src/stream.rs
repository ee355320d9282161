//! Declarative stream provisioning.
//!
//! A [`StreamSpec`] is assembled from composable setters and registered with
//! [`Connection::create_stream`]. Every subject is namespaced under the stream
//! name, so two independently named streams can never claim the same subject.
//! Registering a stream that already exists is a no-op.

use std::time::Duration;

use async_nats::jetstream::{ErrorCode, context::CreateStreamErrorKind, stream};
use tracing::{debug, info};

pub use async_nats::jetstream::stream::{DiscardPolicy, RetentionPolicy, StorageType};

use crate::client::Connection;
use crate::error::{ClientError, ClientResult};

/// Rewrite `subject` to `"<stream>.<subject>"` unless it is already under
/// the `"<stream>."` namespace.
pub fn namespace_subject(stream: &str, subject: &str) -> String {
    let prefix = format!("{stream}.");
    if subject.starts_with(&prefix) {
        subject.to_owned()
    } else {
        format!("{prefix}{subject}")
    }
}

/// Stream configuration builder. Each policy is independently settable.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    config: stream::Config,
}

impl StreamSpec {
    /// Start a spec for the stream `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: stream::Config {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Replace the subject list.
    pub fn subjects<I, S>(mut self, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.subjects = subjects.into_iter().map(Into::into).collect();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.config.description = Some(description.into());
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn replicas(mut self, replicas: usize) -> Self {
        self.config.num_replicas = replicas;
        self
    }

    pub fn max_consumers(mut self, max_consumers: i32) -> Self {
        self.config.max_consumers = max_consumers;
        self
    }

    pub fn max_messages(mut self, max_messages: i64) -> Self {
        self.config.max_messages = max_messages;
        self
    }

    pub fn max_bytes(mut self, max_bytes: i64) -> Self {
        self.config.max_bytes = max_bytes;
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.config.max_age = max_age;
        self
    }

    pub fn max_messages_per_subject(mut self, max: i64) -> Self {
        self.config.max_messages_per_subject = max;
        self
    }

    pub fn max_message_size(mut self, max: i32) -> Self {
        self.config.max_message_size = max;
        self
    }

    pub fn discard(mut self, discard: DiscardPolicy) -> Self {
        self.config.discard = discard;
        self
    }

    pub fn discard_new_per_subject(mut self, flag: bool) -> Self {
        self.config.discard_new_per_subject = flag;
        self
    }

    /// Window in which duplicate `Nats-Msg-Id` publishes are dropped.
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.config.duplicate_window = window;
        self
    }

    pub fn no_ack(mut self, flag: bool) -> Self {
        self.config.no_ack = flag;
        self
    }

    pub fn sealed(mut self, flag: bool) -> Self {
        self.config.sealed = flag;
        self
    }

    pub fn deny_delete(mut self, flag: bool) -> Self {
        self.config.deny_delete = flag;
        self
    }

    pub fn deny_purge(mut self, flag: bool) -> Self {
        self.config.deny_purge = flag;
        self
    }

    pub fn allow_rollup(mut self, flag: bool) -> Self {
        self.config.allow_rollup = flag;
        self
    }

    pub fn allow_direct(mut self, flag: bool) -> Self {
        self.config.allow_direct = flag;
        self
    }

    pub fn mirror_direct(mut self, flag: bool) -> Self {
        self.config.mirror_direct = flag;
        self
    }

    /// Stream name as given.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Validate and produce the broker configuration with namespaced subjects.
    pub fn into_config(mut self) -> ClientResult<stream::Config> {
        if self.config.name.trim().is_empty() {
            return Err(ClientError::Validation("stream name cannot be empty".into()));
        }
        if self.config.subjects.is_empty() {
            return Err(ClientError::Validation(format!(
                "at least one subject must be specified for stream '{}'",
                self.config.name
            )));
        }

        let name = self.config.name.clone();
        self.config.subjects = self
            .config
            .subjects
            .iter()
            .map(|subject| namespace_subject(&name, subject))
            .collect();
        Ok(self.config)
    }
}

impl Connection {
    /// Ensure the stream described by `spec` exists.
    ///
    /// Fails with [`ClientError::Validation`] before any network call when the
    /// name or the subject list is empty. "Already exists" counts as success.
    pub async fn create_stream(&self, spec: StreamSpec) -> ClientResult<()> {
        let config = spec.into_config()?;
        let name = config.name.clone();
        debug!(stream = %name, subjects = ?config.subjects, "registering stream");

        match self.jetstream().create_stream(config).await {
            Ok(_) => {
                info!(stream = %name, "stream registered");
                Ok(())
            }
            Err(err) => match err.kind() {
                CreateStreamErrorKind::JetStream(js_err)
                    if js_err.error_code() == ErrorCode::STREAM_NAME_EXIST =>
                {
                    debug!(stream = %name, "stream already exists");
                    Ok(())
                }
                _ => Err(ClientError::Provision(format!(
                    "create stream '{name}': {err}"
                ))),
            },
        }
    }
}
