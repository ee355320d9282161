//! Error types for JetStream client operations.
//!
//! Setup-time failures (connect, provision, subscribe) are always surfaced
//! with the operation name in the message. Consumers can distinguish transport
//! failures, validation failures and missing streams without matching on
//! `async-nats` error kinds.

use async_nats::jetstream::Message;
use thiserror::Error;

/// Top-level error type for the jetstream-core crate.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport unreachable, JetStream context unavailable or flush failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid input rejected before any network call (empty stream name,
    /// empty subject list, empty server list).
    #[error("validation error: {0}")]
    Validation(String),

    /// Send or acknowledgement failure on either publish path.
    #[error("publish error: {0}")]
    Publish(String),

    /// Subscription setup, next-message retrieval or sync handler failure.
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// No stream is bound to the requested subject or name.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// Stream registration failed for a reason other than "already exists".
    #[error("provision error: {0}")]
    Provision(String),

    /// A collector could not be created or registered.
    #[error("metrics error: {0}")]
    Metrics(String),

    /// A fetch failed and releasing its transient subscription failed too.
    #[error("{fetch}; unsubscribe also failed: {unsubscribe}")]
    FetchAndUnsubscribe {
        fetch: Box<ClientError>,
        unsubscribe: Box<ClientError>,
    },

    /// A fetch succeeded but releasing its transient subscription failed.
    /// The fetched batch is handed back so it can still be processed.
    #[error("fetched {} message(s); unsubscribe failed: {unsubscribe}", .messages.len())]
    UnsubscribeAfterFetch {
        messages: Vec<Message>,
        unsubscribe: Box<ClientError>,
    },
}

impl ClientError {
    /// Returns true if this error (or the fetch half of a merged error) is a
    /// missing stream.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::StreamNotFound(_) => true,
            ClientError::FetchAndUnsubscribe { fetch, .. } => fetch.is_not_found(),
            _ => false,
        }
    }

    /// Returns true if the error was raised by input validation.
    pub fn is_validation(&self) -> bool {
        matches!(self, ClientError::Validation(_))
    }

    /// Messages a fetch delivered before its release failed.
    pub fn fetched_messages(self) -> Option<Vec<Message>> {
        match self {
            ClientError::UnsubscribeAfterFetch { messages, .. } => Some(messages),
            _ => None,
        }
    }

    /// Combine a primary fetch error with an optional release error.
    pub(crate) fn merge(fetch: ClientError, unsubscribe: Option<ClientError>) -> ClientError {
        match unsubscribe {
            Some(unsubscribe) => ClientError::FetchAndUnsubscribe {
                fetch: Box::new(fetch),
                unsubscribe: Box::new(unsubscribe),
            },
            None => fetch,
        }
    }
}

impl From<prometheus::Error> for ClientError {
    fn from(err: prometheus::Error) -> Self {
        ClientError::Metrics(err.to_string())
    }
}

/// Shorthand result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
