//! Immutable client configuration.
//!
//! Built once through [`ClientConfigBuilder`]; every default is resolved in
//! [`ClientConfigBuilder::build`] and never re-derived afterwards.

use std::{fmt, sync::Arc, time::Duration};

use crate::error::{ClientError, ClientResult};
use crate::health::HealthChecker;

/// Default interval between liveness probes.
pub const DEFAULT_INTERVAL_CHECK: Duration = Duration::from_secs(10);

/// Name reported to the health checker when none is given.
pub const DEFAULT_HEALTH_NAME: &str = "nats";

/// Default connection timeout if not configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default broker-side wait for a pull batch to fill.
pub const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(5);

/// Upper bound for the consumer listing performed on close.
pub const DEFAULT_CLOSE_LISTING_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved credential used when opening the transport.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// No authentication.
    Anonymous,
    /// Token authentication.
    Token(String),
    /// Username and password authentication.
    UserPassword { username: String, password: String },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // secrets stay out of logs
        match self {
            Credentials::Anonymous => write!(f, "Anonymous"),
            Credentials::Token(_) => write!(f, "Token(..)"),
            Credentials::UserPassword { username, .. } => f
                .debug_struct("UserPassword")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

/// Health-check policy: where liveness is reported and how often.
#[derive(Clone)]
pub struct HealthPolicy {
    /// Injected health-reporting collaborator.
    pub checker: Option<Arc<dyn HealthChecker>>,
    /// Probe interval.
    pub interval: Duration,
    /// Dependency name reported to the checker.
    pub name: String,
}

impl fmt::Debug for HealthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthPolicy")
            .field("checker", &self.checker.is_some())
            .field("interval", &self.interval)
            .field("name", &self.name)
            .finish()
    }
}

/// Connection configuration. Immutable once built.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    servers: Vec<String>,
    consumer_id: String,
    credentials: Credentials,
    debug: bool,
    tracing: bool,
    health: HealthPolicy,
    connect_timeout: Duration,
    connect_retry_max: u32,
    fetch_max_wait: Duration,
    close_listing_timeout: Duration,
}

impl ClientConfig {
    /// Start building a configuration for the given endpoints and default
    /// durable-consumer identity.
    pub fn builder<I, S>(servers: I, consumer_id: impl Into<String>) -> ClientConfigBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfigBuilder {
            servers: servers.into_iter().map(Into::into).collect(),
            consumer_id: consumer_id.into(),
            ..Default::default()
        }
    }

    /// Server endpoint list.
    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Comma-joined endpoint list, used as the availability gauge label.
    pub fn endpoint(&self) -> String {
        self.servers.join(",")
    }

    /// Default durable-consumer identity.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Resolve a caller-supplied consumer identity, falling back to the
    /// configured default when empty.
    pub fn resolve_consumer<'a>(&'a self, consumer_id: &'a str) -> &'a str {
        if consumer_id.is_empty() {
            &self.consumer_id
        } else {
            consumer_id
        }
    }

    /// Credential selected at build time.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Whether connection event hooks log statistics.
    pub fn debug(&self) -> bool {
        self.debug
    }

    /// Whether publish spans are opened.
    pub fn tracing(&self) -> bool {
        self.tracing
    }

    /// Health-check policy.
    pub fn health(&self) -> &HealthPolicy {
        &self.health
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn connect_retry_max(&self) -> u32 {
        self.connect_retry_max
    }

    pub fn fetch_max_wait(&self) -> Duration {
        self.fetch_max_wait
    }

    pub fn close_listing_timeout(&self) -> Duration {
        self.close_listing_timeout
    }
}

/// Builder for [`ClientConfig`]. Setters may be applied in any order.
#[derive(Default)]
pub struct ClientConfigBuilder {
    servers: Vec<String>,
    consumer_id: String,
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
    debug: bool,
    tracing: bool,
    checker: Option<Arc<dyn HealthChecker>>,
    health_name: Option<String>,
    interval_check: Option<Duration>,
    connect_timeout: Option<Duration>,
    connect_retry_max: u32,
    fetch_max_wait: Option<Duration>,
    close_listing_timeout: Option<Duration>,
}

impl fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("servers", &self.servers)
            .field("consumer_id", &self.consumer_id)
            .field("debug", &self.debug)
            .field("tracing", &self.tracing)
            .finish_non_exhaustive()
    }
}

impl ClientConfigBuilder {
    /// Authenticate with a token. Takes priority over username/password.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Authenticate with username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn tracing(mut self, tracing: bool) -> Self {
        self.tracing = tracing;
        self
    }

    /// Report liveness to `checker` under `name`. An empty name resolves to
    /// [`DEFAULT_HEALTH_NAME`].
    pub fn health_checker(
        mut self,
        name: impl Into<String>,
        checker: Arc<dyn HealthChecker>,
    ) -> Self {
        self.health_name = Some(name.into());
        self.checker = Some(checker);
        self
    }

    /// Probe interval. Zero resolves to [`DEFAULT_INTERVAL_CHECK`].
    pub fn interval_check(mut self, interval: Duration) -> Self {
        self.interval_check = Some(interval);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Extra connect attempts after the first failure.
    pub fn connect_retry_max(mut self, retries: u32) -> Self {
        self.connect_retry_max = retries;
        self
    }

    pub fn fetch_max_wait(mut self, wait: Duration) -> Self {
        self.fetch_max_wait = Some(wait);
        self
    }

    pub fn close_listing_timeout(mut self, timeout: Duration) -> Self {
        self.close_listing_timeout = Some(timeout);
        self
    }

    /// Resolve defaults and produce the immutable configuration.
    pub fn build(self) -> ClientResult<ClientConfig> {
        if self.servers.iter().all(|s| s.trim().is_empty()) {
            return Err(ClientError::Validation(
                "at least one server endpoint must be specified".into(),
            ));
        }

        let credentials = match (self.token, self.username, self.password) {
            (Some(token), _, _) if !token.is_empty() => Credentials::Token(token),
            (_, Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Credentials::UserPassword { username, password }
            }
            _ => Credentials::Anonymous,
        };

        let name = match self.health_name {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_HEALTH_NAME.to_owned(),
        };
        let interval = self
            .interval_check
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_INTERVAL_CHECK);

        Ok(ClientConfig {
            servers: self.servers,
            consumer_id: self.consumer_id,
            credentials,
            debug: self.debug,
            tracing: self.tracing,
            health: HealthPolicy {
                checker: self.checker,
                interval,
                name,
            },
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            connect_retry_max: self.connect_retry_max,
            fetch_max_wait: self.fetch_max_wait.unwrap_or(DEFAULT_FETCH_MAX_WAIT),
            close_listing_timeout: self
                .close_listing_timeout
                .unwrap_or(DEFAULT_CLOSE_LISTING_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct NoopChecker;

    impl HealthChecker for NoopChecker {
        fn set_status(&self, _name: &str, _up: bool) {}
    }

    fn builder() -> ClientConfigBuilder {
        ClientConfig::builder(["nats://127.0.0.1:4222"], "test-consumer")
    }

    #[test]
    fn test_defaults_resolved_at_build() {
        let config = builder().build().unwrap();
        assert_eq!(config.health().interval, DEFAULT_INTERVAL_CHECK);
        assert_eq!(config.health().name, DEFAULT_HEALTH_NAME);
        assert!(config.health().checker.is_none());
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.fetch_max_wait(), DEFAULT_FETCH_MAX_WAIT);
        assert_eq!(config.close_listing_timeout(), DEFAULT_CLOSE_LISTING_TIMEOUT);
        assert_eq!(config.connect_retry_max(), 0);
        assert_eq!(config.credentials(), &Credentials::Anonymous);
        assert!(!config.debug());
        assert!(!config.tracing());
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let config = builder().interval_check(Duration::ZERO).build().unwrap();
        assert_eq!(config.health().interval, DEFAULT_INTERVAL_CHECK);

        let config = builder()
            .interval_check(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(config.health().interval, Duration::from_millis(250));
    }

    #[test]
    fn test_empty_health_name_uses_default() {
        let config = builder()
            .health_checker("", Arc::new(NoopChecker))
            .build()
            .unwrap();
        assert_eq!(config.health().name, DEFAULT_HEALTH_NAME);
        assert!(config.health().checker.is_some());

        let config = builder()
            .health_checker("orders-nats", Arc::new(NoopChecker))
            .build()
            .unwrap();
        assert_eq!(config.health().name, "orders-nats");
    }

    #[test]
    fn test_token_takes_priority() {
        let config = builder()
            .credentials("user", "pass")
            .token("secret")
            .build()
            .unwrap();
        assert_eq!(config.credentials(), &Credentials::Token("secret".into()));
    }

    #[test]
    fn test_user_password_requires_both() {
        let config = builder().credentials("user", "").build().unwrap();
        assert_eq!(config.credentials(), &Credentials::Anonymous);

        let config = builder().credentials("user", "pass").build().unwrap();
        assert_eq!(
            config.credentials(),
            &Credentials::UserPassword {
                username: "user".into(),
                password: "pass".into()
            }
        );
    }

    #[test]
    fn test_empty_servers_rejected() {
        let err = ClientConfig::builder(Vec::<String>::new(), "c")
            .build()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_resolve_consumer_fallback() {
        let config = builder().build().unwrap();
        assert_eq!(config.resolve_consumer(""), "test-consumer");
        assert_eq!(config.resolve_consumer("other"), "other");
    }

    #[test]
    fn test_endpoint_label_joins_servers() {
        let config = ClientConfig::builder(["nats://a:4222", "nats://b:4222"], "c")
            .build()
            .unwrap();
        assert_eq!(config.endpoint(), "nats://a:4222,nats://b:4222");
    }

    #[test]
    fn test_debug_output_hides_secrets() {
        let config = builder().token("super-secret").build().unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
