//! jsclient configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default NATS endpoint list
    pub static DEFAULT_NATS_SERVERS: &str = "nats://127.0.0.1:4222";
    /// Default external api
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
    /// Default durable consumer identity
    pub static DEFAULT_CONSUMER_ID: &str = "jsclient";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "jsclient-worker";
    /// default log level. Can use this argument or JSCLIENT_LOG env var
    pub const DEFAULT_JSCLIENT_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub static DEFAULT_LOG_FORMAT: &str = "standard";
    /// Default seconds between connection liveness probes
    pub const DEFAULT_HEALTH_INTERVAL: u64 = 10;

    use std::{net::SocketAddr, sync::Arc, time::Duration};

    pub use clap::Parser;
    use clap::{Subcommand, ValueEnum};
    use jetstream_core::{
        ClientConfig, ClientResult, HealthChecker, StorageType, StreamSpec,
        config::DEFAULT_HEALTH_NAME,
    };

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "jsclient", bin_name = "jsclient", about, long_about = None)]
    /// parses from cli & environment var. jsclient will load `.env` in the working dir as well
    pub struct Config {
        /// comma separated NATS server urls
        #[clap(long, env, value_delimiter = ',', default_value = DEFAULT_NATS_SERVERS)]
        pub nats_servers: Vec<String>,
        /// default durable consumer identity
        #[clap(long, env, default_value = DEFAULT_CONSUMER_ID)]
        pub consumer_id: String,
        /// token auth, takes priority over user/password
        #[clap(long, env, hide_env_values = true)]
        pub nats_token: Option<String>,
        /// username auth
        #[clap(long, env)]
        pub nats_user: Option<String>,
        /// password auth
        #[clap(long, env, hide_env_values = true)]
        pub nats_password: Option<String>,
        /// log connection statistics on connection events
        #[clap(long, env)]
        pub nats_debug: bool,
        /// open publish spans and install the trace-context propagator
        #[clap(long, env)]
        pub tracing: bool,
        /// dependency name reported to the health API
        #[clap(long, env, default_value = DEFAULT_HEALTH_NAME)]
        pub health_name: String,
        /// seconds between connection liveness probes
        #[clap(long, env, value_parser, default_value_t = DEFAULT_HEALTH_INTERVAL)]
        pub health_interval: u64,
        /// extra connect attempts after the first failure
        #[clap(long, env, value_parser, default_value_t = 0)]
        pub connect_retry_max: u32,
        /// address of the health/metrics api
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_JSCLIENT_LOG)]
        pub jsclient_log: String,
        /// log output format: json, pretty or standard
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// operation to run
        #[clap(subcommand)]
        pub command: Command,
    }

    /// jsclient operations
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// ensure a stream exists, subjects are namespaced under its name
        Provision {
            /// stream name
            #[clap(long)]
            stream: String,
            /// subject, may be given multiple times
            #[clap(long = "subject", required = true)]
            subjects: Vec<String>,
            /// storage backend
            #[clap(long, value_enum, default_value_t = Storage::File)]
            storage: Storage,
            /// replica count
            #[clap(long)]
            replicas: Option<usize>,
            /// max message age in seconds
            #[clap(long)]
            max_age: Option<u64>,
            /// description stored with the stream
            #[clap(long)]
            description: Option<String>,
        },
        /// publish payloads and wait for persistence
        Publish {
            /// target subject
            subject: String,
            /// payloads, one message each
            #[clap(required = true)]
            payloads: Vec<String>,
            /// pipeline the publishes and wait for all acks at the end
            #[clap(long)]
            pipeline: bool,
        },
        /// fetch a batch through a transient pull subscription
        Fetch {
            /// bound subject
            subject: String,
            /// durable consumer, defaults to --consumer-id
            #[clap(long, default_value = "")]
            consumer: String,
            /// max messages in the batch
            #[clap(long, default_value_t = 10)]
            limit: usize,
            /// ack fetched messages
            #[clap(long)]
            ack: bool,
        },
        /// consume until interrupted
        Consume {
            /// bound subject
            subject: String,
            /// durable consumer, defaults to --consumer-id
            #[clap(long, default_value = "")]
            consumer: String,
            /// dispatch in the background instead of the sync loop
            #[clap(long = "async")]
            dispatch_async: bool,
        },
    }

    /// stream storage backend
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Storage {
        /// persisted to disk
        File,
        /// held in memory
        Memory,
    }

    impl From<Storage> for StorageType {
        fn from(storage: Storage) -> Self {
            match storage {
                Storage::File => StorageType::File,
                Storage::Memory => StorageType::Memory,
            }
        }
    }

    impl Config {
        /// liveness probe interval as `Duration`
        pub fn health_interval(&self) -> Duration {
            Duration::from_secs(self.health_interval)
        }

        /// client configuration reporting liveness to `checker`
        pub fn client_config(&self, checker: Arc<dyn HealthChecker>) -> ClientResult<ClientConfig> {
            let mut builder = ClientConfig::builder(self.nats_servers.clone(), &self.consumer_id)
                .debug(self.nats_debug)
                .tracing(self.tracing)
                .health_checker(&self.health_name, checker)
                .interval_check(self.health_interval())
                .connect_retry_max(self.connect_retry_max);
            if let (Some(user), Some(password)) = (&self.nats_user, &self.nats_password) {
                builder = builder.credentials(user, password);
            }
            if let Some(token) = &self.nats_token {
                builder = builder.token(token);
            }
            builder.build()
        }
    }

    impl Command {
        /// stream spec of a `provision` command
        pub fn stream_spec(&self) -> Option<StreamSpec> {
            let Command::Provision {
                stream,
                subjects,
                storage,
                replicas,
                max_age,
                description,
            } = self
            else {
                return None;
            };
            let mut spec = StreamSpec::new(stream)
                .subjects(subjects.iter().cloned())
                .storage((*storage).into());
            if let Some(replicas) = replicas {
                spec = spec.replicas(*replicas);
            }
            if let Some(secs) = max_age {
                spec = spec.max_age(Duration::from_secs(*secs));
            }
            if let Some(description) = description {
                spec = spec.description(description);
            }
            Some(spec)
        }
    }

    #[cfg(test)]
    mod tests {
        use jetstream_core::Credentials;

        use super::*;

        struct Noop;

        impl HealthChecker for Noop {
            fn set_status(&self, _name: &str, _up: bool) {}
        }

        #[test]
        fn test_parse_provision() {
            let config = Config::try_parse_from([
                "jsclient",
                "--nats-servers",
                "nats://a:4222,nats://b:4222",
                "provision",
                "--stream",
                "orders",
                "--subject",
                "created",
                "--subject",
                "orders.paid",
                "--storage",
                "memory",
            ])
            .unwrap();
            assert_eq!(config.nats_servers, vec!["nats://a:4222", "nats://b:4222"]);

            let stream_config = config.command.stream_spec().unwrap().into_config().unwrap();
            assert_eq!(stream_config.subjects, vec!["orders.created", "orders.paid"]);
            assert_eq!(stream_config.storage, StorageType::Memory);
        }

        #[test]
        fn test_client_config_credentials() {
            let config = Config::try_parse_from([
                "jsclient",
                "--nats-user",
                "app",
                "--nats-password",
                "pw",
                "--nats-token",
                "tok",
                "fetch",
                "orders.created",
            ])
            .unwrap();
            let client = config.client_config(Arc::new(Noop)).unwrap();
            assert_eq!(client.credentials(), &Credentials::Token("tok".into()));
            assert_eq!(client.consumer_id(), DEFAULT_CONSUMER_ID);
            assert_eq!(client.health().name, DEFAULT_HEALTH_NAME);
            assert!(config.command.stream_spec().is_none());
        }

        #[test]
        fn test_consume_async_flag() {
            let args = ["jsclient", "consume", "orders.created", "--async"];
            let config = Config::try_parse_from(args).unwrap();
            assert_eq!(
                config.command,
                Command::Consume {
                    subject: "orders.created".into(),
                    consumer: String::new(),
                    dispatch_async: true,
                }
            );
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::{propagation::TraceContextPropagator, trace::TracerProvider};
    use tracing::{Subscriber, debug};
    use tracing_opentelemetry::OpenTelemetryLayer;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        registry::LookupSpan,
        util::SubscriberInitExt,
    };

    /// Configuration for logging and trace export
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
        provider: Option<TracerProvider>,
    }

    impl Config {
        /// Install the global subscriber. With `tracing` on, also install the
        /// W3C trace-context propagator and bridge spans to OpenTelemetry.
        pub fn parse(jsclient_log: &str, log_frmt: &str, tracing: bool) -> Result<Self> {
            // Log level comes from JSCLIENT_LOG
            let filter = EnvFilter::try_new(jsclient_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            let provider = tracing.then(|| {
                opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());
                let provider = TracerProvider::builder().build();
                opentelemetry::global::set_tracer_provider(provider.clone());
                provider
            });

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(otel_layer(provider.as_ref()))
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(otel_layer(provider.as_ref()))
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(otel_layer(provider.as_ref()))
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
                provider,
            })
        }

        /// Flush and stop the tracer provider, if one was installed
        pub fn shutdown(self) {
            if let Some(provider) = self.provider {
                if let Err(err) = provider.shutdown() {
                    debug!(?err, "tracer provider shutdown failed");
                }
            }
        }
    }

    fn otel_layer<S>(
        provider: Option<&TracerProvider>,
    ) -> Option<OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>>
    where
        S: Subscriber + for<'span> LookupSpan<'span>,
    {
        provider.map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer("jsclient"))
        })
    }
}
