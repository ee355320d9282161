//! Durable consumption: batch fetch, sync loop and async dispatch.
//!
//! All consumption goes through durable pull consumers bound to the stream
//! that owns the subject. The sync loop stops on the first handler error; the
//! async dispatcher is fire-and-forget and only logs handler errors, since it
//! has no caller to return them to.

use std::{sync::Arc, time::Duration};

use async_nats::jetstream::{
    consumer::{AckPolicy, DeliverPolicy, PullConsumer, pull},
    context::GetStreamByNameErrorKind,
    stream::Stream as JsStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};

use crate::client::Connection;
use crate::error::{ClientError, ClientResult};
use crate::lease::AckLease;
use crate::message::{Message, MessageAttributes, Metadata, ensure_headers, headers_json};
use crate::metrics::ClientMetrics;
use crate::trace;

/// Application callback for delivered messages.
///
/// The message is borrowed for the duration of the call; acking it is up to
/// the handler (`message.ack().await`).
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (**self).handle(message).await
    }
}

/// Caller-owned pull subscription bound to a durable consumer.
pub struct PullSubscription {
    stream: JsStream,
    consumer: PullConsumer,
    subject: String,
    consumer_id: String,
    created: bool,
    fetch_max_wait: Duration,
}

impl std::fmt::Debug for PullSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullSubscription")
            .field("subject", &self.subject)
            .field("consumer_id", &self.consumer_id)
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

impl PullSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Whether the durable consumer was created by this subscription.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Broker-configured ack wait of the bound consumer.
    pub fn ack_wait(&self) -> Duration {
        self.consumer.cached_info().config.ack_wait
    }

    /// Fetch up to `limit` messages, waiting at most the configured fetch
    /// wait for the batch to fill.
    pub async fn fetch(&self, limit: usize) -> ClientResult<Vec<Message>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(limit)
            .expires(self.fetch_max_wait)
            .messages()
            .await
            .map_err(|e| ClientError::Subscribe(format!("fetch from '{}': {e}", self.subject)))?;

        let mut messages = Vec::with_capacity(limit);
        while let Some(message) = batch.next().await {
            let message = message.map_err(|e| {
                ClientError::Subscribe(format!("fetch from '{}': {e}", self.subject))
            })?;
            messages.push(message);
        }
        debug!(
            subject = %self.subject,
            consumer_id = %self.consumer_id,
            count = messages.len(),
            "fetched batch"
        );
        Ok(messages)
    }

    /// Release the subscription. The durable consumer is deleted only when
    /// this subscription created it.
    pub async fn unsubscribe(self) -> ClientResult<()> {
        if !self.created {
            return Ok(());
        }
        self.stream
            .delete_consumer(&self.consumer_id)
            .await
            .map_err(|e| {
                ClientError::Subscribe(format!(
                    "unsubscribe: delete consumer '{}': {e}",
                    self.consumer_id
                ))
            })?;
        debug!(consumer_id = %self.consumer_id, "transient consumer deleted");
        Ok(())
    }

    async fn messages(&self) -> ClientResult<pull::Stream> {
        self.consumer
            .messages()
            .await
            .map_err(|e| ClientError::Subscribe(format!("subscribe to '{}': {e}", self.subject)))
    }
}

/// Handle of a running async subscription.
///
/// Dropping the handle leaves the dispatcher running until the connection is
/// closed.
#[derive(Debug)]
pub struct AsyncSubscription {
    subject: String,
    consumer_id: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AsyncSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// True once the dispatcher has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop dispatch and wait for the in-flight message to finish.
    pub async fn unsubscribe(self) -> ClientResult<()> {
        self.token.cancel();
        self.task
            .await
            .map_err(|e| ClientError::Subscribe(format!("unsubscribe '{}': {e}", self.subject)))?;
        info!(
            subject = %self.subject,
            consumer_id = %self.consumer_id,
            "async subscription stopped"
        );
        Ok(())
    }
}

impl Connection {
    /// Fetch up to `limit` messages through a transient pull subscription.
    ///
    /// The subscription is always released afterwards. A release failure is
    /// merged with a fetch failure so both are visible; after a successful
    /// fetch it carries the batch in [`ClientError::UnsubscribeAfterFetch`].
    pub async fn fetch(
        &self,
        subject: &str,
        consumer_id: &str,
        limit: usize,
    ) -> ClientResult<Vec<Message>> {
        let subscription = self.pull_subscribe(subject, consumer_id).await?;
        let fetched = subscription.fetch(limit).await;
        let released = subscription.unsubscribe().await;
        match (fetched, released) {
            (Ok(messages), Ok(())) => Ok(messages),
            (Ok(messages), Err(err)) => Err(ClientError::UnsubscribeAfterFetch {
                messages,
                unsubscribe: Box::new(err),
            }),
            (Err(err), released) => Err(ClientError::merge(err, released.err())),
        }
    }

    /// Bind a pull subscription to the durable consumer without fetching.
    /// An empty `consumer_id` falls back to the configured default.
    pub async fn pull_subscribe(
        &self,
        subject: &str,
        consumer_id: &str,
    ) -> ClientResult<PullSubscription> {
        self.ensure_open("pull_subscribe")?;
        let consumer_id = self.config().resolve_consumer(consumer_id).to_owned();
        let stream = self.stream_for_subject(subject).await?;

        let (consumer, created) = match stream.get_consumer::<pull::Config>(&consumer_id).await {
            Ok(consumer) => (consumer, false),
            Err(err) => {
                debug!(consumer_id = %consumer_id, error = %err, "consumer not found, creating");
                let config = pull::Config {
                    durable_name: Some(consumer_id.clone()),
                    filter_subject: subject.to_owned(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ..Default::default()
                };
                let consumer = stream.create_consumer(config).await.map_err(|e| {
                    ClientError::Subscribe(format!("create consumer '{consumer_id}': {e}"))
                })?;
                (consumer, true)
            }
        };

        Ok(PullSubscription {
            stream,
            consumer,
            subject: subject.to_owned(),
            consumer_id,
            created,
            fetch_max_wait: self.config().fetch_max_wait(),
        })
    }

    /// Consume `subject` until `token` is cancelled or a handler fails.
    ///
    /// Returns `Ok(())` on cancellation. The first handler error stops the
    /// loop and is returned; the caller must resubscribe.
    pub async fn subscribe_sync<H: MessageHandler + ?Sized>(
        &self,
        token: &CancellationToken,
        subject: &str,
        consumer_id: &str,
        handler: &H,
    ) -> ClientResult<()> {
        let subscription = self.pull_subscribe(subject, consumer_id).await?;
        let mut messages = subscription.messages().await?;
        let consumer_id = subscription.consumer_id().to_owned();
        let shutdown = self.shutdown_token();
        info!(subject, consumer_id = %consumer_id, "sync subscription started");

        loop {
            if token.is_cancelled() || shutdown.is_cancelled() {
                debug!(subject, "sync subscription cancelled");
                return Ok(());
            }

            let next = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = shutdown.cancelled() => return Ok(()),
                next = messages.next() => next,
            };

            let mut message = match next {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    return Err(ClientError::Subscribe(format!(
                        "next message on '{subject}': {err}"
                    )));
                }
                None => {
                    return Err(ClientError::Subscribe(format!(
                        "next message on '{subject}': subscription closed"
                    )));
                }
            };

            let span = message_span("subscribe_sync", subject, &consumer_id);
            trace::continue_from(&span, ensure_headers(&mut message.message));
            let metadata = Metadata::of(&message);
            observe_delivery(self.metrics(), subject, &consumer_id, metadata.as_ref(), false);

            let timer = self.metrics().start_processing(subject, &consumer_id, false);
            let outcome = handler.handle(&message).instrument(span.clone()).await;
            timer.finish(outcome.is_err());

            if let Err(err) = outcome {
                MessageAttributes::collect(&message.message, metadata.as_ref()).record(&span);
                error!(parent: &span, subject, error = %err, "sync handler failed");
                return Err(ClientError::Subscribe(format!("process handler: {err:#}")));
            }
        }
    }

    /// Start dispatching `subject` to `handler` in the background and return
    /// immediately.
    ///
    /// Messages are handed to the handler one at a time in delivery order.
    /// Before each call the message is marked in progress; if that fails the
    /// message is skipped. Handler errors are logged and never stop dispatch.
    pub async fn subscribe_async<H: MessageHandler>(
        &self,
        subject: &str,
        consumer_id: &str,
        handler: H,
    ) -> ClientResult<AsyncSubscription> {
        let subscription = self.pull_subscribe(subject, consumer_id).await?;
        let messages = subscription.messages().await?;
        let token = self.shutdown_token().child_token();
        let dispatcher = Dispatcher {
            metrics: self.metrics().clone(),
            subject: subject.to_owned(),
            consumer_id: subscription.consumer_id().to_owned(),
            ack_wait: subscription.ack_wait(),
            handler,
        };
        let task = tokio::spawn(dispatcher.run(messages, token.clone()));
        info!(subject, consumer_id = %subscription.consumer_id(), "async subscription started");

        Ok(AsyncSubscription {
            subject: subject.to_owned(),
            consumer_id: subscription.consumer_id().to_owned(),
            token,
            task,
        })
    }

    async fn stream_for_subject(&self, subject: &str) -> ClientResult<JsStream> {
        let name = self
            .jetstream()
            .stream_by_subject(subject)
            .await
            .map_err(|e| match e.kind() {
                GetStreamByNameErrorKind::NotFound => {
                    ClientError::StreamNotFound(format!("no stream bound to subject '{subject}'"))
                }
                _ => ClientError::Subscribe(format!("lookup stream for '{subject}': {e}")),
            })?;
        self.jetstream()
            .get_stream(&name)
            .await
            .map_err(|e| ClientError::Subscribe(format!("get stream '{name}': {e}")))
    }
}

/// Background consumer loop of one async subscription.
struct Dispatcher<H> {
    metrics: ClientMetrics,
    subject: String,
    consumer_id: String,
    ack_wait: Duration,
    handler: H,
}

impl<H: MessageHandler> Dispatcher<H> {
    async fn run(self, mut messages: pull::Stream, token: CancellationToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = messages.next() => next,
            };
            match next {
                Some(Ok(message)) => self.dispatch(message).await,
                Some(Err(err)) => {
                    warn!(
                        subject = %self.subject,
                        error = %err,
                        "async subscription receive failed"
                    );
                }
                None => {
                    warn!(subject = %self.subject, "async subscription stream ended");
                    break;
                }
            }
        }
        debug!(
            subject = %self.subject,
            consumer_id = %self.consumer_id,
            "async dispatcher stopped"
        );
    }

    async fn dispatch(&self, mut message: Message) {
        let span = message_span("subscribe_async", &self.subject, &self.consumer_id);
        trace::continue_from(&span, ensure_headers(&mut message.message));
        let metadata = Metadata::of(&message);
        observe_delivery(&self.metrics, &self.subject, &self.consumer_id, metadata.as_ref(), true);
        let timer = self.metrics.start_processing(&self.subject, &self.consumer_id, true);

        let mut lease = AckLease::new(self.ack_wait, Instant::now());
        if let Err(err) = lease.refresh(&message).await {
            error!(
                parent: &span,
                subject = %self.subject,
                error = %err,
                "message in-progress failed, skipping"
            );
            timer.finish(true);
            return;
        }

        let outcome = self.handler.handle(&message).instrument(span.clone()).await;
        timer.finish(outcome.is_err());
        if let Err(err) = outcome {
            error!(
                parent: &span,
                error = %err,
                payload = %String::from_utf8_lossy(&message.payload),
                subject = %message.subject,
                headers = %headers_json(message.headers.as_ref()),
                "async handler failed"
            );
        } else if lease.is_expired() {
            debug!(parent: &span, subject = %self.subject, "handler outlived the ack wait");
        }
    }
}

fn message_span(name: &'static str, subject: &str, consumer_id: &str) -> Span {
    match name {
        "subscribe_sync" => info_span!(
            "subscribe_sync",
            messaging.subject = %subject,
            messaging.consumer = %consumer_id,
            messaging.payload = field::Empty,
            messaging.reply = field::Empty,
            messaging.headers = field::Empty,
            messaging.metadata = field::Empty,
        ),
        _ => info_span!(
            "subscribe_async",
            messaging.subject = %subject,
            messaging.consumer = %consumer_id,
        ),
    }
}

fn observe_delivery(
    metrics: &ClientMetrics,
    subject: &str,
    consumer_id: &str,
    metadata: Option<&Metadata>,
    is_async: bool,
) {
    match metadata.and_then(|m| m.timestamp) {
        Some(published) => metrics.observe_delivery(subject, consumer_id, published, is_async),
        None => debug!(subject, "message without broker metadata, delivery latency skipped"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use prometheus::Registry;
    use tracing_test::traced_test;

    use super::*;
    use crate::metrics::DELIVERY_TIME_METRIC;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn delivery_count(registry: &Registry) -> u64 {
        registry
            .gather()
            .iter()
            .filter(|f| f.get_name() == DELIVERY_TIME_METRIC)
            .flat_map(|f| f.get_metric().iter())
            .map(|m| m.get_histogram().get_sample_count())
            .sum()
    }

    #[test]
    #[traced_test]
    fn test_missing_metadata_skips_delivery_latency() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        observe_delivery(&metrics, "orders.created", "billing", None, false);
        assert_eq!(delivery_count(&registry), 0);
        assert!(logs_contain("delivery latency skipped"));
    }

    #[test]
    fn test_metadata_timestamp_recorded() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        let metadata = Metadata {
            stream: "orders".into(),
            consumer: "billing".into(),
            stream_sequence: 1,
            consumer_sequence: 1,
            delivered: 1,
            pending: 0,
            timestamp: Some(SystemTime::now()),
        };
        observe_delivery(&metrics, "orders.created", "billing", Some(&metadata), true);
        assert_eq!(delivery_count(&registry), 1);

        let without_ts = Metadata {
            timestamp: None,
            ..metadata
        };
        observe_delivery(&metrics, "orders.created", "billing", Some(&without_ts), true);
        assert_eq!(delivery_count(&registry), 1);
    }

    #[test]
    fn test_arc_handler_is_handler() {
        fn assert_handler<H: MessageHandler>(_: &H) {}
        assert_handler(&Arc::new(Noop));
    }

    #[test]
    fn test_message_span_names() {
        // no subscriber installed, spans are disabled but must still build
        let _ = message_span("subscribe_sync", "orders.created", "billing");
        let _ = message_span("subscribe_async", "orders.created", "billing");
    }
}
