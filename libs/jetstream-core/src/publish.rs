//! Acknowledged publishing.
//!
//! Every publish injects the active trace context into the message headers
//! and resolves only once the broker confirms persistence. No retry is done
//! here; retry policy belongs to the caller.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use async_nats::{HeaderMap, jetstream::context::PublishAckFuture};
use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{Instrument, Span, debug, info_span, warn};

pub use async_nats::jetstream::publish::PublishAck;

use crate::client::Connection;
use crate::error::{ClientError, ClientResult};
use crate::trace;

/// Single-resolution acknowledgement of one asynchronously published message.
///
/// Resolves to the broker's [`PublishAck`] (stream and assigned sequence) or
/// to a [`ClientError::Publish`]. The acknowledgement is awaited in the
/// background whether or not this future is polled, so
/// [`Connection::close`] can drain it.
#[derive(Debug)]
#[must_use = "dropping the future discards the acknowledgement outcome"]
pub struct AckFuture {
    rx: oneshot::Receiver<ClientResult<PublishAck>>,
}

impl Future for AckFuture {
    type Output = ClientResult<PublishAck>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|outcome| match outcome {
            Ok(result) => result,
            Err(_) => Err(ClientError::Publish(
                "publish_async: acknowledgement task dropped".into(),
            )),
        })
    }
}

impl Connection {
    /// Publish and wait for the broker to persist the message.
    pub async fn publish_sync(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> ClientResult<PublishAck> {
        let payload = payload.into();
        let span = self.publish_span("publish_sync", subject, payload.len());
        async {
            let ack = self
                .submit("publish_sync", subject, payload)
                .await?
                .await
                .map_err(|e| ClientError::Publish(format!("publish_sync: {e}")))?;
            debug!(subject, stream = %ack.stream, sequence = ack.sequence, "message persisted");
            Ok(ack)
        }
        .instrument(span)
        .await
    }

    /// Publish without blocking the client's send buffer, then wait on the
    /// acknowledgement. Returns only after the broker confirmed persistence.
    pub async fn publish_async(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> ClientResult<PublishAck> {
        let payload = payload.into();
        let span = self.publish_span("publish_async", subject, payload.len());
        async {
            let ack = self.ack_future("publish_async", subject, payload).await?.await?;
            debug!(subject, stream = %ack.stream, sequence = ack.sequence, "message persisted");
            Ok(ack)
        }
        .instrument(span)
        .await
    }

    /// Submit a message and return its acknowledgement future without
    /// waiting on it, so several publishes can be pipelined.
    pub async fn publish_async_ack(
        &self,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> ClientResult<AckFuture> {
        let payload = payload.into();
        let span = self.publish_span("publish_async", subject, payload.len());
        self.ack_future("publish_async", subject, payload)
            .instrument(span)
            .await
    }

    async fn ack_future(
        &self,
        op: &str,
        subject: &str,
        payload: Bytes,
    ) -> ClientResult<AckFuture> {
        // Held from before the closed check until the ack resolves, so a
        // concurrent close waits for this publish.
        let in_flight = self.acks().token();
        let pending = self.submit(op, subject, payload).await?;
        let (tx, rx) = oneshot::channel();
        let op = op.to_owned();
        let subject = subject.to_owned();
        self.acks().spawn(async move {
            let _in_flight = in_flight;
            let result = pending.await.map_err(|e| {
                warn!(subject = %subject, error = %e, "publish acknowledgement failed");
                ClientError::Publish(format!("{op}: {e}"))
            });
            // receiver may have been dropped by a pipelining caller
            let _ = tx.send(result);
        });
        Ok(AckFuture { rx })
    }

    async fn submit(
        &self,
        op: &str,
        subject: &str,
        payload: Bytes,
    ) -> ClientResult<PublishAckFuture> {
        self.ensure_open(op)?;
        let mut headers = HeaderMap::new();
        trace::inject_current(&mut headers);
        self.jetstream()
            .publish_with_headers(subject.to_owned(), headers, payload)
            .await
            .map_err(|e| ClientError::Publish(format!("{op}: {e}")))
    }

    fn publish_span(&self, name: &'static str, subject: &str, size: usize) -> Span {
        if !self.config().tracing() {
            return Span::none();
        }
        match name {
            "publish_sync" => info_span!(
                "publish_sync",
                messaging.destination = %subject,
                messaging.payload_size = size,
            ),
            _ => info_span!(
                "publish_async",
                messaging.destination = %subject,
                messaging.payload_size = size,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_future_resolves_once() {
        let (tx, rx) = oneshot::channel();
        let fut = AckFuture { rx };
        tx.send(Err(ClientError::Publish("publish_async: timed out".into())))
            .unwrap();
        let err = fut.await.unwrap_err();
        assert!(matches!(err, ClientError::Publish(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn test_ack_future_dropped_sender_is_publish_error() {
        let (tx, rx) = oneshot::channel::<ClientResult<PublishAck>>();
        drop(tx);
        let err = AckFuture { rx }.await.unwrap_err();
        assert!(matches!(err, ClientError::Publish(_)));
    }
}
