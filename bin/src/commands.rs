//! Subcommand execution against a live connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jetstream_core::{Connection, Message, MessageHandler, Metadata, PublishAck};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::cli::Command;

/// Logs and acks every delivered message.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let metadata = Metadata::of(message);
        info!(
            subject = %message.subject,
            stream_sequence = metadata.as_ref().map(|m| m.stream_sequence),
            delivered = metadata.as_ref().map(|m| m.delivered),
            payload = %String::from_utf8_lossy(&message.payload),
            "message received"
        );
        message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("ack message: {e}"))
    }
}

/// Run `command`; `token` interrupts long-running consumption.
pub async fn run(conn: &Connection, command: Command, token: CancellationToken) -> Result<()> {
    match &command {
        Command::Provision { stream, .. } => {
            if let Some(spec) = command.stream_spec() {
                conn.create_stream(spec)
                    .await
                    .with_context(|| format!("provision stream {stream}"))?;
                info!(%stream, "stream ready");
            }
        }
        Command::Publish {
            subject,
            payloads,
            pipeline,
        } => {
            let acks = publish(conn, subject, payloads, *pipeline).await?;
            for ack in acks {
                info!(
                    stream = %ack.stream,
                    sequence = ack.sequence,
                    duplicate = ack.duplicate,
                    "published"
                );
            }
        }
        Command::Fetch {
            subject,
            consumer,
            limit,
            ack,
        } => {
            let messages = conn
                .fetch(subject, consumer, *limit)
                .await
                .with_context(|| format!("fetch from {subject}"))?;
            info!(%subject, count = messages.len(), "fetched");
            for message in &messages {
                if *ack {
                    LogHandler.handle(message).await?;
                } else {
                    info!(
                        subject = %message.subject,
                        payload = %String::from_utf8_lossy(&message.payload),
                        "message fetched"
                    );
                }
            }
        }
        Command::Consume {
            subject,
            consumer,
            dispatch_async,
        } => {
            if *dispatch_async {
                let subscription = conn
                    .subscribe_async(subject, consumer, LogHandler)
                    .await
                    .with_context(|| format!("subscribe to {subject}"))?;
                token.cancelled().await;
                debug!("interrupt received, stopping async subscription");
                subscription.unsubscribe().await?;
            } else {
                conn.subscribe_sync(&token, subject, consumer, &LogHandler)
                    .await
                    .with_context(|| format!("consume {subject}"))?;
            }
        }
    }
    Ok(())
}

async fn publish(
    conn: &Connection,
    subject: &str,
    payloads: &[String],
    pipeline: bool,
) -> Result<Vec<PublishAck>> {
    let mut acks = Vec::with_capacity(payloads.len());
    if pipeline {
        let mut pending = Vec::with_capacity(payloads.len());
        for payload in payloads {
            pending.push(conn.publish_async_ack(subject, payload.clone().into_bytes()).await?);
        }
        for ack in pending {
            acks.push(ack.await?);
        }
    } else {
        for payload in payloads {
            acks.push(conn.publish_sync(subject, payload.clone().into_bytes()).await?);
        }
    }
    Ok(acks)
}
