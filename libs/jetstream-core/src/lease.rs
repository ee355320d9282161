//! Ack-deadline lease for messages being processed.
//!
//! The broker redelivers a message once its ack wait elapses. The client only
//! ever refreshes that window with an in-progress signal; it never tracks a
//! message to its final ack or nak, which stays a capability of the message.

use std::time::Duration;

use async_nats::jetstream::AckKind;
use tokio::time::Instant;

use crate::error::{ClientError, ClientResult};
use crate::message::Message;

/// Lease on the redelivery window of one in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckLease {
    ack_wait: Duration,
    expires_at: Instant,
}

impl AckLease {
    /// A lease whose window started at delivery time `delivered_at`.
    pub fn new(ack_wait: Duration, delivered_at: Instant) -> Self {
        Self {
            ack_wait,
            expires_at: delivered_at + ack_wait,
        }
    }

    /// Broker-configured ack wait of the consumer.
    pub fn ack_wait(&self) -> Duration {
        self.ack_wait
    }

    /// When the broker will consider the message for redelivery.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before redelivery, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Send the in-progress signal for `message` and extend the window.
    pub async fn refresh(&mut self, message: &Message) -> ClientResult<()> {
        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| ClientError::Subscribe(format!("set message in progress: {e}")))?;
        self.extend();
        Ok(())
    }

    fn extend(&mut self) {
        self.expires_at = Instant::now() + self.ack_wait;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry() {
        let lease = AckLease::new(Duration::from_secs(30), Instant::now());
        assert_eq!(lease.remaining(), Duration::from_secs(30));
        assert!(!lease.is_expired());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(lease.is_expired());
        assert_eq!(lease.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_restarts_window() {
        let mut lease = AckLease::new(Duration::from_secs(30), Instant::now());
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(lease.remaining(), Duration::from_secs(10));

        lease.extend();
        assert_eq!(lease.remaining(), Duration::from_secs(30));
        assert_eq!(lease.ack_wait(), Duration::from_secs(30));
    }
}
