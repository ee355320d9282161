//! Delivery/processing latency histograms and the availability gauge.
//!
//! Collectors are created against an explicit [`prometheus::Registry`] owned by
//! the process entry point, so tests can use an isolated registry each.
//! All latencies are recorded in milliseconds.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use prometheus::{HistogramOpts, HistogramVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::error::ClientResult;

/// Millisecond buckets shared by both latency histograms.
pub const LATENCY_BUCKETS_MS: &[f64] = &[
    1.0, 10.0, 25.0, 50.0, 100.0, 150.0, 200.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 20000.0,
    30000.0,
];

pub const DELIVERY_TIME_METRIC: &str = "nats_stream_delivery_time_ms";
pub const PROCESSING_TIME_METRIC: &str = "nats_stream_message_processing_time_ms";
pub const AVAILABILITY_METRIC: &str = "nats_availability";

/// Collectors used by the publish/subscribe pipelines and the health monitor.
///
/// Cloning is cheap; clones share the underlying collectors.
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    delivery_time_ms: HistogramVec,
    processing_time_ms: HistogramVec,
    availability: IntGaugeVec,
}

impl ClientMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> ClientResult<Self> {
        let delivery_time_ms = HistogramVec::new(
            HistogramOpts::new(
                DELIVERY_TIME_METRIC,
                "The time for message delivery from NATS (milliseconds)",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["subject", "consumer_id", "is_async"],
        )?;
        let processing_time_ms = HistogramVec::new(
            HistogramOpts::new(
                PROCESSING_TIME_METRIC,
                "The time that consumer process message from consume till ack (milliseconds)",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["subject", "consumer_id", "is_async", "is_err"],
        )?;
        let availability = IntGaugeVec::new(
            Opts::new(
                AVAILABILITY_METRIC,
                "Indicates the availability of NATS connection \
                 (1 for connected, 0 for disconnected)",
            ),
            &["endpoint", "consumer_id"],
        )?;

        registry.register(Box::new(delivery_time_ms.clone()))?;
        registry.register(Box::new(processing_time_ms.clone()))?;
        registry.register(Box::new(availability.clone()))?;

        Ok(Self {
            delivery_time_ms,
            processing_time_ms,
            availability,
        })
    }

    /// Record the time elapsed since the broker stored the message.
    pub fn observe_delivery(
        &self,
        subject: &str,
        consumer_id: &str,
        published: SystemTime,
        is_async: bool,
    ) {
        let elapsed = SystemTime::now()
            .duration_since(published)
            .unwrap_or_default();
        self.delivery_time_ms
            .with_label_values(&[subject, consumer_id, bool_label(is_async)])
            .observe(as_millis(elapsed));
    }

    /// Start measuring handler processing time for one message.
    pub fn start_processing(
        &self,
        subject: &str,
        consumer_id: &str,
        is_async: bool,
    ) -> ProcessingTimer {
        ProcessingTimer {
            histogram: self.processing_time_ms.clone(),
            subject: subject.to_owned(),
            consumer_id: consumer_id.to_owned(),
            is_async,
            started: Instant::now(),
        }
    }

    /// Availability gauge for one endpoint/consumer pair.
    pub fn availability(&self, endpoint: &str, consumer_id: &str) -> IntGauge {
        self.availability
            .with_label_values(&[endpoint, consumer_id])
    }
}

/// Pending processing-latency observation. Consumed by [`ProcessingTimer::finish`].
#[derive(Debug)]
#[must_use = "the observation is only recorded by finish()"]
pub struct ProcessingTimer {
    histogram: HistogramVec,
    subject: String,
    consumer_id: String,
    is_async: bool,
    started: Instant,
}

impl ProcessingTimer {
    /// Record elapsed time, labeled by whether the handler failed.
    pub fn finish(self, is_err: bool) {
        self.histogram
            .with_label_values(&[
                self.subject.as_str(),
                self.consumer_id.as_str(),
                bool_label(self.is_async),
                bool_label(is_err),
            ])
            .observe(as_millis(self.started.elapsed()));
    }
}

/// Convert a broker timestamp in unix nanoseconds to `SystemTime`.
pub(crate) fn system_time_from_unix_nanos(nanos: i128) -> Option<SystemTime> {
    let nanos = u64::try_from(nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::from_nanos(nanos))
}

fn as_millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn bool_label(v: bool) -> &'static str {
    if v { "true" } else { "false" }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn histogram_count(registry: &Registry, name: &str) -> u64 {
        registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == name)
            .flat_map(|family| family.get_metric().iter())
            .map(|m| m.get_histogram().get_sample_count())
            .sum()
    }

    #[test]
    fn test_collectors_are_registered_and_exposed() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        metrics.observe_delivery("orders.created", "billing", SystemTime::now(), false);
        metrics
            .start_processing("orders.created", "billing", false)
            .finish(false);
        metrics.availability("nats://127.0.0.1:4222", "billing").set(1);

        let names = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect::<HashSet<_>>();
        for expected in [DELIVERY_TIME_METRIC, PROCESSING_TIME_METRIC, AVAILABILITY_METRIC] {
            assert!(names.contains(expected), "registered metric families: {names:?}");
        }
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        ClientMetrics::register(&registry).unwrap();
        assert!(ClientMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_delivery_latency_is_milliseconds() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        let published = SystemTime::now() - Duration::from_millis(1500);
        metrics.observe_delivery("orders.created", "billing", published, true);

        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == DELIVERY_TIME_METRIC)
            .unwrap();
        let histogram = family.get_metric()[0].get_histogram();
        assert_eq!(histogram.get_sample_count(), 1);
        // 1.5s must land between the 1000ms and 2500ms buckets
        assert!(histogram.get_sample_sum() >= 1500.0);
        assert!(histogram.get_sample_sum() < 2500.0);
    }

    #[test]
    fn test_processing_labels_error_flag() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        metrics
            .start_processing("orders.created", "billing", true)
            .finish(true);
        metrics
            .start_processing("orders.created", "billing", true)
            .finish(false);

        assert_eq!(histogram_count(&registry, PROCESSING_TIME_METRIC), 2);
        let families = registry.gather();
        let family = families
            .iter()
            .find(|f| f.get_name() == PROCESSING_TIME_METRIC)
            .unwrap();
        let is_err_values = family
            .get_metric()
            .iter()
            .flat_map(|m| m.get_label().iter())
            .filter(|l| l.get_name() == "is_err")
            .map(|l| l.get_value().to_string())
            .collect::<HashSet<_>>();
        assert_eq!(
            is_err_values,
            HashSet::from(["true".to_string(), "false".to_string()])
        );
    }

    #[test]
    fn test_future_timestamp_clamps_to_zero() {
        let registry = Registry::new();
        let metrics = ClientMetrics::register(&registry).unwrap();
        let published = SystemTime::now() + Duration::from_secs(60);
        metrics.observe_delivery("orders.created", "billing", published, false);
        assert_eq!(histogram_count(&registry, DELIVERY_TIME_METRIC), 1);
    }

    #[test]
    fn test_unix_nanos_conversion() {
        assert_eq!(system_time_from_unix_nanos(0), Some(UNIX_EPOCH));
        assert_eq!(
            system_time_from_unix_nanos(1_500_000_000),
            Some(UNIX_EPOCH + Duration::from_millis(1500))
        );
        assert_eq!(system_time_from_unix_nanos(-1), None);
    }
}
