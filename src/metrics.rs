//! Driver Metrics
//!
//! Prometheus counters and histograms for every driver operation, kept in a
//! registry owned by the driver rather than the process-global default.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

const NAMESPACE: &str = "cinder_csi";

/// Operation outcome label value
pub fn outcome<T>(result: &Result<T>) -> String {
    match result {
        Ok(_) => "success".to_string(),
        Err(e) => e.kind().to_string(),
    }
}

/// Metrics for the node driver
#[derive(Clone)]
pub struct DriverMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl DriverMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Driver operations by outcome").namespace(NAMESPACE),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        // Attach waits run up to about a minute.
        let duration = HistogramVec::new(
            HistogramOpts::new(
                "operation_duration_seconds",
                "Duration of driver operations",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.05, 0.25, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    /// Record one finished operation
    pub fn observe<T>(&self, operation: &str, result: &Result<T>, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation, &outcome(result)])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Count of recorded operations with the given labels
    pub fn count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_labels_by_kind() {
        let metrics = DriverMetrics::new().unwrap();
        let ok: Result<()> = Ok(());
        let not_found: Result<()> = Err(Error::VolumeNotFound {
            volume_id: "v".into(),
        });

        metrics.observe("attach", &ok, Duration::from_millis(10));
        metrics.observe("attach", &ok, Duration::from_millis(10));
        metrics.observe("attach", &not_found, Duration::from_millis(10));

        assert_eq!(metrics.count("attach", "success"), 2);
        assert_eq!(metrics.count("attach", "not_found"), 1);

        let (content_type, body) = metrics.encode().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("cinder_csi_operations_total"));
        assert!(text.contains("cinder_csi_operation_duration_seconds"));
    }
}
