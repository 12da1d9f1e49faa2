// Telemetry module for structured logging and metrics

use crate::errors::EnqueueError;
use anyhow::Result;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize structured logging with JSON formatting
///
/// Log levels come from `RUST_LOG` when set, otherwise from configuration.
pub fn init_logging(log_level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;

    tracing::info!(
        log_level = log_level,
        "Structured logging initialized with JSON formatting"
    );

    Ok(())
}

/// Initialize the Prometheus metrics exporter and describe all metrics
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "fire_dispatched_total",
        "Total number of fires accepted by the execution engine"
    );
    describe_counter!(
        "fire_duplicate_total",
        "Total number of fires rejected by the dedup guard as already admitted"
    );
    describe_counter!(
        "dispatch_failed_total",
        "Total number of fires whose enqueue failed after the retry budget"
    );

    tracing::info!(
        metrics_port = metrics_port,
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a fire accepted by the execution engine
#[inline]
pub fn record_fire_dispatched(task_key: &str) {
    counter!("fire_dispatched_total", "task_key" => task_key.to_string()).increment(1);
}

/// Record a fire that lost the admission race
#[inline]
pub fn record_duplicate_fire(task_key: &str) {
    counter!("fire_duplicate_total", "task_key" => task_key.to_string()).increment(1);
}

/// Record a fire given up after the within-tick retry budget
#[inline]
pub fn record_dispatch_failure(task_key: &str, error: &EnqueueError) {
    let reason = match error {
        EnqueueError::Connection(_) => "connection",
        EnqueueError::Rejected(_) => "rejected",
        EnqueueError::SerializationFailed(_) => "serialization",
        EnqueueError::AckTimeout(_) => "ack_timeout",
    };
    counter!(
        "dispatch_failed_total",
        "task_key" => task_key.to_string(),
        "reason" => reason
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_valid_level() {
        // Either succeeds or the process already has a subscriber installed
        let result = init_logging("info");
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_metrics_recording_does_not_panic() {
        record_fire_dispatched("test-task");
        record_duplicate_fire("test-task");
        record_dispatch_failure(
            "test-task",
            &EnqueueError::Rejected("stream full".to_string()),
        );
    }
}
