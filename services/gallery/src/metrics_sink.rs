use anyhow::{Context, Result};
use tracing::info;

/// Counter-style metric emission tagged with a single label
#[cfg_attr(test, mockall::automock)]
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, tag_key: &str, tag_value: &str);
}

/// Sink that forwards to the globally installed `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderMetricsSink;

impl MetricsSink for RecorderMetricsSink {
    fn increment_counter(&self, name: &str, tag_key: &str, tag_value: &str) {
        metrics::counter!(name.to_string(), tag_key.to_string() => tag_value.to_string())
            .increment(1);
    }
}

/// Initialize Prometheus metrics exporter
pub fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
