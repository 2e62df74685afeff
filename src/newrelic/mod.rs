//! New Relic telemetry provider.
//!
//! Converts OpenTelemetry spans and metrics into the New Relic ingest format
//! and delivers them to the Trace API and Metric API over gzip-compressed
//! HTTP, with batching, retry and payload splitting.
//!
//! # Example
//!
//! ```rust,ignore
//! use opentelemetry_exporter_newrelic::newrelic::{NewRelicConfig, Region};
//!
//! let config = NewRelicConfig::new(api_key)
//!     .with_region(Region::Eu)
//!     .with_product("checkout", "2.1.0");
//!
//! // From environment variables
//! let config = NewRelicConfig::from_env().ok_or("NEW_RELIC_API_KEY not set")?;
//! ```
//!
//! # Environment Variables
//!
//! - `NEW_RELIC_API_KEY` / `NEW_RELIC_INSERT_KEY`: ingest key
//! - `NEW_RELIC_REGION`: `US` (default) or `EU`
//! - `NEW_RELIC_TRACE_URL` / `NEW_RELIC_METRIC_URL`: endpoint overrides
//! - `NEW_RELIC_AUDIT_LOGGING`: log payloads at trace level
//! - `NEW_RELIC_EXPORT_METRICS`: set to `false` to skip the metric pipeline

pub mod batch;
pub mod client;
pub mod config;
pub mod convert;
pub mod exporter;
pub mod model;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{BatchConfigBuilder, BatchSpanProcessor, SdkTracerProvider};
use tracing::info;

use crate::api::TelemetryProvider;
use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::resource::build_newrelic_resource;

pub use batch::{BatchBuffer, BatchConfig};
pub use client::{BufferedSender, SenderMetrics};
pub use config::{NewRelicConfig, Region};
pub use convert::{MetricConverter, SpanConverter};
pub use exporter::{NewRelicExporterBuilder, NewRelicMetricExporter, NewRelicSpanExporter};
pub use model::{Attributes, AttributeValue, CommonBlock, Metric, SendResult, Span, WireBatch};
pub use transport::{RetryConfig, Transport};

/// New Relic telemetry provider.
///
/// Spans go through the SDK batch processor to the Trace API. Metrics are
/// collected by a periodic reader and sent to the Metric API unless disabled.
pub struct NewRelicProvider {
    config: NewRelicConfig,
}

impl NewRelicProvider {
    pub fn new(config: NewRelicConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NewRelicConfig {
        &self.config
    }
}

impl TelemetryProvider for NewRelicProvider {
    async fn build_tracer_provider(
        &self,
        config: &TelemetryConfig,
    ) -> Result<SdkTracerProvider, TelemetryError> {
        let exporter = NewRelicExporterBuilder::new(self.config.clone()).build_span_exporter()?;

        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_scheduled_delay(self.config.batch.flush_interval)
                    .with_max_export_batch_size(self.config.batch.max_records)
                    .build(),
            )
            .build();

        info!(
            endpoint = self.config.trace_endpoint(),
            region = ?self.config.region,
            "exporting spans to New Relic"
        );

        Ok(SdkTracerProvider::builder()
            .with_span_processor(processor)
            .with_resource(build_newrelic_resource(config))
            .build())
    }

    async fn build_meter_provider(
        &self,
        config: &TelemetryConfig,
    ) -> Result<Option<SdkMeterProvider>, TelemetryError> {
        if !self.config.export_metrics {
            return Ok(None);
        }

        let exporter = NewRelicExporterBuilder::new(self.config.clone()).build_metric_exporter()?;
        let reader = PeriodicReader::builder(exporter)
            .with_interval(self.config.metric_interval)
            .build();

        info!(
            endpoint = self.config.metric_endpoint(),
            interval_secs = self.config.metric_interval.as_secs(),
            "exporting metrics to New Relic"
        );

        Ok(Some(
            SdkMeterProvider::builder()
                .with_reader(reader)
                .with_resource(build_newrelic_resource(config))
                .build(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newrelic::testing::{mock_config, test_telemetry_config};

    #[tokio::test]
    async fn builds_tracer_and_meter_providers() {
        let provider = NewRelicProvider::new(mock_config("http://localhost:9"));
        let config = test_telemetry_config();

        let tracer = provider.build_tracer_provider(&config).await;
        let meter = provider.build_meter_provider(&config).await.unwrap();

        assert!(tracer.is_ok());
        assert!(meter.is_some());
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let provider = NewRelicProvider::new(mock_config("http://localhost:9").with_metrics(false));

        let meter = provider
            .build_meter_provider(&test_telemetry_config())
            .await
            .unwrap();

        assert!(meter.is_none());
    }
}
