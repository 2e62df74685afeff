//! SDK-facing exporters.
//!
//! The SDK drives exporters from its own background threads and polls the
//! export future with a plain executor. Network I/O therefore runs on the
//! Tokio runtime captured when the exporter is built: each export spawns its
//! delivery onto that runtime and awaits the join handle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::ResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::Temporality;
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use opentelemetry_sdk::Resource;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{runtime_error, ExportError, TelemetryError};
use crate::newrelic::batch::{split_into_batches, BatchConfig};
use crate::newrelic::config::NewRelicConfig;
use crate::newrelic::convert::{MetricConverter, SpanConverter};
use crate::newrelic::model::{WireBatch, WireRecord};
use crate::newrelic::transport::Transport;

/// Splits a converted batch by the configured limits and sends every part on `runtime`.
async fn deliver<T: WireRecord>(
    transport: Arc<Transport>,
    runtime: Handle,
    wire: WireBatch<T>,
    limits: BatchConfig,
) -> Result<(), ExportError> {
    if wire.is_empty() {
        return Ok(());
    }
    let WireBatch { common, records } = wire;
    let total = records.len();
    let batches = split_into_batches(records, &common, &limits);

    runtime
        .spawn(async move {
            let parts = batches.len();
            for records in batches {
                transport.send(WireBatch::new(common.clone(), records)).await?;
            }
            debug!(kind = T::KIND.as_str(), records = total, parts, "export delivered");
            Ok::<(), ExportError>(())
        })
        .await
        .map_err(runtime_error)?
}

/// Builds New Relic exporters from one [`NewRelicConfig`].
#[derive(Debug, Clone)]
pub struct NewRelicExporterBuilder {
    config: NewRelicConfig,
    runtime: Option<Handle>,
}

impl NewRelicExporterBuilder {
    pub fn new(config: NewRelicConfig) -> Self {
        Self {
            config,
            runtime: None,
        }
    }

    /// Runtime used for network I/O. Defaults to the runtime current at build time.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn parts(&self) -> Result<(Arc<Transport>, Handle), TelemetryError> {
        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| {
                TelemetryError::Config(
                    "New Relic exporters must be built inside a Tokio runtime".to_string(),
                )
            })?,
        };
        let transport = Transport::new(&self.config)?;
        Ok((Arc::new(transport), runtime))
    }

    pub fn build_span_exporter(&self) -> Result<NewRelicSpanExporter, TelemetryError> {
        let (transport, runtime) = self.parts()?;
        Ok(NewRelicSpanExporter {
            transport,
            runtime,
            converter: SpanConverter::new(&self.config.common_attributes),
            limits: self.config.batch.clone(),
            is_shutdown: AtomicBool::new(false),
        })
    }

    pub fn build_metric_exporter(&self) -> Result<NewRelicMetricExporter, TelemetryError> {
        let (transport, runtime) = self.parts()?;
        Ok(NewRelicMetricExporter {
            transport,
            runtime,
            converter: MetricConverter::new(&self.config.common_attributes),
            limits: self.config.batch.clone(),
            is_shutdown: AtomicBool::new(false),
        })
    }
}

/// Sends SDK spans to the New Relic Trace API.
#[derive(Debug)]
pub struct NewRelicSpanExporter {
    transport: Arc<Transport>,
    runtime: Handle,
    converter: SpanConverter,
    limits: BatchConfig,
    is_shutdown: AtomicBool,
}

impl NewRelicSpanExporter {
    pub fn builder(config: NewRelicConfig) -> NewRelicExporterBuilder {
        NewRelicExporterBuilder::new(config)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }
}

impl SpanExporter for NewRelicSpanExporter {
    fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
        let wire = if self.is_shutdown() {
            Err(ExportError::Closed)
        } else {
            Ok(self.converter.adapt(&batch))
        };
        let transport = Arc::clone(&self.transport);
        let runtime = self.runtime.clone();
        let limits = self.limits.clone();

        async move {
            let wire = wire?;
            let spans = wire.len();
            deliver(transport, runtime, wire, limits).await.map_err(|e| {
                warn!(spans, error = %e, "failed to export spans to New Relic");
                OTelSdkError::from(e)
            })
        }
    }

    fn shutdown_with_timeout(&mut self, _timeout: Duration) -> OTelSdkResult {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            debug!("span exporter already shut down");
        }
        Ok(())
    }

    fn set_resource(&mut self, resource: &Resource) {
        self.converter.set_resource(resource);
    }
}

/// Sends SDK metric collections to the New Relic Metric API.
#[derive(Debug)]
pub struct NewRelicMetricExporter {
    transport: Arc<Transport>,
    runtime: Handle,
    converter: MetricConverter,
    limits: BatchConfig,
    is_shutdown: AtomicBool,
}

impl NewRelicMetricExporter {
    pub fn builder(config: NewRelicConfig) -> NewRelicExporterBuilder {
        NewRelicExporterBuilder::new(config)
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }
}

impl PushMetricExporter for NewRelicMetricExporter {
    fn export(&self, metrics: &ResourceMetrics) -> impl Future<Output = OTelSdkResult> + Send {
        let wire = if self.is_shutdown() {
            Err(ExportError::Closed)
        } else {
            Ok(self.converter.adapt(metrics))
        };
        let transport = Arc::clone(&self.transport);
        let runtime = self.runtime.clone();
        let limits = self.limits.clone();

        async move {
            let wire = wire?;
            let points = wire.len();
            deliver(transport, runtime, wire, limits).await.map_err(|e| {
                warn!(points, error = %e, "failed to export metrics to New Relic");
                OTelSdkError::from(e)
            })
        }
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown_with_timeout(&self, _timeout: Duration) -> OTelSdkResult {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            debug!("metric exporter already shut down");
        }
        Ok(())
    }

    /// Counts are reported per interval, so ask the SDK for deltas.
    fn temporality(&self) -> Temporality {
        Temporality::Delta
    }
}
