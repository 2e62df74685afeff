use std::future::Future;

use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::warn;

use crate::config::{TelemetryBackend, TelemetryConfig};
use crate::default::DefaultProvider;
use crate::error::TelemetryError;
use crate::newrelic::NewRelicProvider;
use crate::trace::init_subscriber;

/// Trait for telemetry backends (New Relic, local, etc.)
pub trait TelemetryProvider: Send + Sync {
    /// Build the tracer provider for this backend
    fn build_tracer_provider(
        &self,
        config: &TelemetryConfig,
    ) -> impl Future<Output = Result<SdkTracerProvider, TelemetryError>> + Send;

    /// Build the meter provider, if this backend exports metrics
    fn build_meter_provider(
        &self,
        _config: &TelemetryConfig,
    ) -> impl Future<Output = Result<Option<SdkMeterProvider>, TelemetryError>> + Send {
        async { Ok(None) }
    }
}

/// Owns the installed providers. Call [`TelemetryGuard::shutdown`] before exit
/// so that buffered spans and metrics are delivered.
#[derive(Debug)]
pub struct TelemetryGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    pub fn new(tracer_provider: SdkTracerProvider, meter_provider: Option<SdkMeterProvider>) -> Self {
        Self {
            tracer_provider,
            meter_provider,
        }
    }

    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.tracer_provider
    }

    pub fn meter_provider(&self) -> Option<&SdkMeterProvider> {
        self.meter_provider.as_ref()
    }

    /// Flushes and shuts down both providers on a blocking thread.
    ///
    /// Provider shutdown blocks until the final export finishes, and that
    /// export runs on this runtime, so it must not block a runtime thread.
    pub async fn shutdown(self) -> Result<(), TelemetryError> {
        tokio::task::spawn_blocking(move || self.shutdown_blocking())
            .await
            .map_err(|e| TelemetryError::Init(format!("shutdown task failed: {e}")))?
    }

    /// Shuts down from a thread that is not driving the exporters' runtime.
    pub fn shutdown_blocking(self) -> Result<(), TelemetryError> {
        let metrics = match &self.meter_provider {
            Some(provider) => provider.shutdown(),
            None => Ok(()),
        };
        let traces = self.tracer_provider.shutdown();
        if let Err(e) = &metrics {
            warn!(error = %e, "meter provider shutdown failed");
        }
        traces?;
        metrics?;
        Ok(())
    }
}

/// Initialize telemetry with a specific provider
pub async fn init_with_provider<P: TelemetryProvider>(
    provider: &P,
    config: &TelemetryConfig,
) -> Result<TelemetryGuard, TelemetryError> {
    let tracer_provider = provider.build_tracer_provider(config).await?;
    let meter_provider = provider.build_meter_provider(config).await?;
    init_subscriber(&tracer_provider, meter_provider.as_ref(), config)?;
    Ok(TelemetryGuard::new(tracer_provider, meter_provider))
}

/// Initialize telemetry with config (uses backend from config)
pub async fn init_with_config(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    match &config.backend {
        TelemetryBackend::Local => init_with_provider(&DefaultProvider, config).await,
        TelemetryBackend::NewRelic(newrelic) => {
            let provider = NewRelicProvider::new(newrelic.clone());
            init_with_provider(&provider, config).await
        }
    }
}

/// Initialize telemetry from environment (New Relic when an API key is set)
pub async fn init() -> Result<TelemetryGuard, TelemetryError> {
    let config = TelemetryConfig::from_env();
    init_with_config(&config).await
}
