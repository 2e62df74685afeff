use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;

use crate::api::TelemetryProvider;
use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::resource::build_base_resource;

/// Provider for local development
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProvider;

impl TelemetryProvider for DefaultProvider {
    async fn build_tracer_provider(
        &self,
        config: &TelemetryConfig,
    ) -> Result<SdkTracerProvider, TelemetryError> {
        let resource = build_base_resource(config);

        match &config.otlp_endpoint {
            Some(endpoint) => otlp_provider(endpoint, resource),
            None => Ok(SdkTracerProvider::builder().with_resource(resource).build()),
        }
    }
}

#[cfg(feature = "otlp")]
fn otlp_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider, TelemetryError> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e: opentelemetry_otlp::ExporterBuildError| {
            TelemetryError::Exporter(e.to_string())
        })?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build())
}

#[cfg(not(feature = "otlp"))]
fn otlp_provider(endpoint: &str, resource: Resource) -> Result<SdkTracerProvider, TelemetryError> {
    tracing::warn!(endpoint, "OTLP export requires the `otlp` feature, spans will not be exported");
    Ok(SdkTracerProvider::builder().with_resource(resource).build())
}
