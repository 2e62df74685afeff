//! Helpers shared by the unit tests of this module.

use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use opentelemetry::trace::TracerProvider;
use opentelemetry::InstrumentationScope;
use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SdkTracerProvider, SpanData, SpanExporter};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::TelemetryConfig;
use crate::newrelic::config::NewRelicConfig;

/// Keeps every span handed to it.
#[derive(Debug, Clone, Default)]
pub(crate) struct CapturingExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl SpanExporter for CapturingExporter {
    fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
        self.spans.lock().unwrap().extend(batch);
        std::future::ready(Ok(()))
    }
}

pub(crate) type SdkTracer = <SdkTracerProvider as TracerProvider>::Tracer;

/// Runs `f` against a real SDK tracer and returns the finished spans.
pub(crate) fn record_spans(f: impl FnOnce(&SdkTracer)) -> Vec<SpanData> {
    let exporter = CapturingExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .build();
    let scope = InstrumentationScope::builder("test-lib")
        .with_version("1.2.0")
        .build();
    let tracer = provider.tracer_with_scope(scope);

    f(&tracer);

    let spans = exporter.spans.lock().unwrap().clone();
    spans
}

/// New Relic config pointing both endpoints at a mock server.
pub(crate) fn mock_config(base_url: &str) -> NewRelicConfig {
    NewRelicConfig::new("test-api-key")
        .with_trace_url(format!("{base_url}/trace/v1"))
        .with_metric_url(format!("{base_url}/metric/v1"))
        .with_retry(crate::newrelic::transport::RetryConfig::immediate(2))
}

pub(crate) fn test_telemetry_config() -> TelemetryConfig {
    TelemetryConfig::new("test-service", "1.0.0")
}

/// Decodes a gzip request body back into JSON.
pub(crate) fn decode_body(body: &[u8]) -> serde_json::Value {
    use std::io::Read;

    let mut decoder = flate2::read::GzDecoder::new(body);
    let mut json = String::new();
    decoder.read_to_string(&mut json).unwrap();
    serde_json::from_str(&json).unwrap()
}

/// In-memory sink for formatted log output.
#[derive(Clone, Default)]
pub(crate) struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl BufferWriter {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl io::Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for BufferWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
