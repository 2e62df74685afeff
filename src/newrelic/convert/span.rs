use opentelemetry::trace::{SpanId, SpanKind, Status};
use opentelemetry_sdk::trace::SpanData;
use opentelemetry_sdk::Resource;

use super::{
    attributes_from_key_values, base_common_attributes, elapsed, epoch_millis,
    resource_attributes, INSTRUMENTATION_NAME, INSTRUMENTATION_VERSION,
};
use crate::newrelic::model::{Attributes, CommonBlock, Span, WireBatch};

pub const NAME: &str = "name";
pub const PARENT_ID: &str = "parent.id";
pub const DURATION_MS: &str = "duration.ms";
pub const ERROR_MESSAGE: &str = "error.message";
pub const SPAN_KIND: &str = "span.kind";

/// Converts SDK spans into Trace API spans.
#[derive(Debug, Clone)]
pub struct SpanConverter {
    common: Attributes,
    resource: Attributes,
}

impl SpanConverter {
    pub fn new(common: &Attributes) -> Self {
        Self {
            common: base_common_attributes(common),
            resource: Attributes::new(),
        }
    }

    /// Resource attributes are copied onto every span, winning over span attributes.
    pub fn set_resource(&mut self, resource: &Resource) {
        self.resource = resource_attributes(resource);
    }

    pub fn common_block(&self) -> CommonBlock {
        CommonBlock::new(self.common.clone())
    }

    pub fn adapt(&self, spans: &[SpanData]) -> WireBatch<Span> {
        WireBatch::new(
            self.common_block(),
            spans.iter().map(|span| self.convert(span)).collect(),
        )
    }

    pub fn convert(&self, span: &SpanData) -> Span {
        let mut attributes = attributes_from_key_values(&span.attributes);

        if let Status::Error { description } = &span.status {
            if !description.is_empty() {
                attributes.put(ERROR_MESSAGE, description.to_string());
            }
        }

        let scope = &span.instrumentation_scope;
        if !scope.name().is_empty() {
            attributes.put(INSTRUMENTATION_NAME, scope.name());
        }
        if let Some(version) = scope.version().filter(|v| !v.is_empty()) {
            attributes.put(INSTRUMENTATION_VERSION, version);
        }

        attributes.put(SPAN_KIND, span_kind(&span.span_kind));
        attributes.merge(&self.resource);

        // intrinsics last so user attributes cannot shadow them
        if !span.name.is_empty() {
            attributes.put(NAME, span.name.to_string());
        }
        if span.parent_span_id != SpanId::INVALID {
            attributes.put(PARENT_ID, span.parent_span_id.to_string());
        }
        let duration = elapsed(span.start_time, span.end_time);
        attributes.put(DURATION_MS, duration.as_nanos() as f64 / 1_000_000.0);

        Span {
            id: span.span_context.span_id().to_string(),
            trace_id: span.span_context.trace_id().to_string(),
            timestamp: epoch_millis(span.start_time),
            attributes,
        }
    }
}

fn span_kind(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}
