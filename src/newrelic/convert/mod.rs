//! Conversion from OpenTelemetry SDK records to the ingest wire model.

mod metric;
mod span;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::Resource;

use crate::newrelic::model::{AttributeValue, Attributes};

pub use metric::MetricConverter;
pub use span::SpanConverter;

pub const INSTRUMENTATION_PROVIDER: &str = "instrumentation.provider";
pub const COLLECTOR_NAME: &str = "collector.name";
pub const PROVIDER_OPENTELEMETRY: &str = "opentelemetry";
pub const COLLECTOR_NAME_VALUE: &str = "newrelic-opentelemetry-exporter";

pub const INSTRUMENTATION_NAME: &str = "instrumentation.name";
pub const INSTRUMENTATION_VERSION: &str = "instrumentation.version";

/// Maps an OpenTelemetry value to an ingest attribute. Arrays are flattened to their display form.
pub fn attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Bool(v) => AttributeValue::Bool(*v),
        Value::I64(v) => AttributeValue::Int(*v),
        Value::F64(v) => AttributeValue::Double(*v),
        Value::String(v) => AttributeValue::String(v.as_str().to_string()),
        other => AttributeValue::String(other.to_string()),
    }
}

pub fn attributes_from_key_values<'a>(
    key_values: impl IntoIterator<Item = &'a KeyValue>,
) -> Attributes {
    let mut attributes = Attributes::new();
    for kv in key_values {
        attributes.put(kv.key.as_str(), attribute_value(&kv.value));
    }
    attributes
}

pub fn resource_attributes(resource: &Resource) -> Attributes {
    let mut attributes = Attributes::new();
    for (key, value) in resource.iter() {
        attributes.put(key.as_str(), attribute_value(value));
    }
    attributes
}

/// Milliseconds since the Unix epoch, truncated. Times before the epoch map to 0.
pub fn epoch_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Elapsed time between two instants, clamped at zero.
pub fn elapsed(start: SystemTime, end: SystemTime) -> Duration {
    end.duration_since(start).unwrap_or(Duration::ZERO)
}

/// Base common attributes every batch carries.
pub fn base_common_attributes(extra: &Attributes) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.merge(extra);
    attributes
        .put(INSTRUMENTATION_PROVIDER, PROVIDER_OPENTELEMETRY)
        .put(COLLECTOR_NAME, COLLECTOR_NAME_VALUE);
    attributes
}
