//! Wire model for the New Relic Trace and Metric ingest APIs.
//!
//! Both APIs accept a JSON array of batches. Each batch has a `common` block
//! whose attributes apply to every record, and a list of records keyed by
//! the telemetry kind:
//!
//! ```json
//! [{"common": {"attributes": {"service.name": "api"}}, "spans": [ ... ]}]
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A single attribute value accepted by ingest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Attribute map. Later writes overwrite earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, AttributeValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value. Non-finite doubles are ignored since ingest cannot store them.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> &mut Self {
        let value = value.into();
        if let AttributeValue::Double(v) = value {
            if !v.is_finite() {
                return self;
            }
        }
        self.0.insert(key.into(), value);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.put(key, value);
        self
    }

    /// Copies every entry of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &Attributes) -> &mut Self {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }
}

/// The kind of records a batch carries. Selects endpoint, headers and JSON key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    Spans,
    Metrics,
}

impl TelemetryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spans => "spans",
            Self::Metrics => "metrics",
        }
    }
}

/// A record that can travel in a [`WireBatch`].
pub trait WireRecord: Serialize + Send + Sync + 'static {
    const KIND: TelemetryKind;
}

/// A converted span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub id: String,
    #[serde(rename = "trace.id")]
    pub trace_id: String,
    /// Start time, epoch milliseconds
    pub timestamp: u64,
    pub attributes: Attributes,
}

impl WireRecord for Span {
    const KIND: TelemetryKind = TelemetryKind::Spans;
}

/// Metric types understood by the Metric API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Gauge,
    Count,
    Summary,
}

/// Aggregate carried by a `summary` metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryValue {
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Summary(SummaryValue),
}

/// A converted metric data point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: MetricValue,
    /// Epoch milliseconds
    pub timestamp: u64,
    #[serde(rename = "interval.ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Attributes::is_empty")]
    pub attributes: Attributes,
}

impl Metric {
    pub fn gauge(name: impl Into<String>, value: f64, timestamp: u64) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Gauge,
            value: MetricValue::Number(value),
            timestamp,
            interval_ms: None,
            attributes: Attributes::new(),
        }
    }

    pub fn count(name: impl Into<String>, value: f64, timestamp: u64, interval: Duration) -> Self {
        Self {
            name: name.into(),
            metric_type: MetricType::Count,
            value: MetricValue::Number(value),
            timestamp,
            interval_ms: Some(interval.as_millis() as u64),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

impl WireRecord for Metric {
    const KIND: TelemetryKind = TelemetryKind::Metrics;
}

/// Attributes (and optionally timing) shared by every record of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommonBlock {
    pub attributes: Attributes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(rename = "interval.ms", skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

impl CommonBlock {
    pub fn new(attributes: Attributes) -> Self {
        Self {
            attributes,
            timestamp: None,
            interval_ms: None,
        }
    }
}

/// One request body's worth of records.
#[derive(Debug, Clone, PartialEq)]
pub struct WireBatch<T: WireRecord> {
    pub common: CommonBlock,
    pub records: Vec<T>,
}

impl<T: WireRecord> WireBatch<T> {
    pub fn new(common: CommonBlock, records: Vec<T>) -> Self {
        Self { common, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Splits the batch into two halves sharing the same common block.
    /// Returns `None` when the batch holds fewer than two records.
    pub fn split(mut self) -> Option<(Self, Self)> {
        if self.records.len() < 2 {
            return None;
        }
        let upper = self.records.split_off(self.records.len() / 2);
        let common = self.common.clone();
        Some((self, Self::new(common, upper)))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

struct BatchBody<'a, T: WireRecord>(&'a WireBatch<T>);

impl<T: WireRecord> Serialize for BatchBody<'_, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("common", &self.0.common)?;
        map.serialize_entry(T::KIND.as_str(), &self.0.records)?;
        map.end()
    }
}

impl<T: WireRecord> Serialize for WireBatch<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [BatchBody(self)].serialize(serializer)
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Success,
    Retryable {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// HTTP 413: resend as smaller batches
    TooLarge,
    /// Not worth retrying. `status` is absent when the request never left the client.
    Fatal {
        status: Option<u16>,
        reason: String,
    },
}
