use opentelemetry::InstrumentationScope;
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, Metric as SdkMetric, MetricData, ResourceMetrics};
use opentelemetry_sdk::metrics::Temporality;

use super::{
    attributes_from_key_values, base_common_attributes, elapsed, epoch_millis,
    resource_attributes, INSTRUMENTATION_NAME, INSTRUMENTATION_VERSION,
};
use crate::newrelic::model::{
    Attributes, CommonBlock, Metric, MetricType, MetricValue, SummaryValue, WireBatch,
};

pub const UNIT: &str = "unit";
pub const DESCRIPTION: &str = "description";

/// Converts SDK metric collections into Metric API data points.
///
/// Monotonic delta sums become `count` metrics, every other sum and all gauges
/// become `gauge`, and histograms collapse into `summary` aggregates.
#[derive(Debug, Clone)]
pub struct MetricConverter {
    common: Attributes,
}

impl MetricConverter {
    pub fn new(common: &Attributes) -> Self {
        Self {
            common: common.clone(),
        }
    }

    pub fn adapt(&self, metrics: &ResourceMetrics) -> WireBatch<Metric> {
        let mut common = resource_attributes(metrics.resource());
        common.merge(&self.common);

        let mut records = Vec::new();
        for scope_metrics in metrics.scope_metrics() {
            let scope = scope_attributes(scope_metrics.scope());
            for metric in scope_metrics.metrics() {
                convert_metric(metric, &scope, &mut records);
            }
        }

        WireBatch::new(CommonBlock::new(base_common_attributes(&common)), records)
    }
}

fn scope_attributes(scope: &InstrumentationScope) -> Attributes {
    let mut attributes = Attributes::new();
    if !scope.name().is_empty() {
        attributes.put(INSTRUMENTATION_NAME, scope.name());
    }
    if let Some(version) = scope.version().filter(|v| !v.is_empty()) {
        attributes.put(INSTRUMENTATION_VERSION, version);
    }
    attributes
}

/// Strips UCUM annotation braces (`{request}` -> `request`).
pub fn normalize_unit(unit: &str) -> Option<String> {
    let unit: String = unit.chars().filter(|c| *c != '{' && *c != '}').collect();
    let unit = unit.trim();
    if unit.is_empty() {
        None
    } else {
        Some(unit.to_string())
    }
}

fn convert_metric(metric: &SdkMetric, scope: &Attributes, out: &mut Vec<Metric>) {
    let mut base = scope.clone();
    if let Some(unit) = normalize_unit(metric.unit()) {
        base.put(UNIT, unit);
    }
    if !metric.description().is_empty() {
        base.put(DESCRIPTION, metric.description());
    }

    let name = metric.name();
    match metric.data() {
        AggregatedMetrics::F64(data) => convert_data(name, &base, data, |v| v, out),
        AggregatedMetrics::U64(data) => convert_data(name, &base, data, |v| v as f64, out),
        AggregatedMetrics::I64(data) => convert_data(name, &base, data, |v| v as f64, out),
        #[allow(unreachable_patterns)]
        _ => tracing::debug!(metric = name, "skipping metric with unsupported value type"),
    }
}

fn point_attributes<'a>(
    base: &Attributes,
    point: impl IntoIterator<Item = &'a opentelemetry::KeyValue>,
) -> Attributes {
    let mut attributes = base.clone();
    attributes.merge(&attributes_from_key_values(point));
    attributes
}

/// Ingest rejects a request containing NaN or infinite values, so such points are dropped.
fn finite(name: &str, value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        tracing::debug!(metric = name, value, "skipping non-finite data point");
        None
    }
}

fn convert_data<T: Copy>(
    name: &str,
    base: &Attributes,
    data: &MetricData<T>,
    to_f64: fn(T) -> f64,
    out: &mut Vec<Metric>,
) {
    match data {
        MetricData::Gauge(gauge) => {
            let timestamp = epoch_millis(gauge.time());
            for point in gauge.data_points() {
                let Some(value) = finite(name, to_f64(point.value())) else {
                    continue;
                };
                out.push(
                    Metric::gauge(name, value, timestamp)
                        .with_attributes(point_attributes(base, point.attributes())),
                );
            }
        }
        MetricData::Sum(sum) => {
            let as_count = sum.is_monotonic() && sum.temporality() == Temporality::Delta;
            let interval = elapsed(sum.start_time(), sum.time());
            for point in sum.data_points() {
                let Some(value) = finite(name, to_f64(point.value())) else {
                    continue;
                };
                let attributes = point_attributes(base, point.attributes());
                let metric = if as_count {
                    let timestamp = epoch_millis(sum.start_time());
                    Metric::count(name, value, timestamp, interval)
                } else {
                    Metric::gauge(name, value, epoch_millis(sum.time()))
                };
                out.push(metric.with_attributes(attributes));
            }
        }
        MetricData::Histogram(histogram) => {
            let interval = elapsed(histogram.start_time(), histogram.time());
            for point in histogram.data_points() {
                let Some(sum) = finite(name, to_f64(point.sum())) else {
                    continue;
                };
                let value = SummaryValue {
                    count: point.count(),
                    sum,
                    min: point.min().map(to_f64),
                    max: point.max().map(to_f64),
                };
                let timestamp = epoch_millis(histogram.start_time());
                out.push(
                    summary(name, value, timestamp, interval.as_millis() as u64)
                        .with_attributes(point_attributes(base, point.attributes())),
                );
            }
        }
        MetricData::ExponentialHistogram(histogram) => {
            let interval = elapsed(histogram.start_time(), histogram.time());
            for point in histogram.data_points() {
                let Some(sum) = finite(name, to_f64(point.sum())) else {
                    continue;
                };
                let value = SummaryValue {
                    count: point.count() as u64,
                    sum,
                    min: point.min().map(to_f64),
                    max: point.max().map(to_f64),
                };
                let timestamp = epoch_millis(histogram.start_time());
                out.push(
                    summary(name, value, timestamp, interval.as_millis() as u64)
                        .with_attributes(point_attributes(base, point.attributes())),
                );
            }
        }
        #[allow(unreachable_patterns)]
        _ => tracing::debug!(metric = name, "skipping unsupported aggregation"),
    }
}

fn summary(name: &str, value: SummaryValue, timestamp: u64, interval_ms: u64) -> Metric {
    Metric {
        name: name.to_string(),
        metric_type: MetricType::Summary,
        value: MetricValue::Summary(value),
        timestamp,
        interval_ms: Some(interval_ms),
        attributes: Attributes::new(),
    }
}
