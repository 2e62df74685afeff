use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;
use serde_json::{Map, Value};
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, TelemetryConfig};
use crate::error::TelemetryError;

/// Build the OpenTelemetry tracing layer
pub fn build_otel_layer<S>(
    provider: &SdkTracerProvider,
    service_name: &str,
) -> OpenTelemetryLayer<S, opentelemetry_sdk::trace::Tracer>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    let tracer = provider.tracer(service_name.to_string());
    tracing_opentelemetry::layer().with_tracer(tracer)
}

/// One JSON object per line, shaped the way New Relic log forwarding expects:
/// epoch-millisecond `timestamp`, `log.level`, `logger.name` and `message` at the root.
struct NewRelicJsonFormat;

impl<S, N> FormatEvent<S, N> for NewRelicJsonFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let mut record = Map::new();
        record.insert(
            "timestamp".into(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        record.insert("log.level".into(), Value::from(metadata.level().to_string()));
        record.insert("logger.name".into(), Value::from(metadata.target()));
        if let Some(thread) = std::thread::current().name() {
            record.insert("thread.name".into(), Value::from(thread));
        }

        if let Some(span) = ctx.lookup_current() {
            record.insert("span.name".into(), Value::from(span.name()));
        }

        event.record(&mut JsonVisitor(&mut record));

        let line = serde_json::to_string(&record).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// Collects event fields into a JSON map. Reserved keys are not overwritten.
struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl JsonVisitor<'_> {
    fn insert(&mut self, field: &tracing::field::Field, value: Value) {
        self.0.entry(field.name()).or_insert(value);
    }
}

impl tracing::field::Visit for JsonVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.insert(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, Value::from(value));
    }
}

/// JSON fmt layer for log forwarding
pub fn build_json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .event_format(NewRelicJsonFormat)
        .with_ansi(false)
}

/// Pretty fmt layer for human-readable output (local dev)
pub fn build_pretty_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    tracing_subscriber::fmt::layer()
        .pretty()
        .with_ansi(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
}

/// `RUST_LOG` if set, otherwise the configured level.
///
/// The exporter's own HTTP stack is silenced below `warn` so that delivery
/// requests are not traced and exported in a loop.
pub fn build_filter(config: &TelemetryConfig) -> EnvFilter {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    ["hyper", "hyper_util", "reqwest", "h2", "rustls"]
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(filter, |filter, directive| filter.add_directive(directive))
}

/// Installs the global tracer (and meter) providers and the tracing subscriber.
pub fn init_subscriber(
    tracer_provider: &SdkTracerProvider,
    meter_provider: Option<&SdkMeterProvider>,
    config: &TelemetryConfig,
) -> Result<(), TelemetryError> {
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    if let Some(meter_provider) = meter_provider {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
    }

    let otel_layer = build_otel_layer(tracer_provider, &config.service_name);
    let filter = build_filter(config);

    let registry = tracing_subscriber::registry().with(filter).with(otel_layer);
    let result = match config.log_format {
        LogFormat::Pretty => registry.with(build_pretty_layer()).try_init(),
        LogFormat::Json => registry.with(build_json_layer()).try_init(),
    };
    result.map_err(|e| TelemetryError::Init(e.to_string()))
}
