//! OpenTelemetry exporters for New Relic.
//!
//! Spans are sent to the New Relic Trace API and metrics to the Metric API,
//! using the New Relic JSON payload format. The crate plugs into the
//! OpenTelemetry SDK as a [`SpanExporter`](opentelemetry_sdk::trace::SpanExporter)
//! and a [`PushMetricExporter`](opentelemetry_sdk::metrics::exporter::PushMetricExporter),
//! and also offers a one-call setup that installs `tracing` with either
//! backend.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // New Relic if NEW_RELIC_API_KEY is set, local logs otherwise
//! let guard = opentelemetry_exporter_newrelic::init().await?;
//! // ...
//! guard.shutdown().await?;
//! ```
//!
//! # Using the Builder
//!
//! ```rust,ignore
//! use opentelemetry_exporter_newrelic::{newrelic::NewRelicConfig, TelemetryConfig};
//!
//! let config = TelemetryConfig::builder()
//!     .service_name("checkout")
//!     .service_version("1.0.0")
//!     .log_level("debug")
//!     .newrelic(NewRelicConfig::new(api_key))
//!     .json()
//!     .build();
//!
//! let guard = opentelemetry_exporter_newrelic::init_with_config(&config).await?;
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `OTEL_SERVICE_NAME` | Service name | `CARGO_PKG_NAME` |
//! | `OTEL_SERVICE_VERSION` | Service version | `CARGO_PKG_VERSION` |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP endpoint for the local backend | - |
//! | `NEW_RELIC_API_KEY` | Enables the New Relic backend | - |
//! | `NEW_RELIC_REGION` | `US` or `EU` | `US` |
//! | `RUST_LOG` | Log level filter | `info` |
//! | `LOG_FORMAT` | `pretty` or `json` | `pretty` |
//!
//! # Module Structure
//!
//! - [`api`]: provider trait, initialization and shutdown guard
//! - [`config`]: configuration types
//! - [`error`]: error types
//! - [`default`]: local provider
//! - [`newrelic`]: converters, batching, transport and exporters

pub mod api;
pub mod config;
pub mod default;
pub mod error;
pub mod newrelic;
pub mod resource;
pub mod trace;

pub use api::{init, init_with_config, init_with_provider, TelemetryGuard, TelemetryProvider};
pub use config::{LogFormat, TelemetryBackend, TelemetryConfig, TelemetryConfigBuilder};
pub use error::{ExportError, TelemetryError};
