//! Default/local telemetry provider.
//!
//! Used when no New Relic API key is configured.
//!
//! # Behavior
//!
//! - With the `otlp` feature and `OTEL_EXPORTER_OTLP_ENDPOINT` set: exports
//!   spans to that collector over gRPC
//! - Otherwise: spans are recorded for local logs but not exported

mod provider;

pub use provider::DefaultProvider;
