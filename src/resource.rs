use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    HOST_NAME, SERVICE_INSTANCE_ID, SERVICE_NAME, SERVICE_VERSION,
};

use crate::config::TelemetryConfig;

/// Service identity attributes shared by every backend
pub fn base_attributes(config: &TelemetryConfig) -> Vec<KeyValue> {
    vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
    ]
}

pub fn build_base_resource(config: &TelemetryConfig) -> Resource {
    Resource::builder()
        .with_attributes(base_attributes(config))
        .build()
}

/// Base attributes plus `additional`; later keys win on conflict
pub fn build_resource(config: &TelemetryConfig, additional: Vec<KeyValue>) -> Resource {
    let mut attrs = base_attributes(config);
    attrs.extend(additional);
    Resource::builder().with_attributes(attrs).build()
}

/// Resource for the New Relic backend.
///
/// New Relic groups entities by `service.name` and shows `host.name` and
/// `service.instance.id` on the entity page, so both are filled from the
/// environment when available.
pub fn build_newrelic_resource(config: &TelemetryConfig) -> Resource {
    let mut attrs = Vec::new();
    if let Some(host) = host_name() {
        attrs.push(KeyValue::new(HOST_NAME, host.clone()));
        attrs.push(KeyValue::new(
            SERVICE_INSTANCE_ID,
            format!("{}@{}", config.service_name, host),
        ));
    }
    build_resource(config, attrs)
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.is_empty())
}
