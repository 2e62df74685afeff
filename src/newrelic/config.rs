use std::env;
use std::fmt;
use std::time::Duration;

use crate::newrelic::batch::BatchConfig;
use crate::newrelic::model::Attributes;
use crate::newrelic::transport::RetryConfig;

pub const US_TRACE_URL: &str = "https://trace-api.newrelic.com/trace/v1";
pub const US_METRIC_URL: &str = "https://metric-api.newrelic.com/metric/v1";
pub const EU_TRACE_URL: &str = "https://trace-api.eu.newrelic.com/trace/v1";
pub const EU_METRIC_URL: &str = "https://metric-api.eu.newrelic.com/metric/v1";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(60);

/// New Relic data center region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Us,
    Eu,
}

impl Region {
    pub fn trace_url(&self) -> &'static str {
        match self {
            Self::Us => US_TRACE_URL,
            Self::Eu => EU_TRACE_URL,
        }
    }

    pub fn metric_url(&self) -> &'static str {
        match self {
            Self::Us => US_METRIC_URL,
            Self::Eu => EU_METRIC_URL,
        }
    }

    /// Parses `US` / `EU`, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "us" => Some(Self::Us),
            "eu" => Some(Self::Eu),
            _ => None,
        }
    }
}

/// New Relic ingest configuration
#[derive(Clone, PartialEq)]
pub struct NewRelicConfig {
    pub api_key: String,
    pub region: Region,
    pub trace_url: Option<String>,
    pub metric_url: Option<String>,
    /// Added to the common block of every batch
    pub common_attributes: Attributes,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub request_timeout: Duration,
    /// Log every uncompressed payload at trace level
    pub audit_logging: bool,
    /// Extra `name/version` token appended to the User-Agent
    pub product: Option<String>,
    pub export_metrics: bool,
    pub metric_interval: Duration,
}

impl fmt::Debug for NewRelicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewRelicConfig")
            .field("api_key", &"<redacted>")
            .field("region", &self.region)
            .field("trace_url", &self.trace_url)
            .field("metric_url", &self.metric_url)
            .field("common_attributes", &self.common_attributes)
            .field("retry", &self.retry)
            .field("batch", &self.batch)
            .field("request_timeout", &self.request_timeout)
            .field("audit_logging", &self.audit_logging)
            .field("product", &self.product)
            .field("export_metrics", &self.export_metrics)
            .field("metric_interval", &self.metric_interval)
            .finish()
    }
}

impl NewRelicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            region: Region::default(),
            trace_url: None,
            metric_url: None,
            common_attributes: Attributes::new(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            audit_logging: false,
            product: None,
            export_metrics: true,
            metric_interval: DEFAULT_METRIC_INTERVAL,
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = region;
        self
    }

    pub fn with_trace_url(mut self, url: impl Into<String>) -> Self {
        self.trace_url = Some(url.into());
        self
    }

    pub fn with_metric_url(mut self, url: impl Into<String>) -> Self {
        self.metric_url = Some(url.into());
        self
    }

    pub fn with_common_attributes(mut self, attributes: Attributes) -> Self {
        self.common_attributes = attributes;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_audit_logging(mut self, enabled: bool) -> Self {
        self.audit_logging = enabled;
        self
    }

    pub fn with_product(mut self, name: &str, version: &str) -> Self {
        self.product = Some(format!("{name}/{version}"));
        self
    }

    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.export_metrics = enabled;
        self
    }

    pub fn with_metric_interval(mut self, interval: Duration) -> Self {
        self.metric_interval = interval;
        self
    }

    /// Explicit trace URL, or the region default
    pub fn trace_endpoint(&self) -> &str {
        self.trace_url.as_deref().unwrap_or(self.region.trace_url())
    }

    /// Explicit metric URL, or the region default
    pub fn metric_endpoint(&self) -> &str {
        self.metric_url.as_deref().unwrap_or(self.region.metric_url())
    }

    /// Create from environment variables
    /// - NEW_RELIC_API_KEY (or NEW_RELIC_INSERT_KEY) for the key; `None` when neither is set
    /// - NEW_RELIC_REGION: `US` (default) or `EU`
    /// - NEW_RELIC_TRACE_URL / NEW_RELIC_METRIC_URL override the region endpoints
    /// - NEW_RELIC_AUDIT_LOGGING=true logs payloads
    /// - NEW_RELIC_EXPORT_METRICS=false disables the metric pipeline
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("NEW_RELIC_API_KEY")
            .or_else(|_| env::var("NEW_RELIC_INSERT_KEY"))
            .ok()
            .filter(|key| !key.trim().is_empty())?;

        let mut config = Self::new(api_key);

        if let Some(region) = env::var("NEW_RELIC_REGION").ok().and_then(|r| Region::parse(&r)) {
            config.region = region;
        }
        config.trace_url = env::var("NEW_RELIC_TRACE_URL").ok();
        config.metric_url = env::var("NEW_RELIC_METRIC_URL").ok();
        config.audit_logging = env_flag("NEW_RELIC_AUDIT_LOGGING").unwrap_or(false);
        config.export_metrics = env_flag("NEW_RELIC_EXPORT_METRICS").unwrap_or(true);

        Some(config)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
