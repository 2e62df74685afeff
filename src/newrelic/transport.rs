//! HTTP delivery of wire batches to the ingest APIs.
//!
//! Every request body is gzip-compressed JSON. Responses are classified into a
//! [`SendResult`]. Retryable failures back off exponentially, and a 413
//! splits the batch in half until the halves fit or a single record remains.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::ExportError;
use crate::newrelic::config::NewRelicConfig;
use crate::newrelic::model::{SendResult, TelemetryKind, WireBatch, WireRecord};

const API_KEY_HEADER: &str = "Api-Key";
const DATA_FORMAT_HEADER: &str = "Data-Format";
const DATA_FORMAT_VERSION_HEADER: &str = "Data-Format-Version";

/// Longest response body kept in an error message
const MAX_REASON_LEN: usize = 256;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = single attempt)
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Cap for both computed and server-requested delays
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retries without waiting. Meant for tests and local collectors.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before attempt `attempt` (0-indexed; the first attempt never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(0.0).powi(attempt as i32 - 1);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    fn delay_before(&self, attempt: u32, server_delay: Option<Duration>) -> Duration {
        match server_delay {
            Some(delay) => delay.min(self.max_delay),
            None => self.delay_for_attempt(attempt),
        }
    }
}

/// Maps an ingest response status to a [`SendResult`].
pub fn classify(status: StatusCode, retry_after: Option<Duration>) -> SendResult {
    if status.is_success() {
        return SendResult::Success;
    }
    let reason = status.to_string();
    match status {
        StatusCode::PAYLOAD_TOO_LARGE => SendResult::TooLarge,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => SendResult::Retryable {
            reason,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => SendResult::Retryable {
            reason,
            retry_after: None,
        },
        s if s.is_server_error() => SendResult::Retryable {
            reason,
            retry_after: None,
        },
        s => SendResult::Fatal {
            status: Some(s.as_u16()),
            reason,
        },
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn gzip(bytes: &[u8]) -> Result<Vec<u8>, ExportError> {
    let to_error = |e: std::io::Error| ExportError::Serialization(format!("gzip failed: {e}"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).map_err(to_error)?;
    encoder.finish().map_err(to_error)
}

enum Delivery {
    Sent,
    TooLarge,
}

/// Client for the Trace and Metric APIs.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    api_key: String,
    trace_url: String,
    metric_url: String,
    user_agent: String,
    retry: RetryConfig,
    audit_logging: bool,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("trace_url", &self.trace_url)
            .field("metric_url", &self.metric_url)
            .field("user_agent", &self.user_agent)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(config: &NewRelicConfig) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ExportError::Http(format!("failed to build http client: {e}")))?;

        let mut user_agent = format!("NewRelic-Rust-TelemetrySDK/{}", env!("CARGO_PKG_VERSION"));
        if let Some(product) = &config.product {
            user_agent.push(' ');
            user_agent.push_str(product);
        }

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            trace_url: config.trace_endpoint().to_string(),
            metric_url: config.metric_endpoint().to_string(),
            user_agent,
            retry: config.retry.clone(),
            audit_logging: config.audit_logging,
        })
    }

    pub fn endpoint(&self, kind: TelemetryKind) -> &str {
        match kind {
            TelemetryKind::Spans => &self.trace_url,
            TelemetryKind::Metrics => &self.metric_url,
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Delivers a batch, splitting on 413 and retrying transient failures.
    ///
    /// Stops at the first batch that cannot be delivered. Halves already
    /// accepted by ingest stay accepted.
    pub async fn send<T: WireRecord>(&self, batch: WireBatch<T>) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pending = vec![batch];
        while let Some(batch) = pending.pop() {
            let json = batch
                .to_json()
                .map_err(|e| ExportError::Serialization(e.to_string()))?;
            if self.audit_logging {
                trace!(
                    kind = T::KIND.as_str(),
                    payload = %String::from_utf8_lossy(&json),
                    "audit: sending payload"
                );
            }
            let body = gzip(&json)?;

            match self.send_with_retry(T::KIND, body).await? {
                Delivery::Sent => {
                    debug!(kind = T::KIND.as_str(), records = batch.len(), "batch delivered");
                }
                Delivery::TooLarge => {
                    let records = batch.len();
                    let (left, right) = batch.split().ok_or(ExportError::PayloadTooLarge)?;
                    debug!(kind = T::KIND.as_str(), records, "payload too large, splitting batch");
                    pending.push(right);
                    pending.push(left);
                }
            }
        }
        Ok(())
    }

    async fn send_with_retry(
        &self,
        kind: TelemetryKind,
        body: Vec<u8>,
    ) -> Result<Delivery, ExportError> {
        let max_attempts = self.retry.max_retries + 1;
        let mut server_delay = None;
        let mut last_reason = String::new();

        for attempt in 0..max_attempts {
            let delay = self.retry.delay_before(attempt, server_delay.take());
            if attempt > 0 && !delay.is_zero() {
                sleep(delay).await;
            }

            match self.attempt(kind, body.clone()).await {
                SendResult::Success => return Ok(Delivery::Sent),
                SendResult::TooLarge => return Ok(Delivery::TooLarge),
                SendResult::Fatal {
                    status: Some(status),
                    reason,
                } => return Err(ExportError::Rejected { status, reason }),
                SendResult::Fatal {
                    status: None,
                    reason,
                } => return Err(ExportError::Http(reason)),
                SendResult::Retryable {
                    reason,
                    retry_after,
                } => {
                    warn!(
                        kind = kind.as_str(),
                        attempt = attempt + 1,
                        max_attempts,
                        %reason,
                        "ingest request failed, will retry"
                    );
                    server_delay = retry_after;
                    last_reason = reason;
                }
            }
        }

        Err(ExportError::RetriesExhausted {
            attempts: max_attempts,
            last: last_reason,
        })
    }

    async fn attempt(&self, kind: TelemetryKind, body: Vec<u8>) -> SendResult {
        let mut request = self
            .client
            .post(self.endpoint(kind))
            .header(API_KEY_HEADER, &self.api_key)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header(USER_AGENT, &self.user_agent);
        if kind == TelemetryKind::Spans {
            request = request
                .header(DATA_FORMAT_HEADER, "newrelic")
                .header(DATA_FORMAT_VERSION_HEADER, "1");
        }

        let response = match request.body(body).send().await {
            Ok(response) => response,
            Err(e) if e.is_builder() => {
                return SendResult::Fatal {
                    status: None,
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                return SendResult::Retryable {
                    reason: e.to_string(),
                    retry_after: None,
                }
            }
        };

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        match classify(response.status(), retry_after) {
            SendResult::Fatal { status, reason } => {
                let body = response.text().await.unwrap_or_default();
                let detail: String = body.chars().take(MAX_REASON_LEN).collect();
                let reason = if detail.is_empty() {
                    reason
                } else {
                    format!("{reason}: {detail}")
                };
                SendResult::Fatal { status, reason }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::newrelic::model::{Attributes, CommonBlock, Metric, Span};
    use crate::newrelic::testing::{decode_body, mock_config, BufferWriter};
    use std::time::Instant;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spans(n: usize) -> WireBatch<Span> {
        let records = (0..n)
            .map(|i| Span {
                id: format!("{i:016x}"),
                trace_id: format!("{:032x}", 1),
                timestamp: 1_000,
                attributes: Attributes::new().with("name", format!("op-{i}")),
            })
            .collect();
        WireBatch::new(CommonBlock::new(Attributes::new().with("service.name", "svc")), records)
    }

    fn metrics(n: usize) -> WireBatch<Metric> {
        let records = (0..n).map(|i| Metric::gauge(format!("m{i}"), 1.0, 1_000)).collect();
        WireBatch::new(CommonBlock::default(), records)
    }

    async fn transport(server: &MockServer) -> Transport {
        Transport::new(&mock_config(&server.uri())).unwrap()
    }

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let retry = RetryConfig::default();

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(16));
    }

    #[test]
    fn server_delay_wins_but_is_capped() {
        let retry = RetryConfig::default();

        assert_eq!(retry.delay_before(1, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(retry.delay_before(1, Some(Duration::from_secs(120))), Duration::from_secs(16));
        assert_eq!(retry.delay_before(2, None), Duration::from_secs(2));
    }

    #[test]
    fn classify_covers_status_families() {
        assert_eq!(classify(StatusCode::ACCEPTED, None), SendResult::Success);
        assert_eq!(classify(StatusCode::PAYLOAD_TOO_LARGE, None), SendResult::TooLarge);
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            SendResult::Retryable { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT, None),
            SendResult::Retryable { .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, None),
            SendResult::Retryable { .. }
        ));
        assert!(matches!(
            classify(StatusCode::FORBIDDEN, None),
            SendResult::Fatal { status: Some(403), .. }
        ));
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, None),
            SendResult::Fatal { status: Some(400), .. }
        ));
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn user_agent_includes_product_token() {
        let config = mock_config("http://localhost").with_product("billing", "3.0");

        let transport = Transport::new(&config).unwrap();

        assert!(transport.user_agent().starts_with("NewRelic-Rust-TelemetrySDK/"));
        assert!(transport.user_agent().ends_with(" billing/3.0"));
    }

    #[tokio::test]
    async fn sends_gzipped_spans_with_trace_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/trace/v1"))
            .and(header("Api-Key", "test-api-key"))
            .and(header("Content-Encoding", "gzip"))
            .and(header("Data-Format", "newrelic"))
            .and(header("Data-Format-Version", "1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server).await.send(spans(2)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body = decode_body(&requests[0].body);
        assert_eq!(body[0]["common"]["attributes"]["service.name"], "svc");
        assert_eq!(body[0]["spans"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sends_metrics_without_data_format_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/metric/v1"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server).await.send(metrics(3)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("Data-Format").is_none());
        let body = decode_body(&requests[0].body);
        assert_eq!(body[0]["metrics"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn empty_batch_sends_nothing() {
        let server = MockServer::start().await;

        transport(&server).await.send(spans(0)).await.unwrap();

        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        transport(&server).await.send(spans(1)).await.unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn honours_retry_after_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        transport(&server).await.send(metrics(1)).await.unwrap();

        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retry_after_beyond_max_delay_is_capped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3600"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let retry = RetryConfig {
            max_retries: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 1.0,
        };
        let transport = Transport::new(&mock_config(&server.uri()).with_retry(retry)).unwrap();

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(30), transport.send(metrics(1)))
            .await
            .expect("send waited for the full Retry-After")
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport(&server).await.send(spans(1)).await.unwrap_err();

        assert!(matches!(err, ExportError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn fatal_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let err = transport(&server).await.send(spans(1)).await.unwrap_err();

        match err {
            ExportError::Rejected { status, reason } => {
                assert_eq!(status, 403);
                assert!(reason.contains("invalid key"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn splits_batch_on_payload_too_large() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        transport(&server).await.send(spans(4)).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
        let mut ids: Vec<String> = requests[1..]
            .iter()
            .flat_map(|r| {
                let body = decode_body(&r.body);
                let spans = body[0]["spans"].as_array().unwrap().clone();
                assert_eq!(spans.len(), 2);
                spans.into_iter().map(|s| s["id"].as_str().unwrap().to_string())
            })
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn single_record_too_large_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(413))
            .mount(&server)
            .await;

        let err = transport(&server).await.send(spans(1)).await.unwrap_err();

        assert_eq!(err, ExportError::PayloadTooLarge);
    }

    #[tokio::test]
    async fn connection_errors_are_retried() {
        let config = NewRelicConfig::new("key")
            .with_trace_url("http://127.0.0.1:1/trace/v1")
            .with_retry(RetryConfig::immediate(1));
        let transport = Transport::new(&config).unwrap();

        let err = transport.send(spans(1)).await.unwrap_err();

        assert!(matches!(err, ExportError::RetriesExhausted { attempts: 2, .. }));
    }

    async fn send_capturing_logs(audit_logging: bool) -> String {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        let config = mock_config(&server.uri()).with_audit_logging(audit_logging);
        let transport = Transport::new(&config).unwrap();
        let logs = BufferWriter::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_writer(logs.clone())
            .with_ansi(false)
            .finish();

        let _default = tracing::subscriber::set_default(subscriber);
        transport.send(spans(1)).await.unwrap();

        logs.contents()
    }

    #[tokio::test]
    async fn audit_logging_writes_payload_at_trace() {
        let logs = send_capturing_logs(true).await;

        let line = logs
            .lines()
            .find(|l| l.contains("audit: sending payload"))
            .expect("audit line");
        assert!(line.contains("TRACE"));
        assert!(line.contains("kind=\"spans\"") || line.contains("kind=spans"));
        assert!(line.contains("op-0"));
    }

    #[tokio::test]
    async fn payload_is_not_logged_without_audit_logging() {
        let logs = send_capturing_logs(false).await;

        assert!(logs.contains("batch delivered"));
        assert!(!logs.contains("audit: sending payload"));
        assert!(!logs.contains("op-0"));
    }
}
