use crate::queues::{Job, WebhookConfig};

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use serde_json::json;
use tracing::{event, Level};

pub const WEBHOOK_USER_AGENT: &str = "queue-service-Webhook/1.0";

pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WEBHOOK_RETRY_ATTEMPTS: u32 = 3;

/// Cap on the delay between webhook delivery attempts.
pub const WEBHOOK_BACKOFF_CAP_MS: u64 = 30_000;

pub const WEBHOOK_TIMEOUT_MIN_MS: u64 = 1000;
pub const WEBHOOK_TIMEOUT_MAX_MS: u64 = 300_000;
pub const WEBHOOK_RETRY_ATTEMPTS_MAX: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WebhookEvent {
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WebhookEvent::JobCompleted => "job.completed",
            WebhookEvent::JobFailed => "job.failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a dispatch, covering every attempt that was made.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// The attempt that produced this outcome; 0 when no request was made.
    pub attempt: u32,
}

/// Check a webhook configuration, returning every violation found. Used
/// before dispatching and by callers offering a "test this webhook" path.
pub fn validate_webhook(webhook: &WebhookConfig) -> Vec<String> {
    let mut problems = Vec::new();

    if webhook.url.is_empty() {
        problems.push("url is required".to_string());
    } else if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
        problems.push("url must start with http:// or https://".to_string());
    }

    if let Some(timeout_ms) = webhook.timeout_ms {
        if !(WEBHOOK_TIMEOUT_MIN_MS..=WEBHOOK_TIMEOUT_MAX_MS).contains(&timeout_ms) {
            problems.push(format!(
                "timeoutMs must be between {} and {}, got {}",
                WEBHOOK_TIMEOUT_MIN_MS, WEBHOOK_TIMEOUT_MAX_MS, timeout_ms
            ));
        }
    }

    if let Some(retry_attempts) = webhook.retry_attempts {
        if retry_attempts > WEBHOOK_RETRY_ATTEMPTS_MAX {
            problems.push(format!(
                "retryAttempts must be at most {}, got {}",
                WEBHOOK_RETRY_ATTEMPTS_MAX, retry_attempts
            ));
        }
    }

    problems
}

/// Delay before retrying delivery attempt `attempt`: doubling from 1s,
/// capped, with +/-25% jitter.
pub fn webhook_backoff_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(16);
    let base = 1000u64
        .saturating_mul(1 << exp)
        .min(WEBHOOK_BACKOFF_CAP_MS) as i64;
    let jitter = rand::thread_rng().gen_range(-(base / 4)..=base / 4);
    (base + jitter).max(0) as u64
}

/// Delivers `job.completed` / `job.failed` events to caller-supplied
/// endpoints, with its own bounded retry. Delivery outcomes never feed back
/// into job state.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    default_timeout: Duration,
    default_retry_attempts: u32,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        WebhookDispatcher::new(
            Duration::from_millis(DEFAULT_WEBHOOK_TIMEOUT_MS),
            DEFAULT_WEBHOOK_RETRY_ATTEMPTS,
        )
    }
}

impl WebhookDispatcher {
    pub fn new(default_timeout: Duration, default_retry_attempts: u32) -> Self {
        WebhookDispatcher {
            client: reqwest::Client::new(),
            default_timeout,
            default_retry_attempts,
        }
    }

    pub async fn dispatch(
        &self,
        event_kind: WebhookEvent,
        job: &Job,
        webhook: &WebhookConfig,
    ) -> WebhookDelivery {
        let problems = validate_webhook(webhook);
        if !problems.is_empty() {
            event!(
                Level::WARN,
                job=%job.id, url=%webhook.url, problems=?problems,
                "Skipping webhook with invalid configuration"
            );
            return WebhookDelivery {
                success: false,
                status_code: None,
                response_data: None,
                error: Some(format!("invalid webhook configuration: {}", problems.join("; "))),
                duration_ms: 0,
                attempt: 0,
            };
        }

        let timeout = webhook
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let max_attempts = webhook.retry_attempts.unwrap_or(self.default_retry_attempts);

        let mut last = WebhookDelivery {
            success: false,
            status_code: None,
            response_data: None,
            error: Some("no delivery attempts configured".to_string()),
            duration_ms: 0,
            attempt: 0,
        };

        for attempt in 1..=max_attempts {
            let payload = webhook_payload(event_kind, job, attempt, max_attempts);
            last = self
                .send_once(webhook, timeout, payload.to_string(), attempt)
                .await;

            if last.success {
                event!(
                    Level::INFO,
                    job=%job.id, event=%event_kind, url=%webhook.url, attempt=%attempt,
                    "Webhook delivered"
                );
                return last;
            }

            event!(
                Level::WARN,
                job=%job.id, event=%event_kind, url=%webhook.url, attempt=%attempt,
                error=?last.error,
                "Webhook delivery attempt failed"
            );

            if attempt < max_attempts {
                tokio::time::sleep(Duration::from_millis(webhook_backoff_ms(attempt))).await;
            }
        }

        last
    }

    async fn send_once(
        &self,
        webhook: &WebhookConfig,
        timeout: Duration,
        body: String,
        attempt: u32,
    ) -> WebhookDelivery {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(WEBHOOK_USER_AGENT));
        for (name, value) in &webhook.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    event!(Level::WARN, header=%name, "Skipping invalid webhook header");
                }
            }
        }

        let started = Instant::now();
        let response = self
            .client
            .request(webhook.method.as_reqwest(), &webhook.url)
            .timeout(timeout)
            .headers(headers)
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let duration_ms = started.elapsed().as_millis() as u64;
                let response_data = if text.is_empty() {
                    None
                } else {
                    Some(
                        serde_json::from_str(&text)
                            .unwrap_or_else(|_| serde_json::Value::String(text)),
                    )
                };

                if status.is_success() {
                    WebhookDelivery {
                        success: true,
                        status_code: Some(status.as_u16()),
                        response_data,
                        error: None,
                        duration_ms,
                        attempt,
                    }
                } else {
                    WebhookDelivery {
                        success: false,
                        status_code: Some(status.as_u16()),
                        response_data,
                        error: Some(format!(
                            "HTTP {}: {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("unknown status")
                        )),
                        duration_ms,
                        attempt,
                    }
                }
            }
            Err(e) => WebhookDelivery {
                success: false,
                status_code: None,
                response_data: None,
                error: Some(e.to_string()),
                duration_ms: started.elapsed().as_millis() as u64,
                attempt,
            },
        }
    }
}

fn webhook_payload(
    event: WebhookEvent,
    job: &Job,
    attempt: u32,
    max_attempts: u32,
) -> serde_json::Value {
    let mut job_body = json!({
        "id": job.id,
        "queueName": job.queue_name,
        "status": job.status,
        "data": job.data,
        "attempts": job.attempts,
        "maxAttempts": job.max_attempts,
        "createdAt": job.created_at,
    });
    if let Some(result) = &job.result {
        job_body["result"] = result.clone();
    }
    if let Some(error) = &job.error {
        job_body["error"] = json!(error);
    }
    if let Some(processed_at) = &job.processed_at {
        job_body["processedAt"] = json!(processed_at);
    }
    if let Some(completed_at) = &job.completed_at {
        job_body["completedAt"] = json!(completed_at);
    }
    if let Some(failed_at) = &job.failed_at {
        job_body["failedAt"] = json!(failed_at);
    }

    json!({
        "event": event,
        "job": job_body,
        "timestamp": Utc::now(),
        "webhook": {
            "attempt": attempt,
            "maxAttempts": max_attempts,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::{HttpMethod, JobOptions};
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completed_job() -> Job {
        let mut job = Job::new("reports", json!({"x": 1}), JobOptions::default(), None);
        job.mark_active();
        job.mark_completed(json!({"rows": 10}));
        job
    }

    fn failed_job() -> Job {
        let mut job = Job::new(
            "reports",
            json!({"x": 1}),
            JobOptions {
                max_attempts: 1,
                ..JobOptions::default()
            },
            None,
        );
        job.mark_active();
        job.mark_failed("boom");
        job
    }

    fn hook(url: String) -> WebhookConfig {
        WebhookConfig::new(url)
    }

    #[test]
    fn validation_reports_each_violation() {
        let valid = WebhookConfig::new("https://example.com/hook");
        assert!(validate_webhook(&valid).is_empty());

        let missing_url = WebhookConfig::new("");
        assert_eq!(validate_webhook(&missing_url), vec!["url is required"]);

        let bad = WebhookConfig {
            timeout_ms: Some(50),
            retry_attempts: Some(99),
            ..WebhookConfig::new("ftp://example.com")
        };
        let problems = validate_webhook(&bad);
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("http://"));
        assert!(problems[1].contains("timeoutMs"));
        assert!(problems[2].contains("retryAttempts"));
    }

    #[test]
    fn backoff_stays_within_contract_bounds() {
        for attempt in 1..=10u32 {
            let base = (1000u64 * 2u64.pow(attempt - 1)).min(WEBHOOK_BACKOFF_CAP_MS);
            for _ in 0..100 {
                let delay = webhook_backoff_ms(attempt);
                assert!(delay >= base - base / 4);
                assert!(delay <= base + base / 4);
            }
        }
    }

    #[tokio::test]
    async fn delivers_on_first_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("User-Agent", WEBHOOK_USER_AGENT))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"received": true})))
            .expect(1)
            .mount(&server)
            .await;

        let job = completed_job();
        let delivery = WebhookDispatcher::default()
            .dispatch(
                WebhookEvent::JobCompleted,
                &job,
                &hook(format!("{}/hook", server.uri())),
            )
            .await;

        assert!(delivery.success);
        assert_eq!(delivery.status_code, Some(200));
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.response_data, Some(json!({"received": true})));

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["event"], json!("job.completed"));
        assert_eq!(body["job"]["id"], json!(job.id));
        assert_eq!(body["job"]["result"], json!({"rows": 10}));
        assert_eq!(body["webhook"], json!({"attempt": 1, "maxAttempts": 3}));
        chrono::DateTime::parse_from_rfc3339(body["timestamp"].as_str().unwrap())
            .expect("timestamp is RFC3339");
    }

    #[tokio::test]
    async fn failed_event_carries_the_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let job = failed_job();
        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobFailed, &job, &hook(server.uri()))
            .await;
        assert!(delivery.success);

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["event"], json!("job.failed"));
        assert_eq!(body["job"]["error"], json!("boom"));
        assert_eq!(body["job"]["attempts"], json!(1));
        assert_eq!(body["job"]["status"], json!("failed"));
        assert!(body["job"].get("result").is_none());
    }

    #[tokio::test]
    async fn retries_until_the_endpoint_recovers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let job = completed_job();
        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobCompleted, &job, &hook(server.uri()))
            .await;

        assert!(delivery.success);
        assert_eq!(delivery.attempt, 2);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let retry_body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
        assert_eq!(retry_body["webhook"]["attempt"], json!(2));
    }

    #[tokio::test]
    async fn reports_failure_after_exhausting_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let job = completed_job();
        let webhook = WebhookConfig {
            retry_attempts: Some(2),
            ..hook(server.uri())
        };
        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobCompleted, &job, &webhook)
            .await;

        assert!(!delivery.success);
        assert_eq!(delivery.attempt, 2);
        assert_eq!(delivery.status_code, Some(503));
        assert!(delivery.error.unwrap().starts_with("HTTP 503"));
    }

    #[tokio::test]
    async fn zero_retry_attempts_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let webhook = WebhookConfig {
            retry_attempts: Some(0),
            ..hook(server.uri())
        };
        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobCompleted, &completed_job(), &webhook)
            .await;

        assert!(!delivery.success);
        assert_eq!(delivery.attempt, 0);
    }

    #[tokio::test]
    async fn invalid_configuration_short_circuits() {
        let webhook = WebhookConfig::new("ftp://example.com/hook");
        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobCompleted, &completed_job(), &webhook)
            .await;

        assert!(!delivery.success);
        assert_eq!(delivery.attempt, 0);
        assert!(delivery.error.unwrap().contains("http://"));
    }

    #[tokio::test]
    async fn caller_headers_override_defaults() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("Content-Type", "application/vnd.custom+json"))
            .and(header("X-Signature", "abc123"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut webhook = hook(server.uri());
        webhook.method = HttpMethod::Put;
        webhook
            .headers
            .insert("Content-Type".to_string(), "application/vnd.custom+json".to_string());
        webhook
            .headers
            .insert("X-Signature".to_string(), "abc123".to_string());

        let delivery = WebhookDispatcher::default()
            .dispatch(WebhookEvent::JobCompleted, &completed_job(), &webhook)
            .await;
        assert!(delivery.success);
    }
}
