use super::{HttpMethod, Job, JobProcessor};

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{event, Level};

pub const HTTP_WORKER_USER_AGENT: &str = "queue-service-HttpWorker/1.0";

pub const JOB_ID_HEADER: &str = "x-queue-service-job-id";
pub const ATTEMPT_HEADER: &str = "x-queue-service-attempt";
pub const MAX_ATTEMPTS_HEADER: &str = "x-queue-service-max-attempts";

pub const DEFAULT_HTTP_TASK_TIMEOUT_MS: u64 = 30_000;

/// What an HTTP task's `data` must look like.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTaskPayload {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_HTTP_TASK_TIMEOUT_MS
}

/// The fixed processor behind HTTP-task workers: interprets the job payload
/// as an outbound HTTP call and performs it. Non-2xx responses and transport
/// errors fail the job, which puts it on the normal retry path.
pub struct HttpTaskProcessor {
    client: reqwest::Client,
}

impl Default for HttpTaskProcessor {
    fn default() -> Self {
        HttpTaskProcessor::new()
    }
}

impl HttpTaskProcessor {
    pub fn new() -> Self {
        HttpTaskProcessor {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl JobProcessor for HttpTaskProcessor {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, anyhow::Error> {
        let payload: HttpTaskPayload = serde_json::from_value(job.data.clone())
            .map_err(|e| anyhow!("Invalid HTTP task payload: {}", e))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(HTTP_WORKER_USER_AGENT));
        for (name, value) in &payload.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    event!(Level::WARN, job=%job.id, header=%name, "Skipping invalid task header");
                }
            }
        }

        // Correlation headers always win over caller-supplied ones.
        headers.insert(
            HeaderName::from_static(JOB_ID_HEADER),
            HeaderValue::from_str(&job.id).map_err(|e| anyhow!("Invalid job id header: {}", e))?,
        );
        headers.insert(
            HeaderName::from_static(ATTEMPT_HEADER),
            HeaderValue::from_str(&job.attempts.to_string())?,
        );
        headers.insert(
            HeaderName::from_static(MAX_ATTEMPTS_HEADER),
            HeaderValue::from_str(&job.max_attempts.to_string())?,
        );

        let mut request = self
            .client
            .request(payload.method.as_reqwest(), &payload.url)
            .timeout(Duration::from_millis(payload.timeout_ms))
            .headers(headers);
        if let Some(body) = &payload.body {
            request = request.body(serde_json::to_vec(body)?);
        }

        let started = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let duration_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(anyhow!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown status")
            ));
        }

        let response_data = if text.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };

        Ok(json!({
            "statusCode": status.as_u16(),
            "responseData": response_data,
            "durationMs": duration_ms,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::JobOptions;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_task_job(data: serde_json::Value) -> Job {
        Job::new("http-tasks", data, JobOptions::default(), None)
    }

    #[tokio::test]
    async fn successful_call_stores_status_and_body() {
        let server = MockServer::start().await;
        let job = http_task_job(json!({
            "url": format!("{}/ok", server.uri()),
            "body": {"x": 1},
        }));

        Mock::given(method("POST"))
            .and(path("/ok"))
            .and(header(JOB_ID_HEADER, job.id.as_str()))
            .and(header(ATTEMPT_HEADER, "0"))
            .and(header(MAX_ATTEMPTS_HEADER, "3"))
            .and(header("User-Agent", HTTP_WORKER_USER_AGENT))
            .and(body_json(json!({"x": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let result = HttpTaskProcessor::new().process(&job).await.unwrap();
        assert_eq!(result["statusCode"], json!(200));
        assert_eq!(result["responseData"], json!({"ok": true}));
        assert!(result["durationMs"].is_u64());
    }

    #[tokio::test]
    async fn non_2xx_fails_with_status_and_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let job = http_task_job(json!({"url": server.uri()}));
        let err = HttpTaskProcessor::new().process(&job).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 500: Internal Server Error");
    }

    #[tokio::test]
    async fn caller_headers_cannot_shadow_correlation_headers() {
        let server = MockServer::start().await;
        let job = http_task_job(json!({
            "url": server.uri(),
            "method": "PUT",
            "headers": {
                "Content-Type": "text/plain",
                "X-Queue-Service-Job-Id": "spoofed",
            },
        }));

        Mock::given(method("PUT"))
            .and(header("Content-Type", "text/plain"))
            .and(header(JOB_ID_HEADER, job.id.as_str()))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = HttpTaskProcessor::new().process(&job).await.unwrap();
        assert_eq!(result["statusCode"], json!(204));
        assert_eq!(result["responseData"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn non_json_response_bodies_are_kept_as_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("plain text"))
            .mount(&server)
            .await;

        let job = http_task_job(json!({"url": server.uri()}));
        let result = HttpTaskProcessor::new().process(&job).await.unwrap();
        assert_eq!(result["responseData"], json!("plain text"));
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_job() {
        let job = http_task_job(json!("not an object"));
        let err = HttpTaskProcessor::new().process(&job).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid HTTP task payload"));
    }

    #[tokio::test]
    async fn transport_errors_surface_their_text() {
        // Nothing listens on this port.
        let job = http_task_job(json!({
            "url": "http://127.0.0.1:9",
            "timeoutMs": 1000,
        }));
        let err = HttpTaskProcessor::new().process(&job).await.unwrap_err();
        assert!(!err.to_string().starts_with("HTTP "));
    }
}
