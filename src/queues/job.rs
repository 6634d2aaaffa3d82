use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_ATTEMPTS_LIMIT: u32 = 10;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Stalled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Stalled => "stalled",
        };
        f.write_str(s)
    }
}

/// HTTP methods allowed for webhooks and HTTP tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Post,
    Put,
    Patch,
}

impl Default for HttpMethod {
    fn default() -> Self {
        HttpMethod::Post
    }
}

impl HttpMethod {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobOptions {
    /// Maximum number of attempts, clamped to [1, 10] when the job is built.
    pub max_attempts: u32,
    /// Delay before the job becomes eligible to run, in milliseconds.
    pub delay_ms: u64,
    /// Reserved for priority scheduling; stored but not acted upon.
    pub priority: i32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_ms: 0,
            priority: 0,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// Where and how to report a job's terminal outcome. Timeout and retry
/// count fall back to the service-wide defaults when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        WebhookConfig {
            url: url.into(),
            method: HttpMethod::default(),
            headers: HashMap::new(),
            timeout_ms: None,
            retry_attempts: None,
        }
    }
}

/// A unit of work. The serialized form of this struct is what lives in the
/// queue's `jobs` hash; timestamps serialize as RFC3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    pub status: JobStatus,
    /// Count of failed attempts. A final successful attempt is not counted.
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
}

impl Job {
    pub fn new(
        queue_name: impl Into<String>,
        data: serde_json::Value,
        mut options: JobOptions,
        webhook: Option<WebhookConfig>,
    ) -> Job {
        options.max_attempts = options.max_attempts.max(1).min(MAX_ATTEMPTS_LIMIT);

        let status = if options.delay_ms > 0 {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        let max_attempts = options.max_attempts;
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            data,
            options,
            status,
            attempts: 0,
            max_attempts,
            progress: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            processed_at: None,
            completed_at: None,
            failed_at: None,
            webhook,
        }
    }

    /// The instant at which a delayed job becomes eligible to run.
    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.options.delay_ms as i64)
    }

    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.processed_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Record a failed attempt. `attempts` counts failures (and stalls); a
    /// successful attempt never increments it.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.failed_at = Some(Utc::now());
    }

    /// Account for a worker that went away while holding the job. The stalled
    /// attempt counts against `max_attempts`; the job either re-enters the
    /// waiting state (true) or fails terminally with a stall error (false).
    pub fn record_stall(&mut self) -> bool {
        self.status = JobStatus::Stalled;
        self.attempts += 1;
        if self.attempts < self.max_attempts {
            self.status = JobStatus::Waiting;
            self.processed_at = None;
            true
        } else {
            self.status = JobStatus::Failed;
            self.error = Some("job stalled".to_string());
            self.failed_at = Some(Utc::now());
            false
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.attempts < self.max_attempts
    }

    /// Put a failed job back into the waiting state. Returns false (and
    /// changes nothing) unless the job is actually retryable.
    pub fn reset_for_retry(&mut self) -> bool {
        if !self.can_retry() {
            return false;
        }

        self.status = JobStatus::Waiting;
        self.error = None;
        self.processed_at = None;
        true
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = Some(progress.min(100));
    }
}
