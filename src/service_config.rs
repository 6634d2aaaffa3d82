use crate::error::Error;
use std::{env, str::FromStr, time::Duration};

pub const DEFAULT_CONCURRENCY: u32 = 5;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

fn required(name: &str) -> Result<String, Error> {
    env::var(name).map_err(|_| Error::ConfigError(format!("{} is required", name)))
}

fn with_default<T: FromStr>(name: &str, default: T) -> Result<T, Error> {
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|_| Error::ConfigError(format!("Failed to parse {}={}", name, value))),
        Err(_) => Ok(default),
    }
}

/// Service configuration, read once at startup. Missing `REDIS_HOST` or
/// `API_TOKEN` is a fatal startup error.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<String>,
    pub redis_db: i64,

    /// Consumed by the REST collaborator sitting in front of the manager.
    pub api_token: String,

    pub default_concurrency: u32,
    pub default_retry_attempts: u32,
    pub default_retry_delay: Duration,
    pub webhook_timeout: Duration,
    pub webhook_retry_attempts: u32,
}

impl ServiceConfig {
    pub fn from_env() -> Result<ServiceConfig, Error> {
        Ok(ServiceConfig {
            redis_host: required("REDIS_HOST")?,
            redis_port: with_default("REDIS_PORT", 6379)?,
            redis_password: env::var("REDIS_PASSWORD").ok(),
            redis_db: with_default("REDIS_DB", 0)?,
            api_token: required("API_TOKEN")?,
            default_concurrency: with_default("DEFAULT_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            default_retry_attempts: with_default("DEFAULT_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS)?,
            default_retry_delay: Duration::from_millis(with_default(
                "DEFAULT_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )?),
            webhook_timeout: Duration::from_millis(with_default(
                "WEBHOOK_TIMEOUT_MS",
                crate::webhooks::DEFAULT_WEBHOOK_TIMEOUT_MS,
            )?),
            webhook_retry_attempts: with_default(
                "WEBHOOK_RETRY_ATTEMPTS",
                crate::webhooks::DEFAULT_WEBHOOK_RETRY_ATTEMPTS,
            )?,
        })
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }
}

impl Default for ServiceConfig {
    /// Defaults for tests and embedding; production config comes from
    /// `from_env`.
    fn default() -> Self {
        ServiceConfig {
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            redis_db: 0,
            api_token: String::new(),
            default_concurrency: DEFAULT_CONCURRENCY,
            default_retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            default_retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            webhook_timeout: Duration::from_millis(crate::webhooks::DEFAULT_WEBHOOK_TIMEOUT_MS),
            webhook_retry_attempts: crate::webhooks::DEFAULT_WEBHOOK_RETRY_ATTEMPTS,
        }
    }
}
