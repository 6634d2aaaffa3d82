use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Redis error {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Redis connection error {0}")]
    RedisPoolError(#[from] deadpool::managed::PoolError<::redis::RedisError>),

    #[error("Redis pool creation error {0}")]
    RedisPoolCreationError(#[from] deadpool_redis::CreatePoolError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No queue named {0}")]
    QueueNotFound(String),

    #[error("No processor registered for queue {0}")]
    NoProcessorRegistered(String),

    #[error("A worker is already running for queue {0}")]
    WorkerAlreadyRunning(String),

    #[error("Invalid webhook configuration: {}", .0.join("; "))]
    InvalidWebhook(Vec<String>),
}

pub type Result<T> = std::result::Result<T, Error>;
