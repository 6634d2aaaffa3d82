pub mod cmd;
pub mod database;
pub mod error;
pub mod graceful_shutdown;
pub mod manager;
pub mod queues;
pub mod service_config;
pub mod tracing_config;
pub mod webhooks;
