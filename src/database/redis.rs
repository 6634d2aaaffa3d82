use crate::error::{Error, Result};
use std::{env, sync::Arc};

/// Connection pool for the Redis store, plus this process's queue-naming
/// policy. Every queue and worker shares one pool; cloning is cheap.
#[derive(Clone)]
pub struct RedisPool(Arc<RedisPoolInner>);

struct RedisPoolInner {
    pool: deadpool_redis::Pool,
    queue_prefix: Option<String>,
}

impl RedisPool {
    /// Connect to the store at `url`. When `queue_prefix` is set it is
    /// folded into every queue name created through this pool, namespacing
    /// the `queue:{name}:*` keys of deployments that share one store.
    pub fn new(url: impl Into<String>, queue_prefix: Option<String>) -> Result<RedisPool> {
        let pool = deadpool_redis::Config {
            url: Some(url.into()),
            connection: None,
            pool: None,
        }
        .create_pool()?;

        Ok(RedisPool(Arc::new(RedisPoolInner { pool, queue_prefix })))
    }

    /// Connect using the `REDIS_URL` environment variable. Used by the CLI
    /// and the test suites, which have no assembled service config.
    pub fn from_env() -> Result<RedisPool> {
        let url = env::var("REDIS_URL")
            .map_err(|_| Error::ConfigError("REDIS_URL is required".to_string()))?;
        RedisPool::new(url, None)
    }

    /// Check out a connection. Connections go back to the pool on drop;
    /// transient store failures surface here as `Error::RedisPoolError`.
    pub async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.0.pool.get().await.map_err(Error::from)
    }

    /// Round-trip a PING so a bad store configuration fails at startup
    /// rather than on the first enqueue.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }

    /// The store-level name for a queue, with the process prefix applied.
    pub fn queue_name(&self, name: &str) -> String {
        match &self.0.queue_prefix {
            Some(prefix) => format!("{}-{}", prefix, name),
            None => name.to_string(),
        }
    }

    pub fn queue_prefix(&self) -> Option<&str> {
        self.0.queue_prefix.as_deref()
    }
}
