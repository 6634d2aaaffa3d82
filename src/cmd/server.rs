use structopt::StructOpt;
use tracing::{event, Level};

use crate::{
    database::RedisPool, error::Error, graceful_shutdown::GracefulShutdown,
    manager::QueueManager, service_config::ServiceConfig,
};

#[derive(Debug, StructOpt)]
pub struct Args {
    #[structopt(
        long,
        help = "Optional prefix applied to every queue name, for namespacing shared stores"
    )]
    queue_prefix: Option<String>,
}

/// Host process for the queue engine. The REST surface drives the manager
/// from outside this crate; this process owns the engine lifecycle.
pub async fn main(args: Args) -> Result<(), Error> {
    crate::tracing_config::configure("queue-service");

    let config = ServiceConfig::from_env()?;
    let shutdown = GracefulShutdown::new();

    let redis_pool = RedisPool::new(config.redis_url(), args.queue_prefix)?;
    redis_pool.ping().await?;

    let queue_prefix = redis_pool.queue_prefix().map(str::to_string);
    let manager = QueueManager::new(redis_pool, config, shutdown.consumer());

    event!(Level::INFO, queue_prefix=?queue_prefix, "Queue service ready");

    let mut waiter = shutdown.consumer();
    waiter.wait_for_shutdown().await;

    event!(Level::INFO, "Shutting down");
    manager.stop_all_workers().await;

    Ok(())
}
