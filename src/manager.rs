use crate::{
    database::RedisPool,
    error::Error,
    graceful_shutdown::GracefulShutdownConsumer,
    queues::{
        HttpTaskProcessor, Job, JobOptions, JobProcessor, Queue, QueueSettings, QueueStats,
        WebhookConfig, Worker,
    },
    service_config::ServiceConfig,
    webhooks::{validate_webhook, WebhookDispatcher},
};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{event, Level};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub queues: usize,
    pub running_workers: usize,
    pub registered_processors: usize,
    pub default_concurrency: u32,
    pub default_retry_attempts: u32,
}

/// Process-wide registry of queues, workers, and processors. Owns no queue
/// state itself; everything durable lives in the store. Intended to be
/// constructed once and handed to the surfaces that drive it.
pub struct QueueManager(Arc<ManagerInner>);

impl Clone for QueueManager {
    fn clone(&self) -> QueueManager {
        QueueManager(self.0.clone())
    }
}

struct ManagerInner {
    pool: RedisPool,
    config: ServiceConfig,
    dispatcher: WebhookDispatcher,
    shutdown: GracefulShutdownConsumer,
    started_at: DateTime<Utc>,
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<String, Queue>,
    workers: HashMap<String, Worker>,
    processors: HashMap<String, Arc<dyn JobProcessor>>,
}

impl QueueManager {
    pub fn new(
        pool: RedisPool,
        config: ServiceConfig,
        shutdown: GracefulShutdownConsumer,
    ) -> QueueManager {
        let dispatcher =
            WebhookDispatcher::new(config.webhook_timeout, config.webhook_retry_attempts);
        QueueManager(Arc::new(ManagerInner {
            pool,
            config,
            dispatcher,
            shutdown,
            started_at: Utc::now(),
            registry: Mutex::new(Registry::default()),
        }))
    }

    /// Get or create the named queue. Settings apply only on first creation.
    pub fn create_queue(&self, name: &str, settings: Option<QueueSettings>) -> Queue {
        let mut registry = self.0.registry.lock().unwrap();
        if let Some(queue) = registry.queues.get(name) {
            return queue.clone();
        }

        let settings = settings.unwrap_or_else(|| QueueSettings {
            retry_delay: self.0.config.default_retry_delay,
            ..QueueSettings::default()
        });
        let full_name = self.0.pool.queue_name(name);

        let queue = Queue::new(self.0.pool.clone(), &full_name, settings);
        registry.queues.insert(name.to_string(), queue.clone());
        event!(Level::INFO, queue=%name, "Created queue");
        queue
    }

    pub fn get_queue(&self, name: &str) -> Option<Queue> {
        self.0.registry.lock().unwrap().queues.get(name).cloned()
    }

    /// Stop the queue's worker, delete its keys, and forget it entirely.
    pub async fn remove_queue(&self, name: &str) -> Result<bool, Error> {
        let (queue, worker) = {
            let mut registry = self.0.registry.lock().unwrap();
            let queue = match registry.queues.remove(name) {
                Some(queue) => queue,
                None => return Ok(false),
            };
            registry.processors.remove(name);
            (queue, registry.workers.remove(name))
        };

        if let Some(worker) = worker {
            worker.stop().await;
        }
        queue.clean().await?;

        event!(Level::INFO, queue=%name, "Removed queue");
        Ok(true)
    }

    /// Build a job and enqueue it. The queue must already exist; an invalid
    /// webhook configuration is rejected before anything is written.
    pub async fn add_job(
        &self,
        queue_name: &str,
        data: serde_json::Value,
        options: Option<JobOptions>,
        webhook: Option<WebhookConfig>,
    ) -> Result<Job, Error> {
        let queue = self
            .get_queue(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        if let Some(webhook) = &webhook {
            let problems = validate_webhook(webhook);
            if !problems.is_empty() {
                return Err(Error::InvalidWebhook(problems));
            }
        }

        let options = options.unwrap_or_else(|| JobOptions {
            max_attempts: self.0.config.default_retry_attempts,
            ..JobOptions::default()
        });

        let job = Job::new(queue.name(), data, options, webhook);
        queue.add(&job).await?;
        Ok(job)
    }

    pub fn register_processor(&self, queue_name: &str, processor: Arc<dyn JobProcessor>) {
        let mut registry = self.0.registry.lock().unwrap();
        if registry
            .processors
            .insert(queue_name.to_string(), processor)
            .is_some()
        {
            event!(Level::WARN, queue=%queue_name, "Replaced registered processor");
        }
    }

    /// Start a worker running the queue's registered processor. Returns
    /// false when a worker already runs for this queue.
    pub fn start_worker(&self, queue_name: &str, concurrency: Option<u32>) -> Result<bool, Error> {
        let mut registry = self.0.registry.lock().unwrap();
        let queue = registry
            .queues
            .get(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?
            .clone();
        if registry.workers.contains_key(queue_name) {
            return Ok(false);
        }
        let processor = registry
            .processors
            .get(queue_name)
            .ok_or_else(|| Error::NoProcessorRegistered(queue_name.to_string()))?
            .clone();

        let worker = Worker::new(
            queue,
            processor,
            self.0.dispatcher.clone(),
            concurrency,
            self.0.config.default_concurrency,
        );
        let handle = worker.start(self.0.shutdown.clone())?;
        registry
            .workers
            .insert(queue_name.to_string(), worker.clone());
        drop(registry);

        self.watch_worker(queue_name, worker, handle);
        Ok(true)
    }

    /// Start a worker whose processor is the built-in HTTP task dispatcher.
    /// No processor registration is needed.
    pub fn start_http_worker(
        &self,
        queue_name: &str,
        concurrency: Option<u32>,
    ) -> Result<bool, Error> {
        let mut registry = self.0.registry.lock().unwrap();
        let queue = registry
            .queues
            .get(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?
            .clone();
        if registry.workers.contains_key(queue_name) {
            return Ok(false);
        }

        let worker = Worker::new(
            queue,
            Arc::new(HttpTaskProcessor::new()),
            self.0.dispatcher.clone(),
            concurrency,
            self.0.config.default_concurrency,
        );
        let handle = worker.start(self.0.shutdown.clone())?;
        registry
            .workers
            .insert(queue_name.to_string(), worker.clone());
        drop(registry);

        self.watch_worker(queue_name, worker, handle);
        Ok(true)
    }

    /// Deregister the worker when its loops exit while it is still
    /// registered, so a replacement can be started.
    fn watch_worker(&self, queue_name: &str, worker: Worker, handle: JoinHandle<()>) {
        let manager = self.clone();
        let queue_name = queue_name.to_string();
        tokio::spawn(async move {
            handle.await.ok();

            let mut registry = manager.0.registry.lock().unwrap();
            let still_registered = registry
                .workers
                .get(&queue_name)
                .map(|registered| Worker::ptr_eq(registered, &worker))
                .unwrap_or(false);
            if still_registered {
                registry.workers.remove(&queue_name);
                event!(Level::WARN, queue=%queue_name, "Worker exited; deregistered");
            }
        });
    }

    pub async fn stop_worker(&self, queue_name: &str) -> bool {
        let worker = self.0.registry.lock().unwrap().workers.remove(queue_name);
        match worker {
            Some(worker) => {
                worker.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all_workers(&self) {
        let workers: Vec<Worker> = {
            let mut registry = self.0.registry.lock().unwrap();
            registry.workers.drain().map(|(_, worker)| worker).collect()
        };
        if workers.is_empty() {
            return;
        }

        event!(Level::INFO, count=%workers.len(), "Stopping all workers");
        join_all(workers.iter().map(|worker| worker.stop())).await;
    }

    pub async fn clean_all_queues(&self) -> Result<(), Error> {
        let queues: Vec<Queue> = {
            let registry = self.0.registry.lock().unwrap();
            registry.queues.values().cloned().collect()
        };
        for queue in queues {
            queue.clean().await?;
        }
        Ok(())
    }

    pub async fn get_stats(&self, queue_name: &str) -> Result<QueueStats, Error> {
        let queue = self
            .get_queue(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;
        queue.stats().await
    }

    pub async fn get_all_stats(&self) -> Result<HashMap<String, QueueStats>, Error> {
        let queues: Vec<(String, Queue)> = {
            let registry = self.0.registry.lock().unwrap();
            registry
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.clone()))
                .collect()
        };

        let mut stats = HashMap::with_capacity(queues.len());
        for (name, queue) in queues {
            stats.insert(name, queue.stats().await?);
        }
        Ok(stats)
    }

    pub fn get_system_info(&self) -> SystemInfo {
        let registry = self.0.registry.lock().unwrap();
        SystemInfo {
            service: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            started_at: self.0.started_at,
            uptime_seconds: (Utc::now() - self.0.started_at).num_seconds(),
            queues: registry.queues.len(),
            running_workers: registry
                .workers
                .values()
                .filter(|worker| worker.is_running())
                .count(),
            registered_processors: registry.processors.len(),
            default_concurrency: self.0.config.default_concurrency,
            default_retry_attempts: self.0.config.default_retry_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graceful_shutdown::GracefulShutdown;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn test_manager() -> QueueManager {
        let pool =
            RedisPool::new("redis://localhost:6379", None).expect("Creating connection pool");
        let shutdown = GracefulShutdown::new();
        QueueManager::new(pool, ServiceConfig::default(), shutdown.consumer())
    }

    #[tokio::test]
    async fn create_queue_is_idempotent() {
        let manager = test_manager();
        let first = manager.create_queue("emails", None);
        let second = manager.create_queue("emails", None);

        assert_eq!(first.name(), second.name());
        assert_eq!(manager.get_system_info().queues, 1);
    }

    #[tokio::test]
    async fn add_job_requires_an_existing_queue() {
        let manager = test_manager();
        let result = manager.add_job("missing", json!(null), None, None).await;
        assert_matches!(result, Err(Error::QueueNotFound(name)) if name == "missing");
    }

    #[tokio::test]
    async fn add_job_rejects_invalid_webhooks_before_writing() {
        let manager = test_manager();
        manager.create_queue("emails", None);

        let webhook = WebhookConfig::new("ftp://example.com/hook");
        let result = manager
            .add_job("emails", json!(null), None, Some(webhook))
            .await;
        assert_matches!(result, Err(Error::InvalidWebhook(problems)) if problems.len() == 1);
    }

    #[tokio::test]
    async fn start_worker_requires_queue_and_processor() {
        let manager = test_manager();

        assert_matches!(
            manager.start_worker("missing", None),
            Err(Error::QueueNotFound(_))
        );

        manager.create_queue("emails", None);
        assert_matches!(
            manager.start_worker("emails", None),
            Err(Error::NoProcessorRegistered(_))
        );
    }

    #[tokio::test]
    async fn remove_queue_forgets_unknown_names() {
        let manager = test_manager();
        assert!(!manager.remove_queue("missing").await.unwrap());
    }
}
