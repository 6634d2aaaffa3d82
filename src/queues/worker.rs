use super::{Job, JobStatus, Queue};
use crate::{
    error::Error,
    graceful_shutdown::GracefulShutdownConsumer,
    webhooks::{WebhookDispatcher, WebhookEvent},
};

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{event, Level};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const STORE_ERROR_PAUSE: Duration = Duration::from_secs(5);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Something that can execute jobs from a queue. Implementations must be
/// safe to call from many consumer tasks at once.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<serde_json::Value, anyhow::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Idle,
    Running,
    Stopping,
}

/// A pool of consumers draining one queue, plus a periodic sweeper that
/// promotes delayed jobs and reclaims stalled ones.
pub struct Worker(Arc<WorkerInner>);

impl Clone for Worker {
    fn clone(&self) -> Worker {
        Worker(self.0.clone())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.0.queue.name())
            .field("concurrency", &self.0.concurrency)
            .finish()
    }
}

struct WorkerInner {
    queue: Queue,
    processor: Arc<dyn JobProcessor>,
    dispatcher: WebhookDispatcher,
    concurrency: u32,
    state: Mutex<StateInner>,
    /// Ids currently being processed. Observational: `stop` polls it while
    /// draining, and admin surfaces report its size.
    active_jobs: Mutex<HashSet<String>>,
}

struct StateInner {
    state: WorkerState,
    closer: Option<watch::Sender<bool>>,
    /// Incremented per start; lets a finished run's supervisor avoid
    /// clobbering the state of a newer run.
    generation: u64,
}

impl Worker {
    /// Effective concurrency is the explicit argument, else the queue's
    /// setting, else the service default.
    pub fn new(
        queue: Queue,
        processor: Arc<dyn JobProcessor>,
        dispatcher: WebhookDispatcher,
        concurrency: Option<u32>,
        default_concurrency: u32,
    ) -> Worker {
        let concurrency = concurrency
            .or(queue.settings().concurrency)
            .unwrap_or(default_concurrency)
            .max(1);

        Worker(Arc::new(WorkerInner {
            queue,
            processor,
            dispatcher,
            concurrency,
            state: Mutex::new(StateInner {
                state: WorkerState::Idle,
                closer: None,
                generation: 0,
            }),
            active_jobs: Mutex::new(HashSet::new()),
        }))
    }

    pub fn concurrency(&self) -> u32 {
        self.0.concurrency
    }

    pub fn queue_name(&self) -> &str {
        self.0.queue.name()
    }

    pub fn active_count(&self) -> usize {
        self.0.active_jobs.lock().unwrap().len()
    }

    pub fn is_running(&self) -> bool {
        self.0.state.lock().unwrap().state == WorkerState::Running
    }

    /// Whether two handles refer to the same worker.
    pub fn ptr_eq(a: &Worker, b: &Worker) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Launch the sweeper and the consumer loops. The returned handle
    /// resolves once every loop has exited, which the manager watches to
    /// notice dead workers.
    pub fn start(&self, shutdown: GracefulShutdownConsumer) -> Result<JoinHandle<()>, Error> {
        let (closer_rx, generation) = {
            let mut state = self.0.state.lock().unwrap();
            if state.state != WorkerState::Idle {
                return Err(Error::WorkerAlreadyRunning(
                    self.0.queue.name().to_string(),
                ));
            }
            state.state = WorkerState::Running;
            state.generation += 1;
            let (closer_tx, closer_rx) = watch::channel(false);
            state.closer = Some(closer_tx);
            (closer_rx, state.generation)
        };

        event!(
            Level::INFO,
            queue=%self.0.queue.name(), concurrency=%self.0.concurrency,
            "Starting worker"
        );

        let sweeper = tokio::spawn(sweeper_loop(
            self.0.clone(),
            closer_rx.clone(),
            shutdown.clone(),
        ));

        let consumers: Vec<JoinHandle<()>> = (0..self.0.concurrency)
            .map(|consumer| {
                tokio::spawn(consumer_loop(
                    self.0.clone(),
                    closer_rx.clone(),
                    shutdown.clone(),
                    consumer,
                ))
            })
            .collect();

        let inner = self.0.clone();
        let supervisor = tokio::spawn(async move {
            for result in join_all(consumers).await {
                if let Err(e) = result {
                    event!(Level::ERROR, queue=%inner.queue.name(), error=%e, "Consumer task panicked");
                }
            }
            if let Err(e) = sweeper.await {
                event!(Level::ERROR, queue=%inner.queue.name(), error=%e, "Sweeper task panicked");
            }

            let mut state = inner.state.lock().unwrap();
            if state.generation == generation {
                state.state = WorkerState::Idle;
                state.closer = None;
            }
            event!(Level::INFO, queue=%inner.queue.name(), "Worker loops exited");
        });

        Ok(supervisor)
    }

    /// Flag every loop to stop and wait up to 30 seconds for in-flight jobs
    /// to drain. In-flight processor calls are never interrupted; their
    /// terminal writes still apply even if the grace period elapses.
    pub async fn stop(&self) {
        {
            let mut state = self.0.state.lock().unwrap();
            match state.state {
                WorkerState::Idle => return,
                WorkerState::Stopping => return,
                WorkerState::Running => state.state = WorkerState::Stopping,
            }
            if let Some(closer) = &state.closer {
                closer.send(true).ok();
            }
        }

        event!(Level::INFO, queue=%self.0.queue.name(), "Stopping worker");

        let deadline = tokio::time::Instant::now() + STOP_GRACE_PERIOD;
        loop {
            if self.0.active_jobs.lock().unwrap().is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.0.active_jobs.lock().unwrap().len();
                event!(
                    Level::WARN,
                    queue=%self.0.queue.name(), remaining=%remaining,
                    "Stop grace period elapsed with jobs still in flight"
                );
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        let mut state = self.0.state.lock().unwrap();
        if state.state == WorkerState::Stopping {
            state.state = WorkerState::Idle;
        }
    }
}

async fn sweeper_loop(
    inner: Arc<WorkerInner>,
    mut closer: watch::Receiver<bool>,
    mut shutdown: GracefulShutdownConsumer,
) {
    let shutdown_fut = shutdown.wait_for_shutdown();
    tokio::pin!(shutdown_fut);

    let mut interval = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown_fut => break,
            changed = closer.changed() => {
                if changed.is_err() || *closer.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {},
        };

        match inner.queue.promote_delayed().await {
            Ok(count) => {
                if count > 0 {
                    event!(Level::INFO, queue=%inner.queue.name(), count=%count, "Promoted delayed jobs");
                }
            }
            Err(e) => {
                event!(Level::ERROR, queue=%inner.queue.name(), error=%e, "Error promoting delayed jobs");
            }
        }

        if let Some(older_than) = inner.queue.settings().stalled_timeout {
            match inner.queue.reclaim_stalled(older_than).await {
                Ok(count) => {
                    if count > 0 {
                        event!(Level::WARN, queue=%inner.queue.name(), count=%count, "Reclaimed stalled jobs");
                    }
                }
                Err(e) => {
                    event!(Level::ERROR, queue=%inner.queue.name(), error=%e, "Error reclaiming stalled jobs");
                }
            }
        }
    }
}

async fn consumer_loop(
    inner: Arc<WorkerInner>,
    closer: watch::Receiver<bool>,
    mut shutdown: GracefulShutdownConsumer,
    consumer: u32,
) {
    // The stop flag is observed between jobs; `next` blocks at most a second
    // so a stop request is noticed promptly without interrupting work.
    while !*closer.borrow() && !shutdown.shutting_down() {
        match inner.queue.next().await {
            Ok(Some(job)) => {
                process_one(&inner, job).await;
            }
            Ok(None) => {}
            Err(e) => {
                event!(
                    Level::ERROR,
                    queue=%inner.queue.name(), consumer=%consumer, error=%e,
                    "Error claiming job"
                );
                tokio::time::sleep(STORE_ERROR_PAUSE).await;
            }
        }
    }
}

async fn process_one(inner: &Arc<WorkerInner>, mut job: Job) {
    inner.active_jobs.lock().unwrap().insert(job.id.clone());

    match inner.processor.process(&job).await {
        Ok(result) => match inner.queue.complete(&mut job, result).await {
            Ok(()) => {
                if let Some(webhook) = job.webhook.clone() {
                    let delivery = inner
                        .dispatcher
                        .dispatch(WebhookEvent::JobCompleted, &job, &webhook)
                        .await;
                    if !delivery.success {
                        event!(
                            Level::WARN,
                            queue=%inner.queue.name(), job=%job.id, error=?delivery.error,
                            "Completion webhook was not delivered"
                        );
                    }
                }
            }
            Err(e) => {
                event!(
                    Level::ERROR,
                    queue=%inner.queue.name(), job=%job.id, error=%e,
                    "Error recording job completion"
                );
            }
        },
        Err(processor_error) => {
            let message = processor_error.to_string();
            match inner.queue.fail(&mut job, &message).await {
                Ok(()) => {
                    // `fail` flips retryable jobs back to delayed; a job
                    // still in the failed status is terminal.
                    if job.status == JobStatus::Failed {
                        if let Some(webhook) = job.webhook.clone() {
                            let delivery = inner
                                .dispatcher
                                .dispatch(WebhookEvent::JobFailed, &job, &webhook)
                                .await;
                            if !delivery.success {
                                event!(
                                    Level::WARN,
                                    queue=%inner.queue.name(), job=%job.id, error=?delivery.error,
                                    "Failure webhook was not delivered"
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    event!(
                        Level::ERROR,
                        queue=%inner.queue.name(), job=%job.id, error=%e,
                        "Error recording job failure"
                    );
                }
            }
        }
    }

    inner.active_jobs.lock().unwrap().remove(&job.id);
}
