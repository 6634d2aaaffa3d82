pub mod http_task;
pub mod job;
pub mod worker;

pub use self::{
    http_task::{HttpTaskPayload, HttpTaskProcessor},
    job::*,
    worker::{JobProcessor, Worker},
};

use crate::{database::RedisPool, error::Error};

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use redis::AsyncCommands;
use serde::Serialize;
use tracing::{event, Level};

/// Cap on the retry backoff for failed jobs.
pub const RETRY_BACKOFF_CAP_MS: u64 = 60_000;

/// Per-queue behavior knobs. Everything not set here comes from the
/// service-wide defaults.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Worker concurrency when the worker itself doesn't specify one.
    pub concurrency: Option<u32>,
    /// Base delay for the exponential retry backoff.
    pub retry_delay: Duration,
    /// Reclaim `active` entries older than this. None disables the sweep.
    pub stalled_timeout: Option<Duration>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            concurrency: None,
            retry_delay: Duration::from_millis(1000),
            stalled_timeout: None,
        }
    }
}

/// Retry delay after `attempts` recorded failures: the base doubles per
/// attempt, capped, plus up to 10% jitter on top of the capped value.
pub fn retry_backoff_ms(attempts: u32, base_ms: u64) -> u64 {
    let exp = attempts.min(16);
    let backoff = base_ms
        .saturating_mul(1u64 << exp)
        .min(RETRY_BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=backoff / 10);
    backoff + jitter
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,

    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
}

pub struct Queue(Arc<QueueInner>);

impl Clone for Queue {
    fn clone(&self) -> Queue {
        Queue(self.0.clone())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.0.name)
            .field("settings", &self.0.settings)
            .finish()
    }
}

struct QueueInner {
    pool: RedisPool,
    name: String,
    waiting_list: String,
    active_list: String,
    completed_list: String,
    failed_list: String,
    delayed_set: String,
    jobs_hash: String,
    stats_hash: String,
    settings: QueueSettings,
}

impl Queue {
    pub fn new(pool: RedisPool, queue_name: &str, settings: QueueSettings) -> Queue {
        Queue(Arc::new(QueueInner {
            pool,
            waiting_list: format!("queue:{}:waiting", queue_name),
            active_list: format!("queue:{}:active", queue_name),
            completed_list: format!("queue:{}:completed", queue_name),
            failed_list: format!("queue:{}:failed", queue_name),
            delayed_set: format!("queue:{}:delayed", queue_name),
            jobs_hash: format!("queue:{}:jobs", queue_name),
            stats_hash: format!("queue:{}:stats", queue_name),
            settings,
            name: queue_name.to_string(),
        }))
    }

    pub fn name(&self) -> &str {
        self.0.name.as_str()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.0.settings
    }

    /// Write the job record and put its id on the waiting list, or the
    /// delayed set when the job carries a delay.
    pub async fn add(&self, job: &Job) -> Result<(), Error> {
        let serialized = serde_json::to_string(job)?;

        let mut pipe = redis::Pipeline::with_capacity(3);
        pipe.hset(&self.0.jobs_hash, &job.id, &serialized);
        if job.status == JobStatus::Delayed {
            pipe.zadd(
                &self.0.delayed_set,
                &job.id,
                job.scheduled_at().timestamp_millis(),
            );
        } else {
            pipe.lpush(&self.0.waiting_list, &job.id);
        }
        pipe.cmd("HINCRBY")
            .arg(&[&self.0.stats_hash, "totalJobs", "1"]);

        let mut conn = self.0.pool.conn().await?;
        pipe.query_async::<_, ()>(&mut conn).await?;

        event!(Level::DEBUG, queue=%self.0.name, job=%job.id, status=%job.status, "Enqueued job");
        Ok(())
    }

    /// Claim the next ready job, blocking up to one second when the waiting
    /// list is empty. Due delayed jobs are promoted first.
    pub async fn next(&self) -> Result<Option<Job>, Error> {
        self.promote_delayed().await?;

        let mut conn = self.0.pool.conn().await?;
        let popped: Option<(String, String)> = conn.brpop(&self.0.waiting_list, 1).await?;
        let id = match popped {
            Some((_, id)) => id,
            None => return Ok(None),
        };

        let record: Option<String> = conn.hget(&self.0.jobs_hash, &id).await?;
        let mut job: Job = match record {
            Some(record) => serde_json::from_str(&record)?,
            None => {
                event!(Level::WARN, queue=%self.0.name, job=%id, "Dequeued an id with no record");
                return Ok(None);
            }
        };

        job.mark_active();
        let serialized = serde_json::to_string(&job)?;
        redis::Pipeline::with_capacity(2)
            .lpush(&self.0.active_list, &id)
            .hset(&self.0.jobs_hash, &id, &serialized)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(Some(job))
    }

    pub async fn complete(&self, job: &mut Job, result: serde_json::Value) -> Result<(), Error> {
        job.mark_completed(result);

        let mut pipe = redis::Pipeline::with_capacity(4);
        pipe.lrem(&self.0.active_list, 1, &job.id);
        if job.options.remove_on_complete {
            pipe.hdel(&self.0.jobs_hash, &job.id);
        } else {
            pipe.lpush(&self.0.completed_list, &job.id);
            pipe.hset(&self.0.jobs_hash, &job.id, serde_json::to_string(job)?);
        }
        pipe.cmd("HINCRBY")
            .arg(&[&self.0.stats_hash, "completedJobs", "1"]);

        let mut conn = self.0.pool.conn().await?;
        pipe.query_async::<_, ()>(&mut conn).await?;

        event!(Level::INFO, queue=%self.0.name, job=%job.id, "Job completed");
        Ok(())
    }

    /// Record a failed attempt. Retryable failures re-enter the delayed set
    /// with a backoff score; terminal failures land on the failed list (or
    /// are removed entirely, per the job's retention options).
    pub async fn fail(&self, job: &mut Job, error: &str) -> Result<(), Error> {
        job.mark_failed(error);

        let mut pipe = redis::Pipeline::with_capacity(4);
        pipe.lrem(&self.0.active_list, 1, &job.id);

        if job.can_retry() {
            let backoff_ms = retry_backoff_ms(
                job.attempts,
                self.0.settings.retry_delay.as_millis() as u64,
            );
            let run_at = Utc::now().timestamp_millis() + backoff_ms as i64;
            job.status = JobStatus::Delayed;
            pipe.zadd(&self.0.delayed_set, &job.id, run_at);
            pipe.hset(&self.0.jobs_hash, &job.id, serde_json::to_string(job)?);
            event!(
                Level::INFO,
                queue=%self.0.name, job=%job.id, attempts=%job.attempts, backoff_ms=%backoff_ms,
                "Job failed; retry scheduled"
            );
        } else {
            pipe.cmd("HINCRBY")
                .arg(&[&self.0.stats_hash, "failedJobs", "1"]);
            if job.options.remove_on_fail {
                pipe.hdel(&self.0.jobs_hash, &job.id);
            } else {
                pipe.lpush(&self.0.failed_list, &job.id);
                pipe.hset(&self.0.jobs_hash, &job.id, serde_json::to_string(job)?);
            }
            event!(
                Level::WARN,
                queue=%self.0.name, job=%job.id, attempts=%job.attempts, error=%error,
                "Job failed terminally"
            );
        }

        let mut conn = self.0.pool.conn().await?;
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Move every due delayed job onto the waiting list, in score order.
    pub async fn promote_delayed(&self) -> Result<usize, Error> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.0.pool.conn().await?;
        let ready: Vec<String> = conn.zrangebyscore(&self.0.delayed_set, 0, now).await?;

        let mut promoted = 0;
        for id in ready {
            // Another instance may promote concurrently; whoever removes the
            // member from the set owns the promotion.
            let removed: i64 = conn.zrem(&self.0.delayed_set, &id).await?;
            if removed == 0 {
                continue;
            }

            let record: Option<String> = conn.hget(&self.0.jobs_hash, &id).await?;
            let mut job: Job = match record {
                Some(record) => serde_json::from_str(&record)?,
                None => {
                    event!(Level::WARN, queue=%self.0.name, job=%id, "Delayed id with no record");
                    continue;
                }
            };

            job.status = JobStatus::Waiting;
            redis::Pipeline::with_capacity(2)
                .hset(&self.0.jobs_hash, &id, serde_json::to_string(&job)?)
                .lpush(&self.0.waiting_list, &id)
                .query_async::<_, ()>(&mut conn)
                .await?;
            promoted += 1;
        }

        if promoted > 0 {
            event!(Level::DEBUG, queue=%self.0.name, count=%promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Push `active` entries whose worker went away back to `waiting`,
    /// counting the lost attempt. Jobs out of attempts fail terminally.
    pub async fn reclaim_stalled(&self, older_than: Duration) -> Result<usize, Error> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));

        let mut conn = self.0.pool.conn().await?;
        let active_ids: Vec<String> = conn.lrange(&self.0.active_list, 0, -1).await?;

        let mut reclaimed = 0;
        for id in active_ids {
            let record: Option<String> = conn.hget(&self.0.jobs_hash, &id).await?;
            let mut job: Job = match record {
                Some(record) => serde_json::from_str(&record)?,
                None => {
                    // Orphaned id; the record was removed out from under it.
                    let _: i64 = conn.lrem(&self.0.active_list, 0, &id).await?;
                    continue;
                }
            };

            if job.status != JobStatus::Active {
                continue;
            }
            let stale = job.processed_at.map(|t| t < cutoff).unwrap_or(true);
            if !stale {
                continue;
            }

            let removed: i64 = conn.lrem(&self.0.active_list, 1, &id).await?;
            if removed == 0 {
                continue;
            }

            let mut pipe = redis::Pipeline::with_capacity(3);
            if job.record_stall() {
                pipe.hset(&self.0.jobs_hash, &id, serde_json::to_string(&job)?);
                pipe.lpush(&self.0.waiting_list, &id);
            } else {
                pipe.cmd("HINCRBY")
                    .arg(&[&self.0.stats_hash, "failedJobs", "1"]);
                if job.options.remove_on_fail {
                    pipe.hdel(&self.0.jobs_hash, &id);
                } else {
                    pipe.lpush(&self.0.failed_list, &id);
                    pipe.hset(&self.0.jobs_hash, &id, serde_json::to_string(&job)?);
                }
            }
            pipe.query_async::<_, ()>(&mut conn).await?;

            event!(
                Level::WARN,
                queue=%self.0.name, job=%id, attempts=%job.attempts, status=%job.status,
                "Reclaimed stalled job"
            );
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, Error> {
        let mut conn = self.0.pool.conn().await?;
        let record: Option<String> = conn.hget(&self.0.jobs_hash, id).await?;
        record
            .map(|record| serde_json::from_str(&record).map_err(Error::from))
            .transpose()
    }

    /// Remove a job from every structural key and delete its record.
    /// Returns true if anything was actually removed.
    pub async fn remove(&self, id: &str) -> Result<bool, Error> {
        let mut conn = self.0.pool.conn().await?;
        let (waiting, active, completed, failed, delayed, record): (
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = redis::Pipeline::with_capacity(6)
            .lrem(&self.0.waiting_list, 0, id)
            .lrem(&self.0.active_list, 0, id)
            .lrem(&self.0.completed_list, 0, id)
            .lrem(&self.0.failed_list, 0, id)
            .zrem(&self.0.delayed_set, id)
            .hdel(&self.0.jobs_hash, id)
            .query_async(&mut conn)
            .await?;

        Ok(waiting + active + completed + failed + delayed + record > 0)
    }

    pub async fn stats(&self) -> Result<QueueStats, Error> {
        let mut conn = self.0.pool.conn().await?;
        let (waiting, active, completed, failed, delayed, (total_jobs, completed_jobs, failed_jobs)): (
            usize,
            usize,
            usize,
            usize,
            usize,
            (Option<usize>, Option<usize>, Option<usize>),
        ) = redis::Pipeline::with_capacity(6)
            .llen(&self.0.waiting_list)
            .llen(&self.0.active_list)
            .llen(&self.0.completed_list)
            .llen(&self.0.failed_list)
            .zcard(&self.0.delayed_set)
            .cmd("HMGET")
            .arg(&[
                &self.0.stats_hash,
                "totalJobs",
                "completedJobs",
                "failedJobs",
            ])
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            waiting,
            active,
            completed,
            failed,
            delayed,
            total_jobs: total_jobs.unwrap_or(0),
            completed_jobs: completed_jobs.unwrap_or(0),
            failed_jobs: failed_jobs.unwrap_or(0),
        })
    }

    /// Delete every key this queue owns.
    pub async fn clean(&self) -> Result<(), Error> {
        let mut conn = self.0.pool.conn().await?;
        redis::cmd("DEL")
            .arg(&[
                &self.0.waiting_list,
                &self.0.active_list,
                &self.0.completed_list,
                &self.0.failed_list,
                &self.0.delayed_set,
                &self.0.jobs_hash,
                &self.0.stats_hash,
            ])
            .query_async::<_, ()>(&mut conn)
            .await?;

        event!(Level::INFO, queue=%self.0.name, "Cleaned queue");
        Ok(())
    }

    pub async fn list_waiting(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.0.pool.conn().await?;
        conn.lrange(&self.0.waiting_list, 0, -1)
            .await
            .map_err(Error::from)
    }

    pub async fn list_active(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.0.pool.conn().await?;
        conn.lrange(&self.0.active_list, 0, -1)
            .await
            .map_err(Error::from)
    }

    pub async fn list_completed(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.0.pool.conn().await?;
        conn.lrange(&self.0.completed_list, 0, -1)
            .await
            .map_err(Error::from)
    }

    pub async fn list_failed(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.0.pool.conn().await?;
        conn.lrange(&self.0.failed_list, 0, -1)
            .await
            .map_err(Error::from)
    }

    pub async fn list_delayed(&self) -> Result<Vec<(String, DateTime<Utc>)>, Error> {
        let mut conn = self.0.pool.conn().await?;
        let list: Vec<(String, i64)> = conn.zrange_withscores(&self.0.delayed_set, 0, -1).await?;
        Ok(list
            .into_iter()
            .map(|(id, score)| (id, Utc.timestamp_millis(score)))
            .collect())
    }
}
