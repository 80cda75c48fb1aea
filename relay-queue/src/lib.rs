use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_store::{keys, SharedStore, StoreError};
use relay_types::{Clock, Job, JobStatus};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod worker;
pub use worker::{JobHandler, Worker};

/// Live job records expire after a day; finished ones after an hour.
pub const ACTIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const COMPLETED_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("job record corrupt: {0}")]
    Corrupt(String),
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {id} is {status:?}, expected processing")]
    NotProcessing { id: String, status: JobStatus },
}

#[derive(Clone, Copy, Debug)]
pub struct PushOptions {
    pub priority: f64,
    pub max_attempts: u32,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            priority: 5.0,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: u64,
    pub processing: u64,
    pub total: u64,
}

/// Priority job queue interface.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, queue: &str, payload: Value, opts: PushOptions) -> Result<String, QueueError>;

    /// Claim the lowest-priority pending job, or `None` when empty or when a
    /// concurrent worker claimed it first.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, job_id: &str, result: Value) -> Result<Job, QueueError>;

    async fn fail(&self, job_id: &str, error: &str) -> Result<Job, QueueError>;

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError>;

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError>;
}

/// Queue built on the shared store's sorted-set and set primitives.
///
/// Delivery is at-least-once with single claim: a job id is in at most one of
/// `queue:{name}` and `processing:{name}`, and only the worker whose `zrem`
/// succeeds gets it.
pub struct AsyncQueue {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl AsyncQueue {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Queue names that have ever received a push.
    pub async fn list_queues(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.store.smembers(keys::QUEUES).await?)
    }

    async fn load(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let Some(raw) = self.store.get(&keys::job(job_id)).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| QueueError::Corrupt(format!("{job_id}: {e}")))
    }

    async fn save(&self, job: &Job, ttl: Duration) -> Result<(), QueueError> {
        let raw = serde_json::to_string(job).map_err(|e| QueueError::Corrupt(e.to_string()))?;
        self.store.set(&keys::job(&job.id), &raw, Some(ttl)).await?;
        Ok(())
    }

    /// Second half of `pop`, run once this worker owns the id.
    async fn claim(&self, queue: &str, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.store.sadd(&keys::processing(queue), job_id).await?;
        let Some(mut job) = self.load(job_id).await? else {
            // Record expired while queued; nothing left to run.
            warn!(queue, job_id, "claimed job has no record, dropping");
            self.store.srem(&keys::processing(queue), job_id).await?;
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(self.clock.now_ms());
        self.save(&job, ACTIVE_TTL).await?;
        Ok(Some(job))
    }

    /// Undo a claim whose bookkeeping failed so another worker can pick the job up.
    async fn release(&self, queue: &str, job_id: &str, score: f64) {
        let res = async {
            self.store.srem(&keys::processing(queue), job_id).await?;
            self.store.zadd(&keys::queue(queue), job_id, score).await?;
            Ok::<_, StoreError>(())
        }
        .await;
        match res {
            Ok(()) => warn!(queue, job_id, "claim failed, job returned to pending"),
            Err(e) => warn!(queue, job_id, error = %e, "claim failed and job could not be returned"),
        }
    }

    async fn load_processing(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self
            .load(job_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
        if job.status != JobStatus::Processing {
            return Err(QueueError::NotProcessing {
                id: job.id,
                status: job.status,
            });
        }
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for AsyncQueue {
    async fn push(&self, queue: &str, payload: Value, opts: PushOptions) -> Result<String, QueueError> {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue.to_string(),
            payload,
            priority: opts.priority,
            attempts: 0,
            max_attempts: opts.max_attempts.max(1),
            status: JobStatus::Pending,
            created_at: self.clock.now_ms(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            last_error: None,
        };
        // Record before membership, so a popped id always resolves.
        self.save(&job, ACTIVE_TTL).await?;
        self.store.zadd(&keys::queue(queue), &job.id, job.priority).await?;
        self.store.sadd(keys::QUEUES, queue).await?;
        debug!(queue, job_id = %job.id, priority = job.priority, "job pushed");
        Ok(job.id)
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let pending = keys::queue(queue);
        let Some((job_id, score)) = self.store.zfirst(&pending).await? else {
            return Ok(None);
        };
        if !self.store.zrem(&pending, &job_id).await? {
            debug!(queue, job_id = %job_id, "lost claim race");
            return Ok(None);
        }

        match self.claim(queue, &job_id).await {
            Ok(Some(job)) => {
                info!(queue, job_id = %job.id, attempt = job.attempts, "job claimed");
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            Err(QueueError::Corrupt(reason)) => {
                // An unreadable record would sit at the head of the queue forever.
                warn!(queue, job_id = %job_id, reason = %reason, "claimed job record is corrupt, dropping");
                if let Err(e) = self.store.srem(&keys::processing(queue), &job_id).await {
                    warn!(queue, job_id = %job_id, error = %e, "corrupt job left in processing");
                }
                Err(QueueError::Corrupt(reason))
            }
            Err(e) => {
                self.release(queue, &job_id, score).await;
                Err(e)
            }
        }
    }

    async fn complete(&self, job_id: &str, result: Value) -> Result<Job, QueueError> {
        let mut job = self.load_processing(job_id).await?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(self.clock.now_ms());
        job.result = Some(result);
        self.save(&job, COMPLETED_TTL).await?;
        self.store.srem(&keys::processing(&job.queue_name), &job.id).await?;
        info!(queue = %job.queue_name, job_id, "job completed");
        Ok(job)
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<Job, QueueError> {
        let mut job = self.load_processing(job_id).await?;
        job.last_error = Some(error.to_string());
        let processing = keys::processing(&job.queue_name);

        if job.attempts < job.max_attempts {
            // Repeat offenders sink behind healthier work.
            job.priority += f64::from(job.attempts);
            job.status = JobStatus::Retrying;
            self.save(&job, ACTIVE_TTL).await?;
            self.store.srem(&processing, &job.id).await?;
            self.store
                .zadd(&keys::queue(&job.queue_name), &job.id, job.priority)
                .await?;
            warn!(
                queue = %job.queue_name,
                job_id,
                attempt = job.attempts,
                priority = job.priority,
                error,
                "job failed, re-queued"
            );
        } else {
            job.status = JobStatus::Failed;
            job.failed_at = Some(self.clock.now_ms());
            self.save(&job, ACTIVE_TTL).await?;
            self.store.srem(&processing, &job.id).await?;
            self.store.zrem(&keys::queue(&job.queue_name), &job.id).await?;
            warn!(queue = %job.queue_name, job_id, attempts = job.attempts, error, "job failed permanently");
        }
        Ok(job)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let pending = self.store.zcard(&keys::queue(queue)).await?;
        let processing = self.store.scard(&keys::processing(queue)).await?;
        Ok(QueueStats {
            queue: queue.to_string(),
            pending,
            processing,
            total: pending + processing,
        })
    }

    async fn get(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        self.load(job_id).await
    }
}
