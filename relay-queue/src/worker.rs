use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_types::{Job, ToolError};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info};

use crate::{JobQueue, QueueError};

/// Runs the payload of a claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, ToolError>;
}

/// Pulls jobs from one named queue and settles each one through the handler.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    handler: Arc<dyn JobHandler>,
    idle_wait: Duration,
}

impl Worker {
    pub fn new(queue: Arc<dyn JobQueue>, queue_name: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            handler,
            idle_wait: Duration::from_millis(250),
        }
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Claim and settle at most one job. Returns the settled job, if any.
    pub async fn run_once(&self) -> Result<Option<Job>, QueueError> {
        let Some(job) = self.queue.pop(&self.queue_name).await? else {
            return Ok(None);
        };
        let settled = match self.handler.handle(&job).await {
            Ok(result) => self.queue.complete(&job.id, result).await?,
            Err(e) => self.queue.fail(&job.id, &e.to_string()).await?,
        };
        Ok(Some(settled))
    }

    /// Loop until `shutdown` flips to true or its sender is dropped. Store
    /// errors are logged and the loop backs off for one idle period.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %self.queue_name, "worker started");
        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(queue = %self.queue_name, error = %e, "worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(queue = %self.queue_name, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AsyncQueue, PushOptions};
    use relay_store::MemoryStore;
    use relay_types::{JobStatus, SystemClock};
    use serde_json::json;

    struct Doubler;

    #[async_trait]
    impl JobHandler for Doubler {
        async fn handle(&self, job: &Job) -> Result<Value, ToolError> {
            match job.payload["n"].as_i64() {
                Some(n) => Ok(json!(n * 2)),
                None => Err(ToolError::permanent("missing n")),
            }
        }
    }

    fn setup() -> (Arc<AsyncQueue>, Worker) {
        let clock = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let queue = Arc::new(AsyncQueue::new(store, clock));
        let worker = Worker::new(queue.clone(), "math", Arc::new(Doubler))
            .with_idle_wait(Duration::from_millis(5));
        (queue, worker)
    }

    #[tokio::test]
    async fn run_once_completes_job() {
        let (queue, worker) = setup();
        let id = queue.push("math", json!({"n": 21}), PushOptions::default()).await.unwrap();
        let job = worker.run_once().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!(42)));
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handler_error_fails_job() {
        let (queue, worker) = setup();
        queue
            .push("math", json!({}), PushOptions { priority: 1.0, max_attempts: 1 })
            .await
            .unwrap();
        let job = worker.run_once().await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.unwrap().contains("missing n"));
    }

    #[tokio::test]
    async fn run_drains_until_shutdown() {
        let (queue, worker) = setup();
        for n in 0..5 {
            queue.push("math", json!({ "n": n }), PushOptions::default()).await.unwrap();
        }
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        for _ in 0..200 {
            if queue.stats("math").await.unwrap().total == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(queue.stats("math").await.unwrap().total, 0);
    }
}
