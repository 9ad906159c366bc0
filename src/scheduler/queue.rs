//! Bounded worker pools for background jobs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue {0} is full")]
    Full(String),
    #[error("queue {0} is closed")]
    Closed(String),
}

/// N workers draining a bounded channel. Every job runs in its own task under
/// the pool timeout and is aborted when it overruns.
#[derive(Clone)]
pub struct TaskPool {
    name: Arc<str>,
    tx: mpsc::Sender<Job>,
}

impl TaskPool {
    pub fn new(name: &str, workers: usize, capacity: usize, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let name: Arc<str> = Arc::from(name);

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let name = name.clone();
            tokio::spawn(async move {
                loop {
                    // Hold the lock only while waiting for the next job
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    run_job(&name, worker, job, timeout).await;
                }
                tracing::debug!(pool = %name, worker, "worker stopped");
            });
        }

        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job, failing immediately when the queue is full.
    pub fn submit<F>(&self, job: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full(self.name.to_string()),
            TrySendError::Closed(_) => QueueError::Closed(self.name.to_string()),
        })
    }

    /// Submit `job` after `delay`. A rejected submission is logged.
    pub fn submit_after<F>(&self, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = pool.submit(job) {
                tracing::warn!("dropping delayed job: {}", e);
            }
        });
    }
}

async fn run_job(pool: &str, worker: usize, job: Job, timeout: Duration) {
    let mut handle = tokio::spawn(job);

    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_panic() => {
            tracing::error!(pool, worker, "job panicked: {}", e);
        }
        Ok(Err(e)) => {
            tracing::warn!(pool, worker, "job cancelled: {}", e);
        }
        Err(_) => {
            handle.abort();
            tracing::warn!(pool, worker, "job exceeded {:?}, aborted", timeout);
        }
    }
}
