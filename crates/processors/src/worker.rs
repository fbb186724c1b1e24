//! Polling workers that drain the job queue.

use std::sync::Arc;
use std::time::Duration;

use common::{Clock, SystemClock};
use futures_util::future::join_all;
use reliability::Result;
use store::JobStore;
use tokio::sync::watch;

use crate::runner::ProcessorRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of concurrent polling tasks.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Jobs claimed per poll.
    pub batch_size: usize,
    /// Running jobs untouched for this long are returned to the queue. Live
    /// runs renew their lease on every runner heartbeat, so only jobs whose
    /// worker has stopped heartbeating go stale.
    pub stale_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            stale_after: Duration::from_secs(5 * 60),
        }
    }
}

/// Pulls due jobs and hands them to the runner.
pub struct Worker {
    runner: Arc<ProcessorRunner>,
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(runner: Arc<ProcessorRunner>, jobs: Arc<dyn JobStore>, config: WorkerConfig) -> Self {
        Self {
            runner,
            jobs,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Claims one batch of due jobs and runs them. Returns the number claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let batch = self
            .jobs
            .claim_due(self.clock.now(), self.config.batch_size.max(1))
            .await?;
        let claimed = batch.len();

        for job in batch {
            let job_id = job.id;
            if let Err(e) = self.runner.run(job).await {
                tracing::error!(%job_id, error = %e, "failed to record job outcome");
            }
        }
        Ok(claimed)
    }

    /// Returns running jobs abandoned by a crashed worker to the queue.
    pub async fn requeue_stale(&self) -> Result<u64> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::minutes(5));
        let requeued = self
            .jobs
            .requeue_stale(self.clock.now() - stale_after)
            .await?;
        if requeued > 0 {
            tracing::warn!(requeued, "requeued stale jobs");
        }
        Ok(requeued)
    }

    /// Runs the polling tasks until `shutdown` flips to true.
    ///
    /// In-flight jobs finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.requeue_stale().await {
            tracing::warn!(error = %e, "stale job sweep failed");
        }

        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);
        for worker_id in 0..self.config.concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                worker.poll_loop(worker_id, shutdown).await;
            }));
        }

        let reaper = self.clone();
        tasks.push(tokio::spawn(async move {
            reaper.reap_loop(shutdown).await;
        }));

        tracing::info!(concurrency = self.config.concurrency, "workers started");
        for result in join_all(tasks).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
        tracing::info!("workers stopped");
    }

    async fn poll_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(claimed) => claimed == 0,
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "job poll failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(worker_id, "worker stopped");
    }

    async fn reap_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.stale_after.max(Duration::from_secs(1)));
        // The first tick fires immediately; the startup sweep already ran.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.requeue_stale().await {
                        tracing::warn!(error = %e, "stale job sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
