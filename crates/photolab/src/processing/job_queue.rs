//! Durable job queue shared by the API and batch workers
//!
//! Jobs live in SQLite so that workers in other processes can claim them.
//! In-process workers are woken through a `Notify`; jobs enqueued elsewhere
//! are picked up on the next poll tick.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::providers::ObjectStore;
use crate::storage::JobDatabase;
use crate::types::{ClaimedJob, ItemResult, Job, JobItem, JobState, Mode, ResultReference};

/// Job counts per state
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub started: usize,
    pub finished: usize,
    pub failed: usize,
    pub total: usize,
}

/// Job queue backed by the shared job database
pub struct JobQueue {
    /// Database for persistence
    database: Arc<JobDatabase>,
    /// Wakes in-process workers on enqueue
    notify: Arc<Notify>,
    /// Store holding result objects, released when their job is purged
    result_store: Option<Arc<dyn ObjectStore>>,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue over an already opened database
    pub fn new(database: Arc<JobDatabase>, config: QueueConfig) -> Self {
        Self {
            database,
            notify: Arc::new(Notify::new()),
            result_store: None,
            config,
        }
    }

    /// Delete stored result objects together with their expired jobs
    pub fn with_result_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.result_store = Some(store);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Persist a new job in `queued` state and return its id
    pub fn enqueue(&self, items: Vec<JobItem>, mode: Mode, timeout: Duration) -> Result<Uuid> {
        if items.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let job_id = Uuid::new_v4();
        self.database.insert_job(job_id, mode, timeout, &items)?;
        self.notify.notify_one();

        tracing::info!(
            "Queued job {} with {} items (mode {}, timeout {}s)",
            job_id,
            items.len(),
            mode,
            timeout.as_secs()
        );
        Ok(job_id)
    }

    /// Read a job; unknown and expired jobs are not found
    pub fn fetch(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .database
            .get_job(job_id)?
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;

        if self.is_expired(&job) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        Ok(job)
    }

    fn is_expired(&self, job: &Job) -> bool {
        let Some(ended_at) = job.ended_at.filter(|_| job.state.is_terminal()) else {
            return false;
        };
        let age = (Utc::now() - ended_at).to_std().unwrap_or_default();
        age >= self.config.result_ttl()
    }

    /// Claim the oldest queued job, if any
    pub fn dequeue(&self, worker_id: &str) -> Result<Option<ClaimedJob>> {
        let claimed = self.database.claim_next(worker_id)?;
        if let Some(job) = &claimed {
            tracing::debug!("Worker {} claimed job {} ({} items)", worker_id, job.id, job.items.len());
        }
        Ok(claimed)
    }

    /// Wait until a job is claimed or shutdown is signalled
    pub async fn next_job(
        &self,
        worker_id: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<ClaimedJob>> {
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }

            if let Some(job) = self.dequeue(worker_id)? {
                return Ok(Some(job));
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Record `done` completed items; returns false if the job is no longer started
    pub fn record_progress(&self, job_id: Uuid, done: usize) -> Result<bool> {
        self.database.update_progress(job_id, done)
    }

    /// Store the final result list and mark the job finished
    pub fn complete(&self, job_id: Uuid, results: &[ItemResult]) -> Result<bool> {
        let updated = self.database.finish_job(job_id, results)?;
        if !updated {
            tracing::warn!("Job {} was not in started state, results dropped", job_id);
        }
        Ok(updated)
    }

    /// Mark the job failed with a reason
    pub fn fail(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        let updated = self.database.fail_job(job_id, reason)?;
        if !updated {
            tracing::warn!("Job {} already terminal, failure not recorded: {}", job_id, reason);
        }
        Ok(updated)
    }

    /// Job counts per state
    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for (state, count) in self.database.count_by_state()? {
            match state {
                JobState::Queued => stats.queued = count,
                JobState::Started => stats.started = count,
                JobState::Finished => stats.finished = count,
                JobState::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    /// Delete terminal jobs older than the result TTL, and their stored results
    pub async fn purge_expired(&self) -> Result<usize> {
        let ttl = chrono::Duration::from_std(self.config.result_ttl())
            .map_err(|e| Error::Config(format!("queue.result_ttl_secs is out of range: {}", e)))?;
        let purged = self.database.purge_ended_before(Utc::now() - ttl)?;
        if purged.count > 0 {
            tracing::info!("Purged {} expired jobs", purged.count);
        }

        let Some(store) = &self.result_store else {
            return Ok(purged.count);
        };
        for result in purged.results {
            if let Some(ResultReference::Object { key, .. }) = result.reference {
                if let Err(e) = store.delete(&key).await {
                    tracing::warn!("Failed to delete expired result {}: {}", key, e);
                }
            }
        }
        Ok(purged.count)
    }

    /// Fail started jobs whose worker is gone
    ///
    /// A job counts as abandoned once its timeout plus the grace period has
    /// elapsed since it was claimed. Abandoned jobs are never re-queued.
    pub fn fail_abandoned(&self) -> Result<usize> {
        let grace = Duration::from_secs(self.config.abandoned_grace_secs);
        let now = Utc::now();
        let mut failed = 0;

        for (job_id, started_at, timeout) in self.database.started_jobs()? {
            let running = (now - started_at).to_std().unwrap_or_default();
            if running < timeout + grace {
                continue;
            }
            let reason = format!(
                "Worker stopped responding; job exceeded its {}s timeout",
                timeout.as_secs()
            );
            if self.database.fail_job(job_id, &reason)? {
                tracing::warn!("Job {} abandoned after {}s", job_id, running.as_secs());
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Run the retention sweep until shutdown
    pub fn spawn_maintenance(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        let period = Duration::from_secs(self.config.maintenance_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.fail_abandoned() {
                            tracing::error!("Abandoned job sweep failed: {}", e);
                        }
                        if let Err(e) = queue.purge_expired().await {
                            tracing::error!("Expired job purge failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Queue maintenance stopped");
        })
    }

    /// Flush the database before exit
    pub fn shutdown(&self) -> Result<()> {
        self.database.checkpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::LocalObjectStore;
    use std::collections::HashSet;

    fn queue_with(config: QueueConfig) -> JobQueue {
        JobQueue::new(Arc::new(JobDatabase::in_memory().unwrap()), config)
    }

    fn queue() -> JobQueue {
        queue_with(QueueConfig::default())
    }

    fn items(n: usize) -> Vec<JobItem> {
        (0..n)
            .map(|i| JobItem::new(format!("img{}.png", i), vec![i as u8]))
            .collect()
    }

    #[test]
    fn test_empty_batch_is_rejected() {
        let queue = queue();
        assert!(matches!(
            queue.enqueue(Vec::new(), Mode::Fast, Duration::from_secs(60)),
            Err(Error::EmptyBatch)
        ));
        assert_eq!(queue.stats().unwrap().total, 0);
    }

    #[test]
    fn test_fetch_unknown_is_not_found() {
        let queue = queue();
        let id = Uuid::new_v4();
        assert!(matches!(queue.fetch(id), Err(Error::JobNotFound(missing)) if missing == id.to_string()));
    }

    #[test]
    fn test_enqueue_then_fetch_and_stats() {
        let queue = queue();
        let id = queue.enqueue(items(3), Mode::Fast, Duration::from_secs(60)).unwrap();

        let job = queue.fetch(id).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.progress.to_string(), "0/3");

        let stats = queue.stats().unwrap();
        assert_eq!(stats, QueueStats { queued: 1, total: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_finished_job_expires_after_ttl() {
        let queue = queue_with(QueueConfig {
            result_ttl_secs: 0,
            ..QueueConfig::default()
        });
        let id = queue.enqueue(items(1), Mode::Fast, Duration::from_secs(60)).unwrap();
        queue.dequeue("w").unwrap().unwrap();

        // non-terminal jobs never expire
        assert!(queue.fetch(id).is_ok());

        queue.complete(id, &[]).unwrap();
        assert!(matches!(queue.fetch(id), Err(Error::JobNotFound(_))));
        assert_eq!(queue.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge_deletes_stored_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path(), "http://localhost", "secret"));
        let queue = queue_with(QueueConfig {
            result_ttl_secs: 0,
            ..QueueConfig::default()
        })
        .with_result_store(store.clone());

        let id = queue.enqueue(items(2), Mode::Fast, Duration::from_secs(60)).unwrap();
        queue.dequeue("w").unwrap().unwrap();
        let mut results = Vec::new();
        for name in ["img0.png", "img1.png"] {
            let key = store.put(b"cutout", "image/png").await.unwrap();
            let url = store.temporary_link(&key, Duration::from_secs(60)).unwrap();
            results.push(ItemResult::succeeded(name, ResultReference::Object { key, url }));
        }
        queue.complete(id, &results).unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("results")).unwrap().count(), 2);

        assert_eq!(queue.purge_expired().await.unwrap(), 1);
        assert_eq!(std::fs::read_dir(dir.path().join("results")).unwrap().count(), 0);
        assert!(matches!(queue.fetch(id), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn test_abandoned_jobs_are_failed_not_requeued() {
        let queue = queue_with(QueueConfig {
            abandoned_grace_secs: 0,
            ..QueueConfig::default()
        });
        let stale = queue.enqueue(items(1), Mode::Fast, Duration::ZERO).unwrap();
        let fresh = queue.enqueue(items(1), Mode::Fast, Duration::from_secs(600)).unwrap();
        queue.dequeue("w1").unwrap().unwrap();
        queue.dequeue("w2").unwrap().unwrap();

        assert_eq!(queue.fail_abandoned().unwrap(), 1);

        let job = queue.fetch(stale).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("timeout"));
        assert_eq!(queue.fetch(fresh).unwrap().state, JobState::Started);
        assert!(queue.dequeue("w3").unwrap().is_none());
    }

    #[test]
    fn test_racing_workers_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let producer = JobQueue::new(Arc::new(JobDatabase::open(&path).unwrap()), QueueConfig::default());

        let mut expected = HashSet::new();
        for _ in 0..20 {
            expected.insert(producer.enqueue(items(1), Mode::Quality, Duration::from_secs(60)).unwrap());
        }

        let handles: Vec<_> = (0..2)
            .map(|w| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let queue = JobQueue::new(Arc::new(JobDatabase::open(&path).unwrap()), QueueConfig::default());
                    let mut claimed = Vec::new();
                    while let Some(job) = queue.dequeue(&format!("worker-{}", w)).unwrap() {
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "job {} claimed twice", id);
            }
        }
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_next_job_wakes_on_enqueue() {
        let queue = Arc::new(queue_with(QueueConfig {
            poll_interval_ms: 60_000,
            ..QueueConfig::default()
        }));
        let (_tx, mut rx) = watch::channel(false);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_job("w", &mut rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let id = queue.enqueue(items(2), Mode::Fast, Duration::from_secs(60)).unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.items.len(), 2);
    }

    #[tokio::test]
    async fn test_next_job_returns_none_on_shutdown() {
        let queue = Arc::new(queue());
        let (tx, mut rx) = watch::channel(false);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next_job("w", &mut rx).await })
        };
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(result.is_none());
    }
}
