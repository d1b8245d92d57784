//! Background worker for batch jobs

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ItemFailurePolicy;
use crate::error::Result;
use crate::providers::ProviderSet;
use crate::types::{ClaimedJob, ItemResult, JobItem, Mode, ResultReference};

use super::job_queue::JobQueue;
use super::sink::ResultSink;

/// Worker that claims jobs from the queue and processes them one at a time
pub struct BatchWorker {
    id: String,
    queue: Arc<JobQueue>,
    providers: Arc<ProviderSet>,
    sink: Arc<ResultSink>,
    policy: ItemFailurePolicy,
}

impl BatchWorker {
    /// Create a new batch worker
    pub fn new(
        id: impl Into<String>,
        queue: Arc<JobQueue>,
        providers: Arc<ProviderSet>,
        sink: Arc<ResultSink>,
        policy: ItemFailurePolicy,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            providers,
            sink,
            policy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and process jobs until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("Batch worker {} started ({:?} on item failure)", self.id, self.policy);

        loop {
            match self.queue.next_job(&self.id, &mut shutdown).await {
                Ok(Some(job)) => self.execute(job).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Worker {} failed to claim a job: {}", self.id, e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.queue.config().poll_interval()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        tracing::info!("Batch worker {} stopped", self.id);
    }

    /// Process a claimed job and write its terminal state
    pub async fn execute(&self, job: ClaimedJob) {
        let job_id = job.id;
        let started = Instant::now();
        tracing::info!("Processing job {} with {} items (mode {})", job_id, job.items.len(), job.mode);

        let outcome = match timeout(job.timeout, self.process(&job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("Job timed out after {}s", job.timeout.as_secs())),
        };

        let written = match outcome {
            Ok(results) => {
                let written = self.queue.complete(job_id, &results);
                if matches!(written, Ok(true)) {
                    tracing::info!(
                        "Job {} finished: {} items in {:.1}s",
                        job_id,
                        results.len(),
                        started.elapsed().as_secs_f64()
                    );
                }
                written
            }
            Err(reason) => {
                tracing::error!("Job {} failed: {}", job_id, reason);
                self.queue.fail(job_id, &reason)
            }
        };

        if let Err(e) = written {
            tracing::error!("Failed to record outcome of job {}: {}", job_id, e);
        }
    }

    /// Run every item in order; `Err` carries the job failure reason
    async fn process(&self, job: &ClaimedJob) -> std::result::Result<Vec<ItemResult>, String> {
        let total = job.items.len();
        let mut results = Vec::with_capacity(total);

        for (idx, item) in job.items.iter().enumerate() {
            match self.process_item(item, job.mode).await {
                Ok(reference) => {
                    results.push(ItemResult::succeeded(&item.filename, reference));
                }
                Err(e) => match self.policy {
                    ItemFailurePolicy::Abort => {
                        return Err(format!("Failed to process {}: {}", item.filename, e));
                    }
                    ItemFailurePolicy::Record => {
                        tracing::warn!("[{}] Item failed, continuing: {}", item.filename, e);
                        results.push(ItemResult::failed(&item.filename, e.to_string()));
                    }
                },
            }

            let done = idx + 1;
            match self.queue.record_progress(job.id, done) {
                Ok(true) => tracing::debug!("Job {} progress {}/{}", job.id, done, total),
                Ok(false) => return Err("Job is no longer owned by this worker".to_string()),
                Err(e) => return Err(format!("Failed to record progress: {}", e)),
            }
        }

        Ok(results)
    }

    async fn process_item(&self, item: &JobItem, mode: Mode) -> Result<ResultReference> {
        let started = Instant::now();
        let output = self.providers.remove(&item.data, mode).await?;
        let reference = self.sink.store(&output).await?;

        tracing::info!(
            "[{}] Removed background with {} in {}ms",
            item.filename,
            self.providers.for_mode(mode).name(),
            started.elapsed().as_millis()
        );
        Ok(reference)
    }
}

/// Spawn `count` worker loops sharing one queue, provider set and sink
pub fn spawn_workers(
    prefix: &str,
    count: usize,
    queue: Arc<JobQueue>,
    providers: Arc<ProviderSet>,
    sink: Arc<ResultSink>,
    policy: ItemFailurePolicy,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|i| {
            let id = format!("{}-{}-{}", prefix, std::process::id(), i);
            let worker = BatchWorker::new(
                id,
                Arc::clone(&queue),
                Arc::clone(&providers),
                Arc::clone(&sink),
                policy,
            );
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::error::Error;
    use crate::providers::RemovalProvider;
    use crate::storage::JobDatabase;
    use crate::types::{ItemStatus, JobState};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    /// Echoes its input; fails on `b"bad"` and records the progress seen on each call
    struct FakeProvider {
        queue: Arc<JobQueue>,
        job: Mutex<Option<Uuid>>,
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl FakeProvider {
        fn new(queue: Arc<JobQueue>) -> Self {
            Self {
                queue,
                job: Mutex::new(None),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RemovalProvider for FakeProvider {
        async fn remove(&self, image: &[u8], _mode: Mode) -> Result<Vec<u8>> {
            let job = *self.job.lock();
            if let Some(id) = job {
                let progress = self.queue.fetch(id)?.progress.to_string();
                self.seen.lock().push(progress);
            }
            tokio::time::sleep(self.delay).await;
            if image == b"bad" {
                return Err(Error::provider("model crashed"));
            }
            Ok(image.to_vec())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    struct Harness {
        queue: Arc<JobQueue>,
        provider: Arc<FakeProvider>,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(JobDatabase::in_memory().unwrap());
            let queue = Arc::new(JobQueue::new(db, QueueConfig {
                poll_interval_ms: 20,
                ..QueueConfig::default()
            }));
            let provider = Arc::new(FakeProvider::new(Arc::clone(&queue)));
            Self { queue, provider }
        }

        fn worker(&self, policy: ItemFailurePolicy) -> BatchWorker {
            BatchWorker::new(
                "test-worker",
                Arc::clone(&self.queue),
                Arc::new(ProviderSet::uniform(self.provider.clone())),
                Arc::new(ResultSink::Inline),
                policy,
            )
        }

        fn submit(&self, payloads: &[&[u8]], timeout: Duration) -> Uuid {
            let items = payloads
                .iter()
                .enumerate()
                .map(|(i, p)| JobItem::new(format!("photo{}.png", i + 1), p.to_vec()))
                .collect();
            let id = self.queue.enqueue(items, Mode::Fast, timeout).unwrap();
            *self.provider.job.lock() = Some(id);
            id
        }

        fn claim(&self) -> ClaimedJob {
            self.queue.dequeue("test-worker").unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_three_items_finish_in_order_with_live_progress() {
        let h = Harness::new();
        let id = h.submit(&[b"one", b"two", b"three"], Duration::from_secs(30));

        h.worker(ItemFailurePolicy::Abort).execute(h.claim()).await;

        assert_eq!(*h.provider.seen.lock(), vec!["0/3", "1/3", "2/3"]);

        let job = h.queue.fetch(id).unwrap();
        assert_eq!(job.state, JobState::Finished);
        assert_eq!(job.progress.to_string(), "3/3");
        let names: Vec<_> = job.results.iter().map(|r| r.filename.as_str()).collect();
        assert_eq!(names, vec!["photo1.png", "photo2.png", "photo3.png"]);
        assert!(job.results.iter().all(|r| r.status == ItemStatus::Succeeded));

        // repeated reads are identical
        assert_eq!(h.queue.fetch(id).unwrap().results, job.results);
    }

    #[tokio::test]
    async fn test_failing_item_aborts_job_without_results() {
        let h = Harness::new();
        let id = h.submit(&[b"one", b"bad", b"three"], Duration::from_secs(30));

        h.worker(ItemFailurePolicy::Abort).execute(h.claim()).await;

        let job = h.queue.fetch(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.results.is_empty());
        assert!(job.error.unwrap().contains("photo2.png"));
        assert_eq!(job.progress.to_string(), "1/3");
        // the third item was never attempted
        assert_eq!(h.provider.seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_record_policy_finishes_with_mixed_results() {
        let h = Harness::new();
        let id = h.submit(&[b"one", b"bad", b"three"], Duration::from_secs(30));

        h.worker(ItemFailurePolicy::Record).execute(h.claim()).await;

        let job = h.queue.fetch(id).unwrap();
        assert_eq!(job.state, JobState::Finished);
        let statuses: Vec<_> = job.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ItemStatus::Succeeded, ItemStatus::Failed, ItemStatus::Succeeded]
        );
        assert!(job.results[1].error.as_deref().unwrap().contains("model crashed"));
    }

    #[tokio::test]
    async fn test_job_timeout_fails_job() {
        let db = Arc::new(JobDatabase::in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(db, QueueConfig::default()));
        let mut slow = FakeProvider::new(Arc::clone(&queue));
        slow.delay = Duration::from_secs(10);
        let worker = BatchWorker::new(
            "slow-worker",
            Arc::clone(&queue),
            Arc::new(ProviderSet::uniform(Arc::new(slow))),
            Arc::new(ResultSink::Inline),
            ItemFailurePolicy::Abort,
        );

        let id = queue
            .enqueue(vec![JobItem::new("a.png", b"a".to_vec())], Mode::Quality, Duration::from_secs(1))
            .unwrap();
        worker.execute(queue.dequeue("slow-worker").unwrap().unwrap()).await;

        let job = queue.fetch(id).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_run_loop_processes_until_shutdown() {
        let h = Harness::new();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.worker(ItemFailurePolicy::Abort).run(rx));

        let id = h.submit(&[b"one", b"two"], Duration::from_secs(30));

        let mut state = JobState::Queued;
        for _ in 0..200 {
            state = h.queue.fetch(id).unwrap().state;
            if state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, JobState::Finished);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
