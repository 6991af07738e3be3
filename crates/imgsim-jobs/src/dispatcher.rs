//! Job dispatcher
//!
//! Requests are queued on a bounded channel and executed by a fixed pool of
//! worker tasks. Every job publishes its state through a watch channel, so
//! pollers can read the current status at any time and waiters are woken on
//! each transition. Transitions only ever move forward:
//!
//! ```text
//! Pending ──> Running ──> Succeeded | Failed
//!    └──────> Cancelled
//! ```
//!
//! Finished jobs stay fetchable for the configured retention window and are
//! then reclaimed. Pending and running jobs never expire.
//!
//! Author: hephaex@gmail.com

use chrono::{DateTime, Utc};
use imgsim_core::{
    ClassificationRequest, DispatcherConfig, FailureKind, ImgsimError, JobFailure, JobHandle,
    JobId, JobInfo, JobKind, JobOutput, JobStatus, Result,
};
use moka::future::Cache;
use moka::ops::compute::Op;
use moka::Expiry;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::executor::JobExecutor;

// ============================================================================
// Job State
// ============================================================================

/// Internal job state; outputs and causes exist only in their terminal state
#[derive(Debug, Clone)]
enum JobState {
    Pending,
    Running,
    Succeeded(JobOutput),
    Failed(JobFailure),
    Cancelled,
}

impl JobState {
    fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Running => JobStatus::Running,
            Self::Succeeded(_) => JobStatus::Succeeded,
            Self::Failed(_) => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }

    fn may_become(&self, next: &JobState) -> bool {
        matches!(
            (self.status(), next.status()),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

struct JobRecord {
    id: JobId,
    kind: JobKind,
    submitted_at: DateTime<Utc>,
    finished_at: OnceLock<DateTime<Utc>>,
    state: watch::Sender<JobState>,
}

impl JobRecord {
    fn new(kind: JobKind) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            id: JobId::new(),
            kind,
            submitted_at: Utc::now(),
            finished_at: OnceLock::new(),
            state,
        }
    }

    fn status(&self) -> JobStatus {
        self.state.borrow().status()
    }

    /// Apply a forward transition; returns false if it is not allowed
    fn transition(&self, next: JobState) -> bool {
        let moved = self.state.send_if_modified(|current| {
            if current.may_become(&next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved && self.status().is_terminal() {
            let _ = self.finished_at.set(Utc::now());
        }
        moved
    }

    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            kind: self.kind,
            status: self.status(),
            submitted_at: self.submitted_at,
            finished_at: self.finished_at.get().copied(),
        }
    }
}

/// Per-entry expiry: only finished jobs age out
struct RetentionExpiry {
    retention: Duration,
}

impl RetentionExpiry {
    fn ttl_for(&self, record: &JobRecord) -> Option<Duration> {
        record.status().is_terminal().then_some(self.retention)
    }
}

impl Expiry<JobId, Arc<JobRecord>> for RetentionExpiry {
    fn expire_after_create(
        &self,
        _key: &JobId,
        value: &Arc<JobRecord>,
        _created_at: Instant,
    ) -> Option<Duration> {
        self.ttl_for(value)
    }

    fn expire_after_update(
        &self,
        _key: &JobId,
        value: &Arc<JobRecord>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        self.ttl_for(value)
    }
}

/// Doubling wait interval with an upper bound
struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            next: initial,
            max: max.max(initial),
        }
    }

    fn next_interval(&mut self) -> Duration {
        let current = self.next;
        self.next = (self.next * 2).min(self.max);
        current
    }
}

struct QueuedJob {
    record: Arc<JobRecord>,
    request: ClassificationRequest,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Bounded worker pool with pollable job handles
pub struct Dispatcher {
    jobs: Cache<JobId, Arc<JobRecord>>,
    sender: RwLock<Option<mpsc::Sender<QueuedJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    poll_initial: Duration,
    poll_max: Duration,
}

impl Dispatcher {
    /// Spawn the worker pool on the current tokio runtime
    pub fn start(config: &DispatcherConfig, executor: Arc<dyn JobExecutor>) -> Self {
        let jobs: Cache<JobId, Arc<JobRecord>> = Cache::builder()
            .expire_after(RetentionExpiry {
                retention: config.retention(),
            })
            .build();

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let worker_count = config.workers.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&receiver),
                    Arc::clone(&executor),
                    jobs.clone(),
                ))
            })
            .collect();

        tracing::info!(
            "Dispatcher started: {} workers, queue capacity {}, retention {}s",
            worker_count,
            config.queue_capacity.max(1),
            config.retention_secs
        );

        Self {
            jobs,
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(workers),
            poll_initial: Duration::from_millis(config.poll_initial_ms),
            poll_max: Duration::from_millis(config.poll_max_ms),
        }
    }

    /// Queue a request without waiting for it to run
    pub async fn submit(&self, request: ClassificationRequest) -> Result<JobHandle> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or(ImgsimError::ShuttingDown)?;

        let record = Arc::new(JobRecord::new(request.kind()));
        let handle = JobHandle {
            id: record.id,
            kind: record.kind,
        };
        self.jobs.insert(handle.id, Arc::clone(&record)).await;

        match sender.try_send(QueuedJob { record, request }) {
            Ok(()) => {
                tracing::info!("Submitted {} job {}", handle.kind, handle.id);
                Ok(handle)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.jobs.invalidate(&handle.id).await;
                tracing::warn!("Rejected {} job: queue full", handle.kind);
                Err(ImgsimError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.jobs.invalidate(&handle.id).await;
                Err(ImgsimError::ShuttingDown)
            }
        }
    }

    async fn lookup(&self, id: JobId) -> Result<Arc<JobRecord>> {
        self.jobs.get(&id).await.ok_or(ImgsimError::JobNotFound(id))
    }

    /// Current status of a job
    pub async fn status(&self, id: JobId) -> Result<JobStatus> {
        Ok(self.lookup(id).await?.status())
    }

    /// Status plus timestamps
    pub async fn info(&self, id: JobId) -> Result<JobInfo> {
        Ok(self.lookup(id).await?.info())
    }

    /// Output of a finished job
    ///
    /// Fails with `JobNotTerminal` while the job is pending or running, and
    /// with the captured cause if the job failed.
    pub async fn result(&self, id: JobId) -> Result<JobOutput> {
        let record = self.lookup(id).await?;
        let state = record.state.borrow().clone();
        match state {
            JobState::Succeeded(output) => Ok(output),
            JobState::Failed(cause) => Err(ImgsimError::JobFailed(cause)),
            JobState::Cancelled => Err(ImgsimError::Cancelled(id)),
            JobState::Pending | JobState::Running => Err(ImgsimError::JobNotTerminal(id)),
        }
    }

    /// Like [`result`](Self::result), but reclaims a finished job
    pub async fn take_result(&self, id: JobId) -> Result<JobOutput> {
        let outcome = self.result(id).await;
        if !matches!(
            outcome,
            Err(ImgsimError::JobNotTerminal(_)) | Err(ImgsimError::JobNotFound(_))
        ) {
            self.jobs.invalidate(&id).await;
        }
        outcome
    }

    /// Cancel a job that has not started yet
    ///
    /// Returns false when the job is already running or finished; running
    /// jobs are never interrupted.
    pub async fn cancel(&self, id: JobId) -> Result<bool> {
        let record = self.lookup(id).await?;
        let cancelled = record.transition(JobState::Cancelled);
        if cancelled {
            tracing::info!("Cancelled job {id}");
            refresh_retention(&self.jobs, record).await;
        }
        Ok(cancelled)
    }

    /// Suspend until the job finishes or `deadline` elapses
    ///
    /// Each iteration sleeps until either the job changes state or the
    /// current backoff interval passes. On timeout the job keeps running and
    /// its handle stays valid.
    pub async fn wait(&self, id: JobId, deadline: Option<Duration>) -> Result<JobStatus> {
        let record = self.lookup(id).await?;
        let mut updates = record.state.subscribe();
        let mut backoff = Backoff::new(self.poll_initial, self.poll_max);
        let started = tokio::time::Instant::now();

        loop {
            let status = updates.borrow_and_update().status();
            if status.is_terminal() {
                return Ok(status);
            }

            let mut interval = backoff.next_interval();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(ImgsimError::Timeout(id));
                }
                interval = interval.min(remaining);
            }

            // Either outcome leads to a fresh status check
            let _ = tokio::time::timeout(interval, updates.changed()).await;
        }
    }

    /// Whether new jobs are accepted
    pub async fn is_accepting(&self) -> bool {
        self.sender.read().await.is_some()
    }

    /// Stop accepting jobs, finish everything already queued, and join the
    /// workers
    pub async fn shutdown(&self) {
        let Some(sender) = self.sender.write().await.take() else {
            return;
        };
        drop(sender);
        tracing::info!("Dispatcher draining");

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                tracing::error!("Worker terminated abnormally: {e}");
            }
        }
        tracing::info!("Dispatcher stopped");
    }
}

/// Restart the retention window of a job that just finished
///
/// A record that was already reclaimed by `take_result` stays reclaimed.
async fn refresh_retention(jobs: &Cache<JobId, Arc<JobRecord>>, record: Arc<JobRecord>) {
    let _ = jobs
        .entry(record.id)
        .and_compute_with(|current| async move {
            match current {
                Some(_) => Op::Put(record),
                None => Op::Nop,
            }
        })
        .await;
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    executor: Arc<dyn JobExecutor>,
    jobs: Cache<JobId, Arc<JobRecord>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(QueuedJob { record, request }) = next else {
            break;
        };

        if !record.transition(JobState::Running) {
            tracing::debug!(
                "Worker {worker_id} skipping job {} ({})",
                record.id,
                record.status()
            );
            continue;
        }

        tracing::debug!("Worker {worker_id} running {} job {}", record.kind, record.id);
        let started = Instant::now();

        // A separate task turns panics into a JoinError instead of killing
        // the worker.
        let executor = Arc::clone(&executor);
        let outcome = tokio::spawn(async move { executor.execute(request).await }).await;

        let next = match outcome {
            Ok(Ok(output)) => JobState::Succeeded(output),
            Ok(Err(err)) => {
                tracing::warn!("Job {} failed: {err}", record.id);
                JobState::Failed(JobFailure::from(&err))
            }
            Err(join_err) => {
                tracing::error!("Job {} aborted: {join_err}", record.id);
                JobState::Failed(JobFailure {
                    kind: FailureKind::Internal,
                    detail: format!("job task aborted: {join_err}"),
                })
            }
        };
        record.transition(next);

        tracing::info!(
            "Job {} finished as {} in {:?}",
            record.id,
            record.status(),
            started.elapsed()
        );

        refresh_retention(&jobs, record).await;
    }
    tracing::debug!("Worker {worker_id} stopped");
}

// ============================================================================
// Tests
// ============================================================================
