//! In-process job queue for vectorization runs
//!
//! The external platform scheduler is free to replace this; the types here
//! are the seam it plugs into. Workers branch on
//! [`VectorizationResult::success`](super::VectorizationResult) — the
//! coordinator never throws — and requeue failed jobs with exponential
//! backoff until their attempts run out.

use anyhow::{Result, bail};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use super::coordinator::VectorizationCoordinator;
use super::generator::ProgressObserver;

/// Priority levels for vectorization tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Bulk work (e.g. dataset-wide re-embedding after a model change)
    Background = 0,
    /// Freshly uploaded documents
    Normal = 1,
    /// User-triggered retries
    High = 2,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// What a task operates on
#[derive(Debug, Clone)]
pub enum TaskKind {
    VectorizeDocument { document_id: String },
    VectorizeDataset { dataset_id: String },
    RetryDocument { document_id: String },
    RetryDataset { dataset_id: String },
}

/// A queued vectorization job
#[derive(Debug, Clone)]
pub struct VectorizationTask {
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub created_at: u64, // Unix timestamp in seconds
    pub attempts: u32,
}

impl VectorizationTask {
    pub fn new(kind: TaskKind, priority: TaskPriority) -> Self {
        Self {
            kind,
            priority,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            attempts: 0,
        }
    }

    pub fn document(document_id: impl Into<String>) -> Self {
        Self::new(
            TaskKind::VectorizeDocument {
                document_id: document_id.into(),
            },
            TaskPriority::Normal,
        )
    }

    pub fn dataset(dataset_id: impl Into<String>) -> Self {
        Self::new(
            TaskKind::VectorizeDataset {
                dataset_id: dataset_id.into(),
            },
            TaskPriority::Background,
        )
    }

    pub fn retry_document(document_id: impl Into<String>) -> Self {
        Self::new(
            TaskKind::RetryDocument {
                document_id: document_id.into(),
            },
            TaskPriority::High,
        )
    }

    pub fn retry_dataset(dataset_id: impl Into<String>) -> Self {
        Self::new(
            TaskKind::RetryDataset {
                dataset_id: dataset_id.into(),
            },
            TaskPriority::High,
        )
    }

    /// Record one more attempt against this task.
    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Whether the task still has attempts left under `max_attempts`.
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }

    /// Get a description of the task for logging
    pub fn description(&self) -> String {
        match &self.kind {
            TaskKind::VectorizeDocument { document_id } => {
                format!("vectorize document {document_id}")
            }
            TaskKind::VectorizeDataset { dataset_id } => format!("vectorize dataset {dataset_id}"),
            TaskKind::RetryDocument { document_id } => format!("retry document {document_id}"),
            TaskKind::RetryDataset { dataset_id } => format!("retry dataset {dataset_id}"),
        }
    }
}

/// Configuration for the job queue
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Maximum number of queued tasks before submissions are rejected
    pub max_queue_size: usize,
    /// Attempts per task, counting the first run
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per further attempt
    pub initial_backoff: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

/// Bounded channel of vectorization jobs.
///
/// Cheap to clone; every clone feeds the same queue.
#[derive(Clone)]
pub struct JobQueue {
    config: JobQueueConfig,
    sender: flume::Sender<VectorizationTask>,
    receiver: flume::Receiver<VectorizationTask>,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig) -> Self {
        let (sender, receiver) = flume::bounded(config.max_queue_size);
        Self {
            config,
            sender,
            receiver,
        }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Submit a task; fails when the queue is full or shut down.
    pub fn submit(&self, task: VectorizationTask) -> Result<()> {
        debug!("submitting task: {}", task.description());
        match self.sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(task)) => {
                warn!("job queue is full, dropping task: {}", task.description());
                bail!("job queue is full")
            }
            Err(flume::TrySendError::Disconnected(_)) => bail!("job queue is shut down"),
        }
    }

    /// Non-blocking receive, for drain-style processing.
    pub fn try_recv(&self) -> Option<VectorizationTask> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Run a worker loop until every queue handle is dropped.
    ///
    /// Each task runs through the coordinator; a result with
    /// `success == false` is requeued with exponential backoff while the
    /// task has attempts left. The backoff sleep happens in a spawned task
    /// so the worker keeps draining in the meantime.
    pub async fn run_worker(
        &self,
        coordinator: Arc<VectorizationCoordinator>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) {
        while let Ok(mut task) = self.receiver.recv_async().await {
            task.record_attempt();

            let result = match &task.kind {
                TaskKind::VectorizeDocument { document_id } => {
                    coordinator
                        .vectorize_document(document_id, observer.clone())
                        .await
                }
                TaskKind::VectorizeDataset { dataset_id } => {
                    coordinator
                        .vectorize_dataset(dataset_id, observer.clone())
                        .await
                }
                TaskKind::RetryDocument { document_id } => {
                    coordinator
                        .retry_document(document_id, observer.clone())
                        .await
                }
                TaskKind::RetryDataset { dataset_id } => {
                    coordinator.retry_dataset(dataset_id, observer.clone()).await
                }
            };

            if result.success {
                info!(
                    attempts = task.attempts,
                    succeeded = result.success_count,
                    "completed task: {}",
                    task.description()
                );
                continue;
            }

            if task.should_retry(self.config.max_attempts) {
                let backoff = self.config.initial_backoff * 2u32.pow(task.attempts - 1);
                warn!(
                    attempts = task.attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    "task failed, requeueing: {}",
                    task.description()
                );
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    if sender.send_async(task).await.is_err() {
                        warn!("queue closed before a retry could be submitted");
                    }
                });
            } else {
                error!(
                    attempts = task.attempts,
                    error = result.error.as_deref().unwrap_or("segment failures"),
                    "task exhausted its attempts: {}",
                    task.description()
                );
            }
        }
    }
}
