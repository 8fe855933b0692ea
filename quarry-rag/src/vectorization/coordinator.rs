//! Orchestration of one vectorization run
//!
//! The coordinator wires the state manager, the generator, and the model
//! registry into a single entry point per entity. Its contract with callers
//! (queue workers, retry endpoints) is strict: **it never returns an
//! error**. Every failure — a missing document, an unresolvable model, an
//! unexpected storage fault — becomes a structured [`VectorizationResult`]
//! with `success == false`, and the affected document is marked failed.
//! Callers branch on the flag, not on exceptions.

use anyhow::{Result, anyhow};
use quarry_embed::EmbeddingClient;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::generator::{EmbeddingGenerator, ProgressObserver, SegmentFailure};
use super::state::StateManager;
use crate::storage::{DocumentStatus, SegmentId, SegmentIndex};

/// What a [`VectorizationResult`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Document,
    Dataset,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Document => "document",
            EntityType::Dataset => "dataset",
        }
    }
}

/// Structured outcome of a vectorization run.
///
/// `success` means "no segment was lost": a run that completed with
/// `failure_count > 0` reports `success == false` even though the pipeline
/// itself finished normally.
#[derive(Debug)]
pub struct VectorizationResult {
    pub success: bool,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub total_segments: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub processing_time: Duration,
    pub final_status: DocumentStatus,
    /// Entity-level error (missing entity, bad model), when one aborted the run
    pub error: Option<String>,
    /// Per-segment failures with classified error types
    pub errors: Vec<SegmentFailure>,
}

impl VectorizationResult {
    fn no_op(
        entity_type: EntityType,
        entity_id: &str,
        final_status: DocumentStatus,
        processing_time: Duration,
    ) -> Self {
        Self {
            success: true,
            entity_type,
            entity_id: entity_id.to_string(),
            total_segments: 0,
            success_count: 0,
            failure_count: 0,
            processing_time,
            final_status,
            error: None,
            errors: Vec::new(),
        }
    }

    fn entity_failure(
        entity_type: EntityType,
        entity_id: &str,
        error: String,
        processing_time: Duration,
    ) -> Self {
        Self {
            success: false,
            entity_type,
            entity_id: entity_id.to_string(),
            total_segments: 0,
            success_count: 0,
            failure_count: 0,
            processing_time,
            final_status: DocumentStatus::Failed,
            error: Some(error),
            errors: Vec::new(),
        }
    }
}

/// Drives document and dataset vectorization runs end to end.
#[derive(Clone)]
pub struct VectorizationCoordinator {
    index: SegmentIndex,
    state: StateManager,
    generator: EmbeddingGenerator,
}

impl VectorizationCoordinator {
    pub fn new(index: SegmentIndex, client: Arc<dyn EmbeddingClient>) -> Self {
        let state = StateManager::new(index.clone());
        Self {
            index,
            state,
            generator: EmbeddingGenerator::new(client),
        }
    }

    /// The state manager this coordinator writes through.
    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Vectorize every pending segment of one document.
    pub async fn vectorize_document(
        &self,
        document_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> VectorizationResult {
        let start = Instant::now();
        match self.vectorize_document_inner(document_id, observer, start).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("{e:#}");
                error!(document_id, "document vectorization aborted: {message}");
                if let Err(mark_err) = self.state.mark_document_failed(document_id, &message).await
                {
                    warn!(document_id, "could not record failure: {mark_err:#}");
                }
                VectorizationResult::entity_failure(
                    EntityType::Document,
                    document_id,
                    message,
                    start.elapsed(),
                )
            }
        }
    }

    async fn vectorize_document_inner(
        &self,
        document_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
        start: Instant,
    ) -> Result<VectorizationResult> {
        let document = self
            .index
            .get_document(document_id)
            .await?
            .ok_or_else(|| anyhow!("document not found: {document_id}"))?;

        self.state.initialize_document(document_id).await?;

        let model = self
            .index
            .active_model(&document.embedding_model_id)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "unknown or inactive embedding model: {}",
                    document.embedding_model_id
                )
            })?
            .to_config();

        // Only pending segments take part: completed and failed rows from a
        // previous partial run are left exactly as they are.
        let pending = self.index.pending_segments(document_id).await?;
        if pending.is_empty() {
            let (final_status, _) = self.state.resync_document_status(document_id).await?;
            debug!(document_id, "no pending segments, nothing to vectorize");
            return Ok(VectorizationResult::no_op(
                EntityType::Document,
                document_id,
                final_status,
                start.elapsed(),
            ));
        }

        let ids: Vec<SegmentId> = pending.iter().map(|s| s.id).collect();
        self.state.mark_segments_processing(&ids).await?;

        // Progress fan-out: every generator tick goes to the caller's
        // observer directly and to a coarse database write through a channel,
        // so a slow write never stalls the embedding loop.
        let (tick_tx, tick_rx) = flume::unbounded::<u8>();
        let drain_state = self.state.clone();
        let drain_id = document_id.to_string();
        let drain = tokio::spawn(async move {
            while let Ok(percent) = tick_rx.recv_async().await {
                if let Err(e) = drain_state.update_document_progress(&drain_id, percent).await {
                    warn!(document_id = %drain_id, "progress write failed: {e:#}");
                }
            }
        });

        let chained = {
            let observer = observer.clone();
            move |succeeded: usize, total: usize, percent: u8| {
                let _ = tick_tx.send(percent);
                if let Some(observer) = &observer {
                    observer.on_progress(succeeded, total, percent);
                }
            }
        };

        let report = self
            .generator
            .batch_embed(&pending, &model, None, Some(&chained))
            .await;

        drop(chained);
        let _ = drain.await;

        self.state.save_embedding_results(&report.results).await?;
        let (final_status, _) = self.state.resync_document_status(document_id).await?;

        info!(
            document_id,
            total = pending.len(),
            succeeded = report.success_count,
            failed = report.failure_count,
            status = final_status.as_str(),
            "document vectorization finished"
        );

        Ok(VectorizationResult {
            success: report.failure_count == 0,
            entity_type: EntityType::Document,
            entity_id: document_id.to_string(),
            total_segments: pending.len(),
            success_count: report.success_count,
            failure_count: report.failure_count,
            processing_time: start.elapsed(),
            final_status,
            error: None,
            errors: report.errors,
        })
    }

    /// Vectorize every document of a dataset, one at a time.
    ///
    /// Per-document failures do not stop the run; the aggregate result
    /// reports the sum of all documents.
    pub async fn vectorize_dataset(
        &self,
        dataset_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> VectorizationResult {
        let start = Instant::now();
        match self.vectorize_dataset_inner(dataset_id, observer, start).await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("{e:#}");
                error!(dataset_id, "dataset vectorization aborted: {message}");
                VectorizationResult::entity_failure(
                    EntityType::Dataset,
                    dataset_id,
                    message,
                    start.elapsed(),
                )
            }
        }
    }

    async fn vectorize_dataset_inner(
        &self,
        dataset_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
        start: Instant,
    ) -> Result<VectorizationResult> {
        self.index
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| anyhow!("dataset not found: {dataset_id}"))?;

        let documents = self.index.documents_of_dataset(dataset_id).await?;
        let total_pending = self.index.count_pending_in_dataset(dataset_id).await?;

        let mut offset = 0usize;
        let mut total_segments = 0;
        let mut success_count = 0;
        let mut failure_count = 0;
        let mut errors = Vec::new();
        let mut entity_errors: Vec<String> = Vec::new();
        let mut all_success = true;

        for document in &documents {
            // Scale per-document ticks onto the dataset-wide total so the
            // caller sees one monotonic 0-100 ramp.
            let doc_observer: Option<Arc<dyn ProgressObserver>> = observer.clone().map(|outer| {
                let base = offset;
                let total = total_pending.max(1);
                Arc::new(move |succeeded: usize, _total: usize, _percent: u8| {
                    let done = base + succeeded;
                    let percent = ((done as f64 / total as f64) * 100.0).round() as u8;
                    outer.on_progress(done, total, percent);
                }) as Arc<dyn ProgressObserver>
            });

            let result = self.vectorize_document(&document.id, doc_observer).await;
            offset += result.success_count;
            total_segments += result.total_segments;
            success_count += result.success_count;
            failure_count += result.failure_count;
            errors.extend(result.errors);
            if let Some(error) = result.error {
                entity_errors.push(format!("{}: {error}", document.id));
            }
            all_success &= result.success;
        }

        let final_status = if all_success {
            DocumentStatus::Completed
        } else if success_count == 0 {
            DocumentStatus::Failed
        } else {
            DocumentStatus::Error
        };

        info!(
            dataset_id,
            documents = documents.len(),
            total_segments,
            succeeded = success_count,
            failed = failure_count,
            "dataset vectorization finished"
        );

        Ok(VectorizationResult {
            success: all_success,
            entity_type: EntityType::Dataset,
            entity_id: dataset_id.to_string(),
            total_segments,
            success_count,
            failure_count,
            processing_time: start.elapsed(),
            final_status,
            error: if entity_errors.is_empty() {
                None
            } else {
                Some(entity_errors.join("; "))
            },
            errors,
        })
    }

    /// Reset a document's failed segments and run vectorization again.
    ///
    /// With nothing to reset this is a completed no-op; callers get an
    /// immediate result without a provider round trip.
    pub async fn retry_document(
        &self,
        document_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> VectorizationResult {
        let start = Instant::now();
        let reset = match self.state.reset_failed_segments_by_document(document_id).await {
            Ok(reset) => reset,
            Err(e) => {
                let message = format!("{e:#}");
                error!(document_id, "retry reset failed: {message}");
                return VectorizationResult::entity_failure(
                    EntityType::Document,
                    document_id,
                    message,
                    start.elapsed(),
                );
            }
        };

        if reset == 0 {
            debug!(document_id, "retry requested but no failed segments");
            let final_status = match self.index.get_document(document_id).await {
                Ok(Some(document)) => document.status,
                _ => DocumentStatus::Completed,
            };
            return VectorizationResult::no_op(
                EntityType::Document,
                document_id,
                final_status,
                start.elapsed(),
            );
        }

        info!(document_id, reset, "retrying failed segments");
        self.vectorize_document(document_id, observer).await
    }

    /// Dataset-wide variant of [`retry_document`](Self::retry_document).
    pub async fn retry_dataset(
        &self,
        dataset_id: &str,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> VectorizationResult {
        let start = Instant::now();
        let reset = match self.state.reset_failed_segments_by_dataset(dataset_id).await {
            Ok(reset) => reset,
            Err(e) => {
                let message = format!("{e:#}");
                error!(dataset_id, "retry reset failed: {message}");
                return VectorizationResult::entity_failure(
                    EntityType::Dataset,
                    dataset_id,
                    message,
                    start.elapsed(),
                );
            }
        };

        if reset == 0 {
            debug!(dataset_id, "retry requested but no failed segments");
            return VectorizationResult::no_op(
                EntityType::Dataset,
                dataset_id,
                DocumentStatus::Completed,
                start.elapsed(),
            );
        }

        info!(dataset_id, reset, "retrying failed segments");
        self.vectorize_dataset(dataset_id, observer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Dataset, Document, NewSegment, SegmentStatus};
    use crate::storage::segment_index::ModelRecord;
    use async_trait::async_trait;
    use quarry_embed::{EmbedError, ModelConfig, Result as EmbedResult};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic client; fails the calls whose 1-based ordinals are listed.
    struct ScriptedClient {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    impl ScriptedClient {
        fn reliable() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on: Vec::new(),
            })
        }

        fn failing_on(fail_on: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    #[async_trait]
    impl EmbeddingClient for ScriptedClient {
        async fn embed_batch(
            &self,
            _model: &ModelConfig,
            texts: &[String],
        ) -> EmbedResult<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(EmbedError::Api {
                    status: 503,
                    message: "service unavailable".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    async fn seeded_coordinator(client: Arc<dyn EmbeddingClient>) -> Result<(SegmentIndex, VectorizationCoordinator)> {
        let index = SegmentIndex::open_memory().await?;
        index
            .register_model(
                &ModelRecord::new("embed-small", "test", "http://localhost/v1", "sk-test")
                    .with_dimension(2)
                    .with_max_batch_size(2),
            )
            .await?;
        index
            .upsert_dataset(&Dataset::new("ds-1", "kb", "embed-small"))
            .await?;
        index
            .upsert_document(&Document::new("doc-1", "ds-1", "a.md", "embed-small"))
            .await?;
        index
            .insert_segments(
                "doc-1",
                "ds-1",
                &[
                    NewSegment::new(0, "first"),
                    NewSegment::new(1, "second"),
                    NewSegment::new(2, "third"),
                    NewSegment::new(3, "fourth"),
                ],
            )
            .await?;
        let coordinator = VectorizationCoordinator::new(index.clone(), client);
        Ok((index, coordinator))
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn happy_path_completes_every_segment() -> Result<()> {
        let (index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;

        let result = coordinator.vectorize_document("doc-1", None).await;
        assert!(result.success);
        assert_eq!(result.total_segments, 4);
        assert_eq!(result.success_count, 4);
        assert_eq!(result.failure_count, 0);
        assert_eq!(result.final_status, DocumentStatus::Completed);

        let document = index.get_document("doc-1").await?.unwrap();
        assert_eq!(document.status, DocumentStatus::Completed);
        assert_eq!(document.progress, 100);
        let segments = index.segments_of_document("doc-1").await?;
        assert!(segments.iter().all(|s| s.status == SegmentStatus::Completed));
        assert!(segments.iter().all(|s| s.vector_dimension == Some(2)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_document_becomes_a_failed_result() -> Result<()> {
        let (_index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;

        let result = coordinator.vectorize_document("nope", None).await;
        assert!(!result.success);
        assert_eq!(result.final_status, DocumentStatus::Failed);
        assert!(result.error.as_deref().unwrap_or("").contains("not found"));
        Ok(())
    }

    #[tokio::test]
    async fn unresolvable_model_marks_the_document_failed() -> Result<()> {
        let (index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;
        index
            .upsert_document(&Document::new("doc-2", "ds-1", "b.md", "ghost-model"))
            .await?;

        let result = coordinator.vectorize_document("doc-2", None).await;
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap_or("").contains("ghost-model"));

        let document = index.get_document("doc-2").await?.unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(document.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn zero_pending_is_a_no_op_that_preserves_status() -> Result<()> {
        let (index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;

        let first = coordinator.vectorize_document("doc-1", None).await;
        assert!(first.success);

        let second = coordinator.vectorize_document("doc-1", None).await;
        assert!(second.success);
        assert_eq!(second.total_segments, 0);
        assert_eq!(second.final_status, DocumentStatus::Completed);

        let document = index.get_document("doc-1").await?.unwrap();
        assert_eq!(document.status, DocumentStatus::Completed);
        assert_eq!(document.progress, 100);
        Ok(())
    }

    #[tokio::test]
    async fn partial_failure_then_retry_recovers() -> Result<()> {
        // 4 segments at batch size 2: call 1 succeeds, call 2 fails. The
        // retry run then issues one more call (for the 2 reset segments).
        let (index, coordinator) =
            seeded_coordinator(ScriptedClient::failing_on(vec![2])).await?;

        let result = coordinator.vectorize_document("doc-1", None).await;
        assert!(!result.success);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 2);
        assert_eq!(result.final_status, DocumentStatus::Error);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors.iter().all(|e| e.error_type.is_retryable()));

        let document = index.get_document("doc-1").await?.unwrap();
        assert_eq!(document.status, DocumentStatus::Error);
        assert_eq!(document.progress, 50);

        let retry = coordinator.retry_document("doc-1", None).await;
        assert!(retry.success);
        assert_eq!(retry.total_segments, 2);
        assert_eq!(retry.final_status, DocumentStatus::Completed);

        // Nothing failed anymore: a further retry is an immediate no-op.
        let noop = coordinator.retry_document("doc-1", None).await;
        assert!(noop.success);
        assert_eq!(noop.total_segments, 0);
        assert_eq!(noop.final_status, DocumentStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn observer_sees_monotonic_document_progress() -> Result<()> {
        let (_index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;

        let ticks: Arc<Mutex<Vec<(usize, usize, u8)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ticks);
        let observer: Arc<dyn ProgressObserver> =
            Arc::new(move |succeeded: usize, total: usize, percent: u8| {
                sink.lock().unwrap().push((succeeded, total, percent));
            });

        let result = coordinator.vectorize_document("doc-1", Some(observer)).await;
        assert!(result.success);

        let ticks = ticks.lock().unwrap();
        assert_eq!(*ticks, vec![(2, 4, 50), (4, 4, 100)]);
        Ok(())
    }

    #[tokio::test]
    async fn dataset_run_aggregates_documents() -> Result<()> {
        let (index, coordinator) = seeded_coordinator(ScriptedClient::reliable()).await?;
        index
            .upsert_document(&Document::new("doc-2", "ds-1", "b.md", "embed-small"))
            .await?;
        index
            .insert_segments("doc-2", "ds-1", &[NewSegment::new(0, "only one")])
            .await?;

        let result = coordinator.vectorize_dataset("ds-1", None).await;
        assert!(result.success);
        assert_eq!(result.entity_type, EntityType::Dataset);
        assert_eq!(result.total_segments, 5);
        assert_eq!(result.success_count, 5);
        assert_eq!(result.final_status, DocumentStatus::Completed);

        let missing = coordinator.vectorize_dataset("ds-404", None).await;
        assert!(!missing.success);
        assert!(missing.error.is_some());
        Ok(())
    }
}
