//! Batch embedding generation with per-batch failure isolation

use quarry_embed::{EmbeddingClient, ErrorKind, ModelConfig, validate_embedding};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::storage::{Segment, SegmentId};

/// Default preferred batch size when the caller expresses no preference.
const DEFAULT_BATCH_SIZE: usize = 16;

/// Progress callback invoked after each batch.
///
/// A single-method interface so the chain queue → coordinator → generator
/// stays plain function composition. `succeeded` counts only items that
/// newly succeeded, so the reported numbers are monotonic and never regress
/// when a batch fails.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, succeeded: usize, total: usize, percent: u8);
}

impl<F> ProgressObserver for F
where
    F: Fn(usize, usize, u8) + Send + Sync,
{
    fn on_progress(&self, succeeded: usize, total: usize, percent: u8) {
        self(succeeded, total, percent)
    }
}

/// Outcome of embedding one segment.
#[derive(Debug, Clone)]
pub enum EmbedOutcome {
    Embedded { vector: Vec<f32> },
    Failed { error: String, error_type: ErrorKind },
}

/// One segment's embedding result, ready for persistence.
#[derive(Debug, Clone)]
pub struct SegmentEmbedding {
    pub segment_id: SegmentId,
    pub document_id: String,
    pub outcome: EmbedOutcome,
}

impl SegmentEmbedding {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, EmbedOutcome::Embedded { .. })
    }
}

/// A failed segment with its classified error, surfaced in run results.
#[derive(Debug, Clone)]
pub struct SegmentFailure {
    pub segment_id: SegmentId,
    pub error: String,
    pub error_type: ErrorKind,
}

/// Full report of one `batch_embed` run.
#[derive(Debug)]
pub struct BatchEmbedReport {
    pub results: Vec<SegmentEmbedding>,
    pub success_count: usize,
    pub failure_count: usize,
    pub processing_time: Duration,
    pub errors: Vec<SegmentFailure>,
}

/// Turns pending segments into embedding vectors through a provider client.
///
/// The generator never fails as a whole: a provider error on one batch marks
/// that batch's segments failed and the run continues with the next batch.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    client: Arc<dyn EmbeddingClient>,
}

impl EmbeddingGenerator {
    pub fn new(client: Arc<dyn EmbeddingClient>) -> Self {
        Self { client }
    }

    /// Embed `segments` in batches sized by the model's limits.
    ///
    /// Batch-capable models get one provider call per batch with all texts,
    /// mapped back positionally; single-text-only models are forced to
    /// batches of one, giving sequential per-segment calls. Each returned
    /// vector is validated against the model before it counts as a success.
    pub async fn batch_embed(
        &self,
        segments: &[Segment],
        model: &ModelConfig,
        preferred_batch_size: Option<usize>,
        observer: Option<&dyn ProgressObserver>,
    ) -> BatchEmbedReport {
        let start = Instant::now();
        let total = segments.len();
        let mut results: Vec<SegmentEmbedding> = Vec::with_capacity(total);
        let mut succeeded = 0usize;

        if total == 0 {
            return Self::finish(results, start);
        }

        let preferred = preferred_batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let batch_size = model.optimal_batch_size(total, preferred);
        debug!(
            model = %model.model_id,
            total,
            batch_size,
            "starting batch embedding"
        );

        for batch in segments.chunks(batch_size) {
            let newly_succeeded = self.embed_batch_isolated(batch, model, &mut results).await;
            succeeded += newly_succeeded;

            if let Some(observer) = observer {
                let percent = ((succeeded as f64 / total as f64) * 100.0).round() as u8;
                observer.on_progress(succeeded, total, percent);
            }
        }

        Self::finish(results, start)
    }

    /// Embed one batch; any failure is recorded against exactly the
    /// segments of this batch. Returns the number of newly-succeeded items.
    async fn embed_batch_isolated(
        &self,
        batch: &[Segment],
        model: &ModelConfig,
        results: &mut Vec<SegmentEmbedding>,
    ) -> usize {
        let texts: Vec<String> = batch.iter().map(|s| s.content.clone()).collect();

        let vectors = match self.client.embed_batch(model, &texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                let error_type = e.kind();
                warn!(
                    model = %model.model_id,
                    batch_len = batch.len(),
                    error_type = %error_type,
                    "batch embedding failed: {e}"
                );
                let message = e.to_string();
                results.extend(batch.iter().map(|segment| SegmentEmbedding {
                    segment_id: segment.id,
                    document_id: segment.document_id.clone(),
                    outcome: EmbedOutcome::Failed {
                        error: message.clone(),
                        error_type,
                    },
                }));
                return 0;
            }
        };

        if vectors.len() != batch.len() {
            let message = format!(
                "provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            );
            warn!(model = %model.model_id, "{message}");
            results.extend(batch.iter().map(|segment| SegmentEmbedding {
                segment_id: segment.id,
                document_id: segment.document_id.clone(),
                outcome: EmbedOutcome::Failed {
                    error: message.clone(),
                    error_type: ErrorKind::Fatal,
                },
            }));
            return 0;
        }

        let mut newly_succeeded = 0;
        for (segment, vector) in batch.iter().zip(vectors) {
            match validate_embedding(&vector, model) {
                Ok(()) => {
                    newly_succeeded += 1;
                    results.push(SegmentEmbedding {
                        segment_id: segment.id,
                        document_id: segment.document_id.clone(),
                        outcome: EmbedOutcome::Embedded { vector },
                    });
                }
                Err(e) => {
                    warn!(segment_id = segment.id, "rejected embedding: {e}");
                    results.push(SegmentEmbedding {
                        segment_id: segment.id,
                        document_id: segment.document_id.clone(),
                        outcome: EmbedOutcome::Failed {
                            error: e.to_string(),
                            error_type: e.kind(),
                        },
                    });
                }
            }
        }
        newly_succeeded
    }

    fn finish(results: Vec<SegmentEmbedding>, start: Instant) -> BatchEmbedReport {
        let success_count = results.iter().filter(|r| r.is_success()).count();
        let failure_count = results.len() - success_count;
        let errors = results
            .iter()
            .filter_map(|r| match &r.outcome {
                EmbedOutcome::Failed { error, error_type } => Some(SegmentFailure {
                    segment_id: r.segment_id,
                    error: error.clone(),
                    error_type: *error_type,
                }),
                EmbedOutcome::Embedded { .. } => None,
            })
            .collect();

        BatchEmbedReport {
            results,
            success_count,
            failure_count,
            processing_time: start.elapsed(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quarry_embed::{ApiConfig, EmbedError, Result as EmbedResult};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model(max_batch: usize) -> ModelConfig {
        ModelConfig::new("test-embed", "test", ApiConfig::new("http://localhost/v1", "k"))
            .with_max_batch_size(max_batch)
            .with_dimension(2)
    }

    fn segment(id: SegmentId, content: &str) -> Segment {
        Segment {
            id,
            document_id: "doc-1".to_string(),
            dataset_id: "ds-1".to_string(),
            chunk_index: id as usize,
            content: content.to_string(),
            content_length: content.len(),
            embedding: None,
            vector_dimension: None,
            embedding_model_id: None,
            status: crate::storage::SegmentStatus::Pending,
            error: None,
            enabled: true,
            metadata: None,
        }
    }

    /// Fails every call whose (1-based) ordinal is listed.
    struct FailingClient {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    #[async_trait]
    impl EmbeddingClient for FailingClient {
        async fn embed_batch(
            &self,
            _model: &ModelConfig,
            texts: &[String],
        ) -> EmbedResult<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(EmbedError::Api {
                    status: 500,
                    message: "internal error".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn failing_batch_is_isolated() {
        let client = Arc::new(FailingClient {
            calls: AtomicUsize::new(0),
            fail_on: vec![2],
        });
        let generator = EmbeddingGenerator::new(client);

        // 6 segments at batch size 2 -> 3 batches; the second one fails.
        let segments: Vec<Segment> = (0..6).map(|i| segment(i, "text")).collect();
        let report = generator
            .batch_embed(&segments, &model(2), Some(2), None)
            .await;

        assert_eq!(report.success_count, 4);
        assert_eq!(report.failure_count, 2);
        assert_eq!(report.results.len(), 6);
        assert_eq!(report.errors.len(), 2);
        assert_eq!(
            report.errors.iter().map(|e| e.segment_id).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(report.errors.iter().all(|e| e.error_type == ErrorKind::Transient));
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_counts_only_successes() {
        let client = Arc::new(FailingClient {
            calls: AtomicUsize::new(0),
            fail_on: vec![2],
        });
        let generator = EmbeddingGenerator::new(client);
        let segments: Vec<Segment> = (0..6).map(|i| segment(i, "text")).collect();

        let ticks: Mutex<Vec<(usize, usize, u8)>> = Mutex::new(Vec::new());
        let observer = |s: usize, t: usize, p: u8| {
            ticks.lock().unwrap().push((s, t, p));
        };
        generator
            .batch_embed(&segments, &model(2), Some(2), Some(&observer))
            .await;

        let ticks = ticks.into_inner().unwrap();
        assert_eq!(ticks, vec![(2, 6, 33), (2, 6, 33), (4, 6, 67)]);
    }

    #[tokio::test]
    async fn invalid_vectors_fail_their_segment_only() {
        struct ShortVectorClient;

        #[async_trait]
        impl EmbeddingClient for ShortVectorClient {
            async fn embed_batch(
                &self,
                _model: &ModelConfig,
                texts: &[String],
            ) -> EmbedResult<Vec<Vec<f32>>> {
                // First text gets a wrong-dimension vector.
                Ok(texts
                    .iter()
                    .enumerate()
                    .map(|(i, _)| if i == 0 { vec![1.0] } else { vec![1.0, 0.0] })
                    .collect())
            }
        }

        let generator = EmbeddingGenerator::new(Arc::new(ShortVectorClient));
        let segments: Vec<Segment> = (0..3).map(|i| segment(i, "text")).collect();
        let report = generator
            .batch_embed(&segments, &model(8), None, None)
            .await;

        assert_eq!(report.success_count, 2);
        assert_eq!(report.failure_count, 1);
        assert_eq!(report.errors[0].segment_id, 0);
        assert_eq!(report.errors[0].error_type, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn single_text_models_issue_one_call_per_segment() {
        let client = Arc::new(FailingClient {
            calls: AtomicUsize::new(0),
            fail_on: vec![],
        });
        let generator = EmbeddingGenerator::new(Arc::clone(&client) as Arc<dyn EmbeddingClient>);
        let segments: Vec<Segment> = (0..4).map(|i| segment(i, "text")).collect();

        let report = generator
            .batch_embed(&segments, &model(1), Some(16), None)
            .await;

        assert_eq!(report.success_count, 4);
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_input_returns_an_empty_report() {
        let client = Arc::new(FailingClient {
            calls: AtomicUsize::new(0),
            fail_on: vec![],
        });
        let generator = EmbeddingGenerator::new(client);
        let report = generator.batch_embed(&[], &model(4), None, None).await;

        assert_eq!(report.success_count, 0);
        assert_eq!(report.failure_count, 0);
        assert!(report.results.is_empty());
    }
}
