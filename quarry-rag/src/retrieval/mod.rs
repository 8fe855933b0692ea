//! Retrieval engine: vector, full-text, and hybrid search over a dataset
//!
//! ## Dispatch
//!
//! ```text
//!                         ┌─ vector ──── embed query → cosine top-k ─┐
//! queryDatasetWithConfig ─┼─ full_text ─ tokenize → FTS5 bm25 ───────┼─ chunks
//!                         └─ hybrid ──── both concurrently → fusion ─┘
//!                                              (weighted_score | rerank)
//! ```
//!
//! Dispatch errors are logged with their mode and propagate to the caller.
//! The one exception is the rerank pass: a rerank failure degrades to the
//! pre-rerank ordering instead of failing the whole request.

use anyhow::{Result, anyhow};
use quarry_embed::{EmbeddingClient, RerankClient, validate_embedding};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub mod fusion;
pub mod query;

use crate::storage::{
    Dataset, FusionStrategy, RetrievalMode, RetrievalSettings, Segment, SegmentId, SegmentIndex,
};

/// Lexical ranks (negated bm25) are multiplied by this constant to land on
/// the cosine 0–1 scale before they meet vector scores.
pub const TEXT_SCORE_SCALE: f32 = 0.05;

/// One retrieval hit with everything a caller needs to render a citation.
#[derive(Debug, Clone)]
pub struct RetrievalChunk {
    pub id: SegmentId,
    pub document_id: String,
    pub content: String,
    pub score: f32,
    pub metadata: Option<serde_json::Value>,
    pub chunk_index: usize,
    pub content_length: usize,
    /// Source file name of the owning document
    pub source_name: String,
}

/// Result of one query, with wall-clock time spent.
#[derive(Debug)]
pub struct QueryOutcome {
    pub chunks: Vec<RetrievalChunk>,
    pub total_time: Duration,
}

/// Query-side engine over completed, enabled segments.
#[derive(Clone)]
pub struct RetrievalEngine {
    index: SegmentIndex,
    embeddings: Arc<dyn EmbeddingClient>,
    reranker: Arc<dyn RerankClient>,
}

impl RetrievalEngine {
    pub fn new(
        index: SegmentIndex,
        embeddings: Arc<dyn EmbeddingClient>,
        reranker: Arc<dyn RerankClient>,
    ) -> Self {
        Self {
            index,
            embeddings,
            reranker,
        }
    }

    /// Answer a query against a dataset.
    ///
    /// The effective configuration is `custom` when given, otherwise the
    /// dataset's stored retrieval settings; the dataset's retrieval mode
    /// picks the search path.
    pub async fn query_dataset_with_config(
        &self,
        dataset_id: &str,
        query_text: &str,
        custom: Option<RetrievalSettings>,
    ) -> Result<QueryOutcome> {
        let start = Instant::now();
        let dataset = self
            .index
            .get_dataset(dataset_id)
            .await?
            .ok_or_else(|| anyhow!("dataset not found: {dataset_id}"))?;
        let settings = custom.unwrap_or_else(|| dataset.retrieval_config.clone());
        let mode = dataset.retrieval_mode;
        debug!(dataset_id, mode = mode.as_str(), top_k = settings.top_k, "dispatching retrieval");

        let result = match mode {
            RetrievalMode::Vector => self.vector_mode(&dataset, query_text, &settings).await,
            RetrievalMode::FullText => self.text_branch(&dataset, query_text, settings.top_k).await,
            RetrievalMode::Hybrid => self.hybrid_mode(&dataset, query_text, &settings).await,
        };

        match result {
            Ok(chunks) => Ok(QueryOutcome {
                chunks,
                total_time: start.elapsed(),
            }),
            Err(e) => {
                error!(dataset_id, mode = mode.as_str(), "retrieval failed: {e:#}");
                Err(e)
            }
        }
    }

    async fn vector_mode(
        &self,
        dataset: &Dataset,
        query_text: &str,
        settings: &RetrievalSettings,
    ) -> Result<Vec<RetrievalChunk>> {
        let chunks = self.vector_branch(dataset, query_text, settings.top_k).await?;
        let chunks = fusion::apply_threshold(chunks, settings);
        if settings.rerank.enabled {
            Ok(self
                .rerank_pass(query_text, chunks, settings, settings.top_k)
                .await)
        } else {
            Ok(chunks)
        }
    }

    async fn hybrid_mode(
        &self,
        dataset: &Dataset,
        query_text: &str,
        settings: &RetrievalSettings,
    ) -> Result<Vec<RetrievalChunk>> {
        // Oversample both sources so fusion has something to rank.
        let limit = fusion::candidate_limit(settings.top_k);
        let (vector, text) = futures::join!(
            self.vector_branch(dataset, query_text, limit),
            self.text_branch(dataset, query_text, limit),
        );
        let (vector, text) = (vector?, text?);
        debug!(
            dataset_id = %dataset.id,
            vector_candidates = vector.len(),
            text_candidates = text.len(),
            "hybrid fan-out complete"
        );

        match settings.strategy {
            FusionStrategy::WeightedScore => Ok(fusion::fuse_weighted(
                vector,
                text,
                &settings.weights,
                settings.top_k,
            )),
            FusionStrategy::Rerank => {
                let merged = fusion::merge_max(vector, text);
                Ok(self
                    .rerank_pass(query_text, merged, settings, settings.top_k)
                    .await)
            }
        }
    }

    /// Cosine nearest neighbors among completed, enabled segments.
    async fn vector_branch(
        &self,
        dataset: &Dataset,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalChunk>> {
        let model = self
            .index
            .active_model(&dataset.embedding_model_id)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "unknown or inactive embedding model: {}",
                    dataset.embedding_model_id
                )
            })?
            .to_config();

        let query_vector = self.embeddings.embed_one(&model, query_text).await?;
        validate_embedding(&query_vector, &model)?;

        let candidates = self.index.vector_candidates(&dataset.id).await?;
        let mut chunks: Vec<RetrievalChunk> = candidates
            .into_iter()
            .filter_map(|(segment, source_name)| {
                let embedding = segment.embedding.as_deref()?;
                if embedding.len() != query_vector.len() {
                    warn!(
                        segment_id = segment.id,
                        "skipping segment with stale vector dimension"
                    );
                    return None;
                }
                let score = cosine_similarity(&query_vector, embedding);
                Some(chunk_from_segment(segment, source_name, score))
            })
            .collect();

        fusion::sort_by_score(&mut chunks);
        chunks.truncate(limit);
        Ok(chunks)
    }

    /// Lexical ranking through the FTS5 operator.
    async fn text_branch(
        &self,
        dataset: &Dataset,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<RetrievalChunk>> {
        let terms = query::query_terms(query_text, query::MAX_QUERY_TERMS);
        let Some(expression) = query::match_expression(&terms) else {
            return Ok(Vec::new());
        };

        let hits = self
            .index
            .fts_candidates(&dataset.id, &expression, limit)
            .await?;
        Ok(hits
            .into_iter()
            .map(|(segment, source_name, rank)| {
                chunk_from_segment(segment, source_name, rank * TEXT_SCORE_SCALE)
            })
            .collect())
    }

    /// Re-score candidates with the configured rerank model.
    ///
    /// Infallible by contract: when reranking is disabled, unresolvable, or
    /// the provider call fails, the input set falls back to its original
    /// scores — threshold-filtered, sorted, truncated, untouched otherwise.
    async fn rerank_pass(
        &self,
        query_text: &str,
        chunks: Vec<RetrievalChunk>,
        settings: &RetrievalSettings,
        top_k: usize,
    ) -> Vec<RetrievalChunk> {
        let fallback = |chunks: Vec<RetrievalChunk>| {
            let mut chunks = fusion::apply_threshold(chunks, settings);
            fusion::sort_by_score(&mut chunks);
            chunks.truncate(top_k);
            chunks
        };

        if chunks.is_empty() || !settings.rerank.enabled {
            return fallback(chunks);
        }
        let Some(model_id) = settings.rerank.model_id.as_deref() else {
            warn!("rerank enabled without a model, using score order");
            return fallback(chunks);
        };
        let model = match self.index.active_model(model_id).await {
            Ok(Some(record)) => record.to_config(),
            Ok(None) => {
                warn!(model_id, "rerank model missing or inactive, using score order");
                return fallback(chunks);
            }
            Err(e) => {
                warn!(model_id, "rerank model lookup failed, using score order: {e:#}");
                return fallback(chunks);
            }
        };

        let documents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        match self
            .reranker
            .rerank(&model, query_text, &documents, documents.len())
            .await
        {
            Ok(hits) => {
                let mut reranked: Vec<RetrievalChunk> = hits
                    .into_iter()
                    .filter_map(|hit| {
                        chunks.get(hit.index).map(|chunk| {
                            let mut chunk = chunk.clone();
                            chunk.score = hit.relevance_score;
                            chunk
                        })
                    })
                    .collect();
                reranked = fusion::apply_threshold(reranked, settings);
                fusion::sort_by_score(&mut reranked);
                reranked.truncate(top_k);
                reranked
            }
            Err(e) => {
                warn!("rerank call failed, using score order: {e}");
                fallback(chunks)
            }
        }
    }
}

fn chunk_from_segment(segment: Segment, source_name: String, score: f32) -> RetrievalChunk {
    RetrievalChunk {
        id: segment.id,
        document_id: segment.document_id,
        content: segment.content,
        score,
        metadata: segment.metadata,
        chunk_index: segment.chunk_index,
        content_length: segment.content_length,
        source_name,
    }
}

/// Cosine similarity between two f32 vectors of equal length.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x.powi(2)).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x.powi(2)).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}
