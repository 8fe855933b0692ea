//! Storage layer for datasets, documents, and segments
//!
//! This module provides the data types and the SQLite-backed
//! [`SegmentIndex`] that the vectorization pipeline and the retrieval
//! engine share. It owns the canonical status vocabulary and the retrieval
//! configuration format stored on each dataset.
//!
//! ## Ownership model
//!
//! ```text
//! Dataset ── owns ──▶ Document ── owns ──▶ Segment
//!    │                                        │
//!    └── retrieval_config (JSON)              └── embedding (f32 BLOB)
//! ```
//!
//! Segments belong to exactly one document and one dataset; embeddings are
//! recomputed, never migrated, when a dataset's embedding model changes.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

pub mod segment_index;

pub use segment_index::{DatasetStats, ModelRecord, SegmentIndex};

/// Database ID for a segment.
pub type SegmentId = i64;

/// Lifecycle status of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Processing => "processing",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SegmentStatus::Pending),
            "processing" => Ok(SegmentStatus::Processing),
            "completed" => Ok(SegmentStatus::Completed),
            "failed" => Ok(SegmentStatus::Failed),
            other => Err(anyhow!("unknown segment status: {other}")),
        }
    }
}

/// Lifecycle status of one document, derived from its segments.
///
/// `Error` marks the partial case: some segments completed, some failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            "error" => Ok(DocumentStatus::Error),
            other => Err(anyhow!("unknown document status: {other}")),
        }
    }
}

/// How a dataset answers queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Vector,
    FullText,
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::FullText => "full_text",
            RetrievalMode::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(RetrievalMode::Vector),
            "full_text" => Ok(RetrievalMode::FullText),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(anyhow!("unknown retrieval mode: {other}")),
        }
    }
}

/// How hybrid candidate sets are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionStrategy {
    WeightedScore,
    Rerank,
}

impl Default for FusionStrategy {
    fn default() -> Self {
        Self::WeightedScore
    }
}

/// Relative weights for the semantic and keyword sides of weighted fusion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightConfig {
    pub semantic_weight: f32,
    pub keyword_weight: f32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.5,
            keyword_weight: 0.5,
        }
    }
}

impl WeightConfig {
    /// Weights re-normalized to sum to 1, regardless of what the caller
    /// stored. A degenerate zero/negative sum falls back to an even split.
    pub fn normalized(&self) -> (f32, f32) {
        let sum = self.semantic_weight + self.keyword_weight;
        if sum <= 0.0 || !sum.is_finite() {
            (0.5, 0.5)
        } else {
            (self.semantic_weight / sum, self.keyword_weight / sum)
        }
    }
}

/// Rerank pass configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub model_id: Option<String>,
}

/// Per-dataset retrieval configuration, stored as JSON on the dataset row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: f32,
    #[serde(default)]
    pub score_threshold_enabled: bool,
    #[serde(default)]
    pub weights: WeightConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub strategy: FusionStrategy,
}

fn default_top_k() -> usize {
    5
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            score_threshold: 0.0,
            score_threshold_enabled: false,
            weights: WeightConfig::default(),
            rerank: RerankConfig::default(),
            strategy: FusionStrategy::default(),
        }
    }
}

/// A dataset: the unit of retrieval configuration and model binding.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub id: String,
    pub name: String,
    pub embedding_model_id: String,
    pub retrieval_mode: RetrievalMode,
    pub retrieval_config: RetrievalSettings,
    /// Unix timestamp
    pub created_at: i64,
}

impl Dataset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, embedding_model_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            embedding_model_id: embedding_model_id.into(),
            retrieval_mode: RetrievalMode::Vector,
            retrieval_config: RetrievalSettings::default(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_retrieval_mode(mut self, mode: RetrievalMode) -> Self {
        self.retrieval_mode = mode;
        self
    }

    pub fn with_retrieval_config(mut self, config: RetrievalSettings) -> Self {
        self.retrieval_config = config;
        self
    }
}

/// An uploaded document inside a dataset.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub dataset_id: String,
    /// Source file name, surfaced on every retrieval chunk
    pub name: String,
    pub embedding_model_id: String,
    pub status: DocumentStatus,
    /// 0–100, derived from segment statuses
    pub progress: u8,
    pub error: Option<String>,
    pub chunk_count: usize,
    pub character_count: usize,
}

impl Document {
    pub fn new(
        id: impl Into<String>,
        dataset_id: impl Into<String>,
        name: impl Into<String>,
        embedding_model_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            dataset_id: dataset_id.into(),
            name: name.into(),
            embedding_model_id: embedding_model_id.into(),
            status: DocumentStatus::Pending,
            progress: 0,
            error: None,
            chunk_count: 0,
            character_count: 0,
        }
    }
}

/// One stored segment of document text.
#[derive(Debug, Clone)]
pub struct Segment {
    pub id: SegmentId,
    pub document_id: String,
    pub dataset_id: String,
    /// Stable ordering within the document
    pub chunk_index: usize,
    pub content: String,
    pub content_length: usize,
    /// Present iff `status == Completed`
    pub embedding: Option<Vec<f32>>,
    pub vector_dimension: Option<usize>,
    pub embedding_model_id: Option<String>,
    pub status: SegmentStatus,
    pub error: Option<String>,
    pub enabled: bool,
    /// File provenance (page, heading, offsets) as free-form JSON
    pub metadata: Option<serde_json::Value>,
}

/// Input for segment ingestion; ids and status are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub chunk_index: usize,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewSegment {
    pub fn new(chunk_index: usize, content: impl Into<String>) -> Self {
        Self {
            chunk_index,
            content: content.into(),
            metadata: None,
        }
    }
}

/// Segment status tallies for one document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_normalization() {
        let weights = WeightConfig {
            semantic_weight: 0.6,
            keyword_weight: 0.6,
        };
        assert_eq!(weights.normalized(), (0.5, 0.5));

        let weights = WeightConfig {
            semantic_weight: 3.0,
            keyword_weight: 1.0,
        };
        assert_eq!(weights.normalized(), (0.75, 0.25));

        let weights = WeightConfig {
            semantic_weight: 0.0,
            keyword_weight: 0.0,
        };
        assert_eq!(weights.normalized(), (0.5, 0.5));
    }

    #[test]
    fn retrieval_settings_tolerate_sparse_json() {
        let settings: RetrievalSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.top_k, 5);
        assert!(!settings.score_threshold_enabled);
        assert!(matches!(settings.strategy, FusionStrategy::WeightedScore));

        let settings: RetrievalSettings =
            serde_json::from_str(r#"{"top_k": 3, "strategy": "rerank"}"#).unwrap();
        assert_eq!(settings.top_k, 3);
        assert!(matches!(settings.strategy, FusionStrategy::Rerank));
    }

    #[test]
    fn status_round_trips() {
        for status in [
            SegmentStatus::Pending,
            SegmentStatus::Processing,
            SegmentStatus::Completed,
            SegmentStatus::Failed,
        ] {
            assert_eq!(SegmentStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SegmentStatus::parse("done").is_err());
        assert_eq!(
            DocumentStatus::parse("error").unwrap(),
            DocumentStatus::Error
        );
    }
}
