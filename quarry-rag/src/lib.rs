//! quarry-rag: vectorization pipeline and retrieval engine for a
//! knowledge-base platform
//!
//! This crate owns the path from ingested document segments to answered
//! queries. Upload parsing, HTTP surfaces, and permissions live elsewhere;
//! here a segment is already text, and the work is embedding it, tracking
//! its status, and searching it.
//!
//! ## Key Modules
//!
//! - **[`storage`]**: SQLite-backed datasets, documents, segments, and the
//!   embedding-model registry
//! - **[`vectorization`]**: state manager, batch generator, run
//!   coordinator, and the in-process job queue
//! - **[`retrieval`]**: vector / full-text / hybrid search with score
//!   fusion and reranking
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_embed::HttpProviderClient;
//! use quarry_rag::retrieval::RetrievalEngine;
//! use quarry_rag::storage::SegmentIndex;
//! use quarry_rag::vectorization::VectorizationCoordinator;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let index = SegmentIndex::open(Path::new("/var/lib/quarry")).await?;
//! let provider = Arc::new(HttpProviderClient::new());
//!
//! let coordinator = VectorizationCoordinator::new(index.clone(), provider.clone());
//! let result = coordinator.vectorize_document("doc-1", None).await;
//! assert!(result.success, "branch on the flag, not on exceptions");
//!
//! let engine = RetrievalEngine::new(index, provider.clone(), provider);
//! let outcome = engine
//!     .query_dataset_with_config("ds-1", "how do refunds work?", None)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Segments → StateManager → Generator → Provider APIs
//!    ↑            ↓                          ↓
//! Ingestion   SQLite (WAL) ← Coordinator ← JobQueue
//!                 ↓
//!          RetrievalEngine → vector | full_text | hybrid
//! ```

pub mod retrieval;
pub mod storage;
pub mod vectorization;
