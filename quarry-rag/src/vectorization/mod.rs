//! Vectorization pipeline: pending segments in, persisted embeddings out.
//!
//! ```text
//! Document ─▶ StateManager ─▶ pending Segments ─▶ EmbeddingGenerator ─▶ provider
//!     ▲            │                                    │
//!     │            └── transactional persistence ◀──────┘
//!     └──────────── VectorizationCoordinator (never throws)
//! ```
//!
//! The coordinator drives one run end to end; the generator isolates
//! per-batch provider failures; the state manager owns every status write.
//! Jobs arrive through [`queue`], which retries on the result flag with
//! exponential backoff.

pub mod coordinator;
pub mod generator;
pub mod queue;
pub mod state;

pub use coordinator::{EntityType, VectorizationCoordinator, VectorizationResult};
pub use generator::{
    BatchEmbedReport, EmbedOutcome, EmbeddingGenerator, ProgressObserver, SegmentEmbedding,
    SegmentFailure,
};
pub use queue::{JobQueue, JobQueueConfig, TaskKind, TaskPriority, VectorizationTask};
pub use state::{StateManager, derive_document_status};
