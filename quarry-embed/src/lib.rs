//! # quarry-embed
//!
//! Provider-facing half of the quarry RAG core: model configuration,
//! embedding and rerank clients, and the failure taxonomy shared with the
//! vectorization pipeline.
//!
//! ## Design
//!
//! - **Explicit credentials**: every call takes a [`ModelConfig`] carrying
//!   its own [`ApiConfig`]; there is no ambient provider state, so one
//!   process can serve many datasets bound to different provider accounts.
//! - **Typed error boundary**: provider SDK error strings are classified
//!   into [`ErrorKind`] inside [`error`] and nowhere else. Callers persist
//!   the stable labels and branch on retryability, never on message text.
//! - **Trait seams**: [`EmbeddingClient`] and [`RerankClient`] keep the
//!   pipeline and the retrieval engine testable with in-process fakes.
//!
//! ## Quick start
//!
//! ```no_run
//! use quarry_embed::{ApiConfig, EmbeddingClient, HttpProviderClient, ModelConfig};
//!
//! # async fn example() -> quarry_embed::Result<()> {
//! let client = HttpProviderClient::new();
//! let model = ModelConfig::new(
//!     "text-embedding-3-small",
//!     "openai",
//!     ApiConfig::new("https://api.openai.com/v1", "sk-..."),
//! )
//! .with_dimension(1536)
//! .with_max_batch_size(64);
//!
//! let vector = client.embed_one(&model, "what is a dataset?").await?;
//! assert_eq!(vector.len(), 1536);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod provider;

// Re-export main types for easy access
pub use config::{ApiConfig, ModelCapabilities, ModelConfig, validate_embedding};
pub use error::{EmbedError, ErrorKind, Result};
pub use provider::{EmbeddingClient, HttpProviderClient, RerankClient, RerankHit};
