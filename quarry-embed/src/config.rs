//! Configuration for embedding and rerank models

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};

/// Provider credentials and endpoint for one model.
///
/// Passed explicitly into every provider call rather than held as ambient
/// client state: a single process serves many datasets, each of which may
/// resolve to a different provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    /// Bearer token for the provider
    pub api_key: String,
    /// Optional organization header value
    #[serde(default)]
    pub organization: Option<String>,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            organization: None,
        }
    }

    /// Endpoint URL for a given API path, tolerating trailing slashes.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Capability limits declared for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Largest number of texts the provider accepts in one call.
    /// A value of 1 marks a single-text-only model.
    pub max_batch_size: usize,
    /// Longest input text the model accepts, in characters
    #[serde(default)]
    pub max_text_length: Option<usize>,
    /// Declared embedding dimension, when known up front
    #[serde(default)]
    pub dimension: Option<usize>,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            max_batch_size: 16,
            max_text_length: None,
            dimension: None,
        }
    }
}

/// Resolved configuration for one embedding or rerank model.
///
/// Produced by the model registry from a stored model record; everything a
/// provider call needs travels inside this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider-side model identifier, e.g. `text-embedding-3-small`
    pub model_id: String,
    /// Provider name, for logs and diagnostics
    pub provider: String,
    /// Credentials and endpoint
    pub api: ApiConfig,
    /// Capability limits
    pub capabilities: ModelCapabilities,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>, provider: impl Into<String>, api: ApiConfig) -> Self {
        Self {
            model_id: model_id.into(),
            provider: provider.into(),
            api,
            capabilities: ModelCapabilities::default(),
        }
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.capabilities.dimension = Some(dimension);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.capabilities.max_batch_size = max_batch_size;
        self
    }

    pub fn with_max_text_length(mut self, max_text_length: usize) -> Self {
        self.capabilities.max_text_length = Some(max_text_length);
        self
    }

    /// Batch size to use for a run of `total_count` texts.
    ///
    /// The smallest of the model limit, the caller's preference, and the
    /// remaining work. Single-text-only models always get 1.
    pub fn optimal_batch_size(&self, total_count: usize, preferred: usize) -> usize {
        if self.capabilities.max_batch_size == 1 {
            return 1;
        }
        self.capabilities
            .max_batch_size
            .min(preferred)
            .min(total_count)
            .max(1)
    }

    /// Validate that the configuration can actually be used for calls.
    pub fn validate(&self) -> Result<()> {
        if self.api.base_url.is_empty() {
            return Err(EmbedError::invalid_config(format!(
                "model {} has no base URL",
                self.model_id
            )));
        }
        if self.api.api_key.is_empty() {
            return Err(EmbedError::invalid_config(format!(
                "model {} has no API key",
                self.model_id
            )));
        }
        Ok(())
    }
}

/// Validate one embedding vector against the model that produced it.
///
/// Rejects empty vectors, vectors whose length differs from the model's
/// declared dimension, and vectors containing NaN or infinite components.
pub fn validate_embedding(vector: &[f32], config: &ModelConfig) -> Result<()> {
    if vector.is_empty() {
        return Err(EmbedError::invalid_input(format!(
            "model {} returned an empty embedding",
            config.model_id
        )));
    }
    if let Some(dimension) = config.capabilities.dimension {
        if vector.len() != dimension {
            return Err(EmbedError::invalid_input(format!(
                "embedding dimension mismatch: got {}, model {} declares {}",
                vector.len(),
                config.model_id,
                dimension
            )));
        }
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EmbedError::invalid_input(format!(
            "model {} returned a non-finite embedding component",
            config.model_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_batch: usize) -> ModelConfig {
        ModelConfig::new("test-embed", "test", ApiConfig::new("http://localhost:9/v1", "sk-test"))
            .with_max_batch_size(max_batch)
            .with_dimension(4)
    }

    #[test]
    fn optimal_batch_size_takes_the_minimum() {
        let model = config(32);
        assert_eq!(model.optimal_batch_size(100, 16), 16);
        assert_eq!(model.optimal_batch_size(10, 16), 10);
        assert_eq!(model.optimal_batch_size(100, 64), 32);
    }

    #[test]
    fn single_text_models_are_forced_to_one() {
        let model = config(1);
        assert_eq!(model.optimal_batch_size(100, 16), 1);
    }

    #[test]
    fn validate_embedding_rejects_bad_vectors() {
        let model = config(16);

        assert!(validate_embedding(&[], &model).is_err());
        assert!(validate_embedding(&[0.1, 0.2, 0.3], &model).is_err());
        assert!(validate_embedding(&[0.1, f32::NAN, 0.3, 0.4], &model).is_err());
        assert!(validate_embedding(&[0.1, 0.2, f32::INFINITY, 0.4], &model).is_err());
        assert!(validate_embedding(&[0.1, 0.2, 0.3, 0.4], &model).is_ok());
    }

    #[test]
    fn validate_embedding_without_declared_dimension() {
        let mut model = config(16);
        model.capabilities.dimension = None;
        // Any finite non-empty length is acceptable when nothing is declared.
        assert!(validate_embedding(&[0.5; 7], &model).is_ok());
    }

    #[test]
    fn endpoint_handles_trailing_slash() {
        let api = ApiConfig::new("https://api.example.com/v1/", "k");
        assert_eq!(api.endpoint("embeddings"), "https://api.example.com/v1/embeddings");
    }
}
