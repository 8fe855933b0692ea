//! Provider clients for embedding and rerank calls

use crate::config::ModelConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// One rerank result: the index of the scored document in the request order
/// plus its relevance score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankHit {
    pub index: usize,
    pub relevance_score: f32,
}

/// A client that turns batches of texts into embedding vectors.
///
/// Credentials come in through the [`ModelConfig`] on every call; the client
/// itself holds only transport state, so one instance can serve models from
/// many provider accounts concurrently.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed_batch(&self, model: &ModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text. Thin wrapper over [`embed_batch`](Self::embed_batch)
    /// for query-time use.
    async fn embed_one(&self, model: &ModelConfig, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(model, &[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| EmbedError::Response {
            message: "provider returned no embedding for a single input".to_string(),
        })
    }
}

/// A client that re-scores candidate documents against a query.
#[async_trait]
pub trait RerankClient: Send + Sync {
    /// Score `documents` for relevance to `query`, returning up to `top_n`
    /// hits ordered by descending relevance.
    async fn rerank(
        &self,
        model: &ModelConfig,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>>;
}

// ── wire types for OpenAI-compatible endpoints ─────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// HTTP client for OpenAI-compatible `/embeddings` and `/rerank` endpoints.
///
/// Holds a single `reqwest::Client` (connection pool); everything
/// model-specific arrives via [`ModelConfig`] per call.
#[derive(Debug, Clone, Default)]
pub struct HttpProviderClient {
    http: reqwest::Client,
}

impl HttpProviderClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured `reqwest::Client` (timeouts, proxies).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        model: &ModelConfig,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        model.validate()?;

        let mut request = self
            .http
            .post(model.api.endpoint(path))
            .bearer_auth(&model.api.api_key)
            .json(body);
        if let Some(org) = &model.api.organization {
            request = request.header("OpenAI-Organization", org);
        }

        let response = request.send().await.map_err(|e| {
            error!(provider = %model.provider, model = %model.model_id, error = %e, "request failed");
            EmbedError::request(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            error!(provider = %model.provider, model = %model.model_id, %status, "API error");
            return Err(EmbedError::Api {
                status: status.as_u16(),
                message: detail,
            });
        }

        response.json::<Resp>().await.map_err(|e| EmbedError::Response {
            message: format!("failed to parse response: {e}"),
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpProviderClient {
    async fn embed_batch(&self, model: &ModelConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = %model.provider,
            model = %model.model_id,
            batch_size = texts.len(),
            "embedding batch"
        );

        let body = EmbeddingRequest {
            model: &model.model_id,
            input: texts,
        };
        let response: EmbeddingResponse = self.post_json(model, "embeddings", &body).await?;

        if response.data.len() != texts.len() {
            return Err(EmbedError::Response {
                message: format!(
                    "expected {} embeddings, provider returned {}",
                    texts.len(),
                    response.data.len()
                ),
            });
        }

        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl RerankClient for HttpProviderClient {
    async fn rerank(
        &self,
        model: &ModelConfig,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = %model.provider,
            model = %model.model_id,
            candidates = documents.len(),
            top_n,
            "rerank call"
        );

        let body = RerankRequest {
            model: &model.model_id,
            query,
            documents,
            top_n,
        };
        let response: RerankResponse = self.post_json(model, "rerank", &body).await?;

        let mut hits = Vec::with_capacity(response.results.len());
        for result in response.results {
            if result.index >= documents.len() {
                return Err(EmbedError::Response {
                    message: format!(
                        "rerank index {} out of range for {} documents",
                        result.index,
                        documents.len()
                    ),
                });
            }
            hits.push(RerankHit {
                index: result.index,
                relevance_score: result.relevance_score,
            });
        }
        Ok(hits)
    }
}
