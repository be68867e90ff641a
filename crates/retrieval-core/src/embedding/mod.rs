//! Dense and sparse embedding RPC clients.
//!
//! Both embedding services are external processes the engine calls over
//! HTTP, not models loaded in-process -- this lets operators swap embedding
//! models without a rebuild. Concurrency is capped with a semaphore per
//! service, retries follow [`crate::retry::with_retries`], and an in-flight
//! call can be aborted by a job's [`tokio_util::sync::CancellationToken`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::error::{RetrievalError, RetrievalResult};
use crate::retry::with_retries;

/// A sparse vector as `(term_id, weight)` pairs, analogous to a BM25-style
/// posting list entry.
pub type SparseVector = Vec<(u32, f32)>;

#[derive(Debug, Serialize)]
struct DenseEmbedRequest<'a> {
    inputs: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct DenseEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct SparseEmbedRequest<'a> {
    inputs: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
struct SparseEmbedResponse {
    embeddings: Vec<Vec<SparseTerm>>,
}

#[derive(Debug, Deserialize)]
struct SparseTerm {
    term_id: u32,
    weight: f32,
}

/// RPC client for the dense embedding service.
#[async_trait::async_trait]
pub trait DenseEmbeddingClient: Send + Sync {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>>;
}

/// RPC client for the sparse embedding service.
#[async_trait::async_trait]
pub trait SparseEmbeddingClient: Send + Sync {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<SparseVector>>;
}

fn classify_status(service: &str, status: reqwest::StatusCode, body: String) -> RetrievalError {
    if status.as_u16() == 429 || status.is_server_error() {
        RetrievalError::TransientRpc { service: service.to_string(), message: format!("{status}: {body}") }
    } else {
        RetrievalError::PermanentRpc { service: service.to_string(), message: format!("{status}: {body}") }
    }
}

/// Dense embedding client backed by an HTTP service.
pub struct HttpDenseEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDenseEmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait::async_trait]
impl DenseEmbeddingClient for HttpDenseEmbeddingClient {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>> {
        let url = format!("{}/embed/dense", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&DenseEmbedRequest { inputs: texts })
            .send()
            .await
            .map_err(|e| RetrievalError::TransientRpc { service: "dense-embedder".into(), message: e.to_string() })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("dense-embedder", status, body));
        }

        let parsed: DenseEmbedResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::PermanentRpc { service: "dense-embedder".into(), message: e.to_string() })?;
        Ok(parsed.embeddings)
    }
}

/// Sparse embedding client backed by an HTTP service.
pub struct HttpSparseEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSparseEmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[async_trait::async_trait]
impl SparseEmbeddingClient for HttpSparseEmbeddingClient {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<SparseVector>> {
        let url = format!("{}/embed/sparse", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SparseEmbedRequest { inputs: texts })
            .send()
            .await
            .map_err(|e| RetrievalError::TransientRpc { service: "sparse-embedder".into(), message: e.to_string() })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("sparse-embedder", status, body));
        }

        let parsed: SparseEmbedResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::PermanentRpc { service: "sparse-embedder".into(), message: e.to_string() })?;
        Ok(parsed
            .embeddings
            .into_iter()
            .map(|terms| terms.into_iter().map(|t| (t.term_id, t.weight)).collect())
            .collect())
    }
}

/// Bundles the dense (text- and code-tuned) and (optional) sparse embedding
/// clients with per-service concurrency and a shared retry policy.
///
/// Dense embedding is split across two models because code and prose
/// embed poorly under the same encoder: chunks derived from AST structure
/// go to the code model, everything else (prose, query text) goes to the
/// text model. Sparse gets its own semaphore since the sparse service is
/// typically far more memory-constrained than dense and can't absorb the
/// same in-flight concurrency.
pub struct EmbeddingClients {
    dense_text: Arc<dyn DenseEmbeddingClient>,
    dense_code: Arc<dyn DenseEmbeddingClient>,
    sparse: Option<Arc<dyn SparseEmbeddingClient>>,
    dense_semaphore: Arc<Semaphore>,
    sparse_semaphore: Arc<Semaphore>,
    batch_size: usize,
    max_attempts: u32,
}

impl EmbeddingClients {
    /// Build clients from configuration, wiring the HTTP implementations.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let dense_text: Arc<dyn DenseEmbeddingClient> = Arc::new(HttpDenseEmbeddingClient::new(&config.dense_url));
        let dense_code: Arc<dyn DenseEmbeddingClient> =
            Arc::new(HttpDenseEmbeddingClient::new(&config.dense_code_url));
        let sparse: Option<Arc<dyn SparseEmbeddingClient>> = if config.hybrid_enabled {
            Some(Arc::new(HttpSparseEmbeddingClient::new(&config.sparse_url)))
        } else {
            None
        };
        Self {
            dense_text,
            dense_code,
            sparse,
            dense_semaphore: Arc::new(Semaphore::new(config.concurrency)),
            sparse_semaphore: Arc::new(Semaphore::new(config.sparse_concurrency)),
            batch_size: config.batch_size,
            max_attempts: 3,
        }
    }

    /// Construct directly from already-built clients, for testing with
    /// fakes. Pass the same client for `dense_text` and `dense_code` when
    /// the distinction doesn't matter to the caller.
    pub fn new(
        dense_text: Arc<dyn DenseEmbeddingClient>,
        dense_code: Arc<dyn DenseEmbeddingClient>,
        sparse: Option<Arc<dyn SparseEmbeddingClient>>,
        dense_concurrency: usize,
        sparse_concurrency: usize,
        batch_size: usize,
    ) -> Self {
        Self {
            dense_text,
            dense_code,
            sparse,
            dense_semaphore: Arc::new(Semaphore::new(dense_concurrency)),
            sparse_semaphore: Arc::new(Semaphore::new(sparse_concurrency)),
            batch_size,
            max_attempts: 3,
        }
    }

    pub fn hybrid_enabled(&self) -> bool {
        self.sparse.is_some()
    }

    /// Embed all `texts` densely, batching and retrying transient failures.
    /// `is_code` selects the code-tuned or text-tuned model. Cancellable
    /// via `cancel`.
    pub async fn embed_dense(
        &self,
        texts: &[&str],
        is_code: bool,
        cancel: &CancellationToken,
    ) -> RetrievalResult<Vec<Vec<f32>>> {
        let client = if is_code { Arc::clone(&self.dense_code) } else { Arc::clone(&self.dense_text) };
        self.embed_batched(texts, &self.dense_semaphore, cancel, move |batch| {
            let client = Arc::clone(&client);
            let batch = batch.to_vec();
            async move { client.embed_batch(&batch).await }
        })
        .await
    }

    /// Embed all `texts` sparsely. Returns an empty vector if hybrid search
    /// is disabled rather than erroring, since sparse is an optional arm.
    pub async fn embed_sparse(&self, texts: &[&str], cancel: &CancellationToken) -> RetrievalResult<Vec<SparseVector>> {
        let Some(sparse) = self.sparse.clone() else {
            return Ok(Vec::new());
        };
        self.embed_batched(texts, &self.sparse_semaphore, cancel, |batch| {
            let sparse = Arc::clone(&sparse);
            let batch = batch.to_vec();
            async move { sparse.embed_batch(&batch).await }
        })
        .await
    }

    async fn embed_batched<'a, F, Fut, T>(
        &self,
        texts: &[&'a str],
        semaphore: &Semaphore,
        cancel: &CancellationToken,
        call: F,
    ) -> RetrievalResult<Vec<T>>
    where
        F: Fn(&[&'a str]) -> Fut,
        Fut: std::future::Future<Output = RetrievalResult<Vec<T>>>,
    {
        let mut results = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                return Err(RetrievalError::Cancelled("embedding cancelled".into()));
            }
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| RetrievalError::Internal(format!("semaphore closed: {e}")))?;

            let batch_result = with_retries(self.max_attempts, Duration::from_millis(100), || call(batch)).await?;
            results.extend(batch_result);
        }
        Ok(results)
    }
}

/// In-memory dense client used in tests and for offline ingestion dry-runs.
pub struct FakeDenseEmbeddingClient {
    pub dimensions: usize,
}

#[async_trait::async_trait]
impl DenseEmbeddingClient for FakeDenseEmbeddingClient {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| deterministic_vector(t, self.dimensions))
            .collect())
    }
}

/// In-memory sparse client used in tests, assigns a term id per unique word.
pub struct FakeSparseEmbeddingClient;

#[async_trait::async_trait]
impl SparseEmbeddingClient for FakeSparseEmbeddingClient {
    async fn embed_batch(&self, texts: &[&str]) -> RetrievalResult<Vec<SparseVector>> {
        Ok(texts.iter().map(|t| hashed_sparse_vector(t)).collect())
    }
}

fn deterministic_vector(text: &str, dimensions: usize) -> Vec<f32> {
    use std::hash::{Hash, Hasher};
    let mut vector = vec![0.0f32; dimensions];
    for (i, word) in text.split_whitespace().enumerate() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        word.hash(&mut hasher);
        (i as u64).hash(&mut hasher);
        let idx = (hasher.finish() as usize) % dimensions.max(1);
        vector[idx] += 1.0;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn hashed_sparse_vector(text: &str) -> SparseVector {
    use std::collections::HashMap;
    use std::hash::{Hash, Hasher};
    let mut terms: HashMap<u32, f32> = HashMap::new();
    for word in text.split_whitespace() {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        word.to_lowercase().hash(&mut hasher);
        let term_id = (hasher.finish() % 1_000_003) as u32;
        *terms.entry(term_id).or_insert(0.0) += 1.0;
    }
    terms.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_embed_dense_with_fakes() {
        let dense = Arc::new(FakeDenseEmbeddingClient { dimensions: 16 });
        let clients = EmbeddingClients::new(
            dense.clone(),
            dense,
            Some(Arc::new(FakeSparseEmbeddingClient)),
            4,
            1,
            8,
        );
        let cancel = CancellationToken::new();
        let out = clients.embed_dense(&["hello world", "goodbye"], false, &cancel).await.expect("embed");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 16);
    }

    #[tokio::test]
    async fn test_embed_sparse_disabled_returns_empty() {
        let dense = Arc::new(FakeDenseEmbeddingClient { dimensions: 8 });
        let clients = EmbeddingClients::new(dense.clone(), dense, None, 4, 1, 8);
        let cancel = CancellationToken::new();
        let out = clients.embed_sparse(&["hello"], &cancel).await.expect("embed");
        assert!(out.is_empty());
        assert!(!clients.hybrid_enabled());
    }

    #[tokio::test]
    async fn test_embed_respects_cancellation() {
        let dense = Arc::new(FakeDenseEmbeddingClient { dimensions: 8 });
        let clients = EmbeddingClients::new(dense.clone(), dense, None, 4, 1, 1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = clients.embed_dense(&["a", "b"], false, &cancel).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_embed_dense_routes_code_and_text_independently() {
        let dense_text = Arc::new(FakeDenseEmbeddingClient { dimensions: 8 });
        let dense_code = Arc::new(FakeDenseEmbeddingClient { dimensions: 12 });
        let clients = EmbeddingClients::new(dense_text, dense_code, None, 4, 1, 8);
        let cancel = CancellationToken::new();
        let text_out = clients.embed_dense(&["hello"], false, &cancel).await.expect("embed text");
        let code_out = clients.embed_dense(&["fn main() {}"], true, &cancel).await.expect("embed code");
        assert_eq!(text_out[0].len(), 8);
        assert_eq!(code_out[0].len(), 12);
    }

    #[test]
    fn test_deterministic_vector_is_normalized() {
        let v = deterministic_vector("fn parse_chunk", 32);
        let norm: f32 = v.iter().map(|x| x * x).sum();
        assert!((norm - 1.0).abs() < 0.01 || norm == 0.0);
    }
}
