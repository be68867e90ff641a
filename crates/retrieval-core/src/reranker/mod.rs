//! Cross-encoder reranker RPC client.
//!
//! The reranker service only accepts one request at a time (its batch
//! scheduler amortizes GPU memory across a single caller), so calls are
//! serialized through a `tokio::sync::Mutex<()>` rather than a semaphore.
//! A payload that comes back `413 Payload Too Large` is retried with the
//! candidate list halved rather than treated as a permanent failure.

use tokio::sync::Mutex;

use crate::config::RerankerConfig;
use crate::error::{RetrievalError, RetrievalResult};

#[derive(Debug, serde::Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [&'a str],
}

#[derive(Debug, serde::Deserialize)]
struct RerankResponse {
    scores: Vec<f32>,
}

/// Cross-encoder reranker client.
#[async_trait::async_trait]
pub trait RerankerClient: Send + Sync {
    /// Score `documents` against `query`. Returns one score per document, in
    /// the same order.
    async fn rerank(&self, query: &str, documents: &[&str]) -> RetrievalResult<Vec<f32>>;
}

/// RPC-backed reranker, serialized to one in-flight request.
pub struct HttpRerankerClient {
    http: reqwest::Client,
    base_url: String,
    text_max_chars: usize,
    in_flight: Mutex<()>,
}

impl HttpRerankerClient {
    pub fn from_config(config: &RerankerConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.service_url.clone(),
            text_max_chars: config.text_max_chars,
            in_flight: Mutex::new(()),
        }
    }

    fn truncate<'a>(&self, text: &'a str) -> &'a str {
        if text.len() <= self.text_max_chars {
            text
        } else {
            let mut end = self.text_max_chars;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            &text[..end]
        }
    }

    async fn call(&self, query: &str, documents: &[&str]) -> RetrievalResult<Vec<f32>> {
        let truncated: Vec<&str> = documents.iter().map(|d| self.truncate(d)).collect();
        let url = format!("{}/rerank", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&RerankRequest { query, documents: &truncated })
            .send()
            .await
            .map_err(|e| RetrievalError::TransientRpc { service: "reranker".into(), message: e.to_string() })?;

        if response.status().as_u16() == 413 {
            return Err(RetrievalError::TransientRpc {
                service: "reranker".into(),
                message: "payload too large".into(),
            });
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let kind = if status.is_server_error() || status.as_u16() == 429 {
                RetrievalError::TransientRpc { service: "reranker".into(), message: format!("{status}: {body}") }
            } else {
                RetrievalError::PermanentRpc { service: "reranker".into(), message: format!("{status}: {body}") }
            };
            return Err(kind);
        }

        let parsed: RerankResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::PermanentRpc { service: "reranker".into(), message: e.to_string() })?;
        Ok(parsed.scores)
    }
}

#[async_trait::async_trait]
impl RerankerClient for HttpRerankerClient {
    async fn rerank(&self, query: &str, documents: &[&str]) -> RetrievalResult<Vec<f32>> {
        let _guard = self.in_flight.lock().await;

        let mut candidates: Vec<&str> = documents.to_vec();
        loop {
            match self.call(query, &candidates).await {
                Ok(scores) if candidates.len() == documents.len() => return Ok(scores),
                Ok(scores) => {
                    // Payload had been halved by a previous iteration; pad
                    // the dropped tail so the response shape still matches
                    // what the caller asked for.
                    let mut padded = scores;
                    padded.resize(documents.len(), f32::MIN);
                    return Ok(padded);
                }
                Err(e) if e.transient() && candidates.len() > 1 => {
                    tracing::warn!(size = candidates.len(), "reranker payload rejected, halving");
                    let half = candidates.len() / 2;
                    candidates.truncate(half.max(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Applies `unranked_demotion` to RRF-ranked candidates beyond what the
/// reranker actually scored, so the final ordering still reflects fused
/// retrieval rank for anything the cross-encoder never saw.
pub fn merge_scores(rrf_order: &[usize], reranked: &[f32], unranked_demotion: f64) -> Vec<(usize, f32)> {
    rrf_order
        .iter()
        .enumerate()
        .map(|(rank, &idx)| {
            let score = reranked.get(rank).copied().unwrap_or_else(|| {
                let base = 1.0 / (rank as f32 + 1.0);
                base * unranked_demotion as f32
            });
            (idx, score)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeReranker {
        scores: Vec<f32>,
    }

    #[async_trait::async_trait]
    impl RerankerClient for FakeReranker {
        async fn rerank(&self, _query: &str, documents: &[&str]) -> RetrievalResult<Vec<f32>> {
            Ok(self.scores.iter().take(documents.len()).copied().collect())
        }
    }

    #[tokio::test]
    async fn test_fake_reranker_returns_scores() {
        let reranker = FakeReranker { scores: vec![0.9, 0.5, 0.1] };
        let scores = reranker.rerank("query", &["a", "b", "c"]).await.expect("rerank");
        assert_eq!(scores, vec![0.9, 0.5, 0.1]);
    }

    #[test]
    fn test_merge_scores_demotes_unranked() {
        let order = vec![0, 1, 2];
        let reranked = vec![0.9, 0.8];
        let merged = merge_scores(&order, &reranked, 0.5);
        assert_eq!(merged[0], (0, 0.9));
        assert_eq!(merged[1], (1, 0.8));
        assert!(merged[2].1 < 0.9);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let config = RerankerConfig {
            enabled: true,
            service_url: "http://localhost".into(),
            initial_k: 10,
            final_k: 5,
            text_max_chars: 3,
            unranked_demotion: 0.5,
        };
        let client = HttpRerankerClient::from_config(&config);
        let truncated = client.truncate("héllo");
        assert!(truncated.len() <= 4);
    }
}
