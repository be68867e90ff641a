//! Query-time retrieval pipeline: resolve scope, embed the query, fan out
//! to the dense and sparse arms, fuse with RRF, optionally rerank, then
//! enrich with full chunk content from the catalog.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::config::SearchConfig;
use crate::embedding::EmbeddingClients;
use crate::error::{RetrievalError, RetrievalResult};
use crate::reranker::{merge_scores, RerankerClient};
use crate::scope::{ScopeManager, ScopeRequest};
use crate::types::{ArmScores, DatasetVisibility, RetrievalResponse, SearchResult};
use crate::vector::{rrf_fuse, VectorStore};

/// A fully specified retrieval query.
pub struct RetrievalQuery {
    pub scope: ScopeRequest,
    pub text: String,
    pub limit: usize,
}

/// Orchestrates a single retrieval query across the embedding, vector,
/// reranker, and catalog subsystems.
pub struct RetrievalPipeline {
    catalog: Arc<CatalogStore>,
    vector_store: Arc<dyn VectorStore>,
    embedding: Arc<EmbeddingClients>,
    reranker: Option<Arc<dyn RerankerClient>>,
    config: SearchConfig,
}

impl RetrievalPipeline {
    pub fn new(
        catalog: Arc<CatalogStore>,
        vector_store: Arc<dyn VectorStore>,
        embedding: Arc<EmbeddingClients>,
        reranker: Option<Arc<dyn RerankerClient>>,
        config: SearchConfig,
    ) -> Self {
        Self { catalog, vector_store, embedding, reranker, config }
    }

    pub async fn run(&self, query: &RetrievalQuery) -> RetrievalResult<RetrievalResponse> {
        let cancel = CancellationToken::new();
        let project = self
            .catalog
            .get_project_by_name(&ScopeManager::normalize(&query.scope.project))
            .await?
            .ok_or_else(|| RetrievalError::NotFound { entity: format!("project {}", query.scope.project) })?;

        let known_datasets = self.catalog.list_datasets(project.id).await?;
        let datasets = ScopeManager::resolve(&query.scope, &known_datasets)?;

        // include_global also pulls in datasets shared from other projects
        // via an active (non-expired) ProjectShare, beyond the in-project
        // `Shared`-visibility datasets ScopeManager::resolve already added.
        let mut cross_project_collections: Vec<String> = Vec::new();
        if query.scope.include_global {
            let shares = self.catalog.list_active_shares_for_target(project.id).await?;
            for share in shares {
                let Some(source_project) = self.catalog.get_project_by_id(share.source_project_id).await? else { continue };
                let source_datasets = self.catalog.list_datasets(source_project.id).await?;
                for ds in &source_datasets {
                    if ds.visibility != DatasetVisibility::Shared {
                        continue;
                    }
                    if let Some(filter_id) = share.dataset_id {
                        if ds.id != filter_id {
                            continue;
                        }
                    }
                    cross_project_collections.push(ScopeManager::collection_name(&source_project.name, &ds.name));
                }
            }
        }

        if datasets.is_empty() && cross_project_collections.is_empty() {
            return Ok(RetrievalResponse { results: Vec::new(), candidates_considered: 0, reranked: false, reranker_skipped: false });
        }

        let limit = query.limit.clamp(1, self.config.max_limit);
        let fetch_k = if self.reranker.is_some() { self.config.reranker.initial_k.max(limit) } else { limit };
        // Over-fetch each arm before fusing so RRF has more than `fetch_k`
        // candidates to draw from; truncate back to `fetch_k` only after
        // fusion combines both arms.
        let arm_k = fetch_k.saturating_mul(self.config.over_fetch.max(1));

        // Query text is always natural language, never a code chunk, so it
        // always routes to the text-tuned dense model.
        let dense_query = self.embedding.embed_dense(&[&query.text], false, &cancel).await?;
        let dense_query = dense_query.into_iter().next().ok_or_else(|| RetrievalError::Internal("empty dense embedding response".into()))?;
        let sparse_query = if self.embedding.hybrid_enabled() {
            self.embedding.embed_sparse(&[&query.text], &cancel).await?.into_iter().next().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut collection_names: Vec<String> = datasets.iter().map(|d| ScopeManager::collection_name(&project.name, &d.name)).collect();
        collection_names.extend(cross_project_collections);
        collection_names.sort();
        collection_names.dedup();

        let mut fused_by_collection: Vec<(Uuid, ArmScores)> = Vec::new();
        for collection_name in &collection_names {
            if self.catalog.get_collection_by_name(collection_name).await?.is_none() {
                continue;
            }

            let dense_hits = self.vector_store.search_dense(collection_name, &dense_query, arm_k).await?;
            let sparse_hits = if sparse_query.is_empty() {
                Vec::new()
            } else {
                self.vector_store.search_sparse(collection_name, &sparse_query, arm_k).await?
            };

            let fused = rrf_fuse(&dense_hits, &sparse_hits, f64::from(self.config.rrf_k), self.config.hybrid_dense_weight, self.config.hybrid_sparse_weight);
            fused_by_collection.extend(fused);
        }

        fused_by_collection.sort_by(|a, b| {
            b.1.rrf_score
                .total_cmp(&a.1.rrf_score)
                .then_with(|| b.1.dense_score.unwrap_or(f64::MIN).total_cmp(&a.1.dense_score.unwrap_or(f64::MIN)))
                .then_with(|| a.0.cmp(&b.0))
        });
        fused_by_collection.truncate(fetch_k);
        let candidates_considered = fused_by_collection.len();

        let chunk_ids: Vec<Uuid> = fused_by_collection.iter().map(|(id, _)| *id).collect();
        let chunks = self.catalog.get_chunks_by_ids(&chunk_ids).await?;
        let chunk_by_id: std::collections::HashMap<Uuid, _> = chunks.into_iter().map(|c| (c.id, c)).collect();

        let mut results: Vec<SearchResult> = Vec::new();
        for (chunk_id, arm_scores) in fused_by_collection {
            if let Some(chunk) = chunk_by_id.get(&chunk_id) {
                results.push(SearchResult { chunk: chunk.clone(), score: arm_scores.rrf_score, arm_scores });
            }
        }

        let (reranked, reranker_skipped) = self.apply_reranker(&query.text, &mut results).await;
        results.truncate(limit);

        Ok(RetrievalResponse { results, candidates_considered, reranked, reranker_skipped })
    }

    /// Returns `(reranked, reranker_skipped)`. A reranker RPC failure
    /// degrades gracefully: `results` keep their pre-rerank RRF ordering
    /// rather than failing the whole query.
    async fn apply_reranker(&self, query_text: &str, results: &mut Vec<SearchResult>) -> (bool, bool) {
        let Some(reranker) = &self.reranker else { return (false, false) };
        if !self.config.reranker.enabled || results.is_empty() {
            return (false, false);
        }

        let initial_k = self.config.reranker.initial_k.min(results.len());
        let documents: Vec<&str> = results[..initial_k].iter().map(|r| r.chunk.content.as_str()).collect();
        let scores = match reranker.rerank(query_text, &documents).await {
            Ok(scores) => scores,
            Err(e) => {
                tracing::warn!(error = %e, "reranker call failed, keeping pre-rerank RRF ordering");
                return (false, true);
            }
        };

        let order: Vec<usize> = (0..results.len()).collect();
        let merged = merge_scores(&order, &scores, self.config.reranker.unranked_demotion);
        for (idx, score) in merged {
            if let Some(result) = results.get_mut(idx) {
                result.arm_scores.reranker_score = Some(f64::from(score));
                result.arm_scores.reranker_skipped = idx >= initial_k;
                result.score = f64::from(score);
            }
        }
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(self.config.reranker.final_k.max(1));
        (true, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::{FakeDenseEmbeddingClient, FakeSparseEmbeddingClient};
    use crate::types::{DatasetSource, DatasetVisibility, Language};
    use crate::vector::FileVectorStore;

    struct FailingReranker;

    #[async_trait::async_trait]
    impl RerankerClient for FailingReranker {
        async fn rerank(&self, _query: &str, _documents: &[&str]) -> RetrievalResult<Vec<f32>> {
            Err(RetrievalError::TransientRpc { service: "reranker".into(), message: "unreachable".into() })
        }
    }

    async fn build_pipeline() -> (tempfile::TempDir, RetrievalPipeline, Uuid, String) {
        build_pipeline_with_reranker(None).await
    }

    async fn build_pipeline_with_reranker(
        reranker: Option<Arc<dyn RerankerClient>>,
    ) -> (tempfile::TempDir, RetrievalPipeline, Uuid, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = Arc::new(CatalogStore::open(&dir.path().join("catalog.sqlite3")).expect("catalog"));
        let vector_store: Arc<dyn VectorStore> = Arc::new(FileVectorStore::open(&dir.path().join("vectors")).expect("vector"));
        let dense = Arc::new(FakeDenseEmbeddingClient { dimensions: 8 });
        let embedding = Arc::new(EmbeddingClients::new(dense.clone(), dense, Some(Arc::new(FakeSparseEmbeddingClient)), 2, 1, 8));

        let project = catalog.create_project("acme").await.expect("project");
        let dataset = catalog.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");
        let collection_name = ScopeManager::collection_name(&project.name, &dataset.name);
        let collection = catalog.create_collection(dataset.id, &collection_name, 8).await.expect("collection");
        vector_store.ensure_collection(&collection_name, 8).await.expect("ensure");

        let document = catalog.upsert_document(collection.id, "src/lib.rs", "hash", 1).await.expect("doc");
        let chunk = crate::types::Chunk {
            id: Uuid::new_v4(),
            document_id: document.id,
            collection_id: collection.id,
            ordinal: 0,
            start_line: Some(1),
            end_line: Some(3),
            language: Language::Rust,
            file_or_url: "src/lib.rs".into(),
            chunk_title: "parse".into(),
            symbol: None,
            web: None,
            content: "fn parse_chunk() {}".into(),
            content_hash: "abc".into(),
            token_count: 4,
            dense_vector_id: None,
            sparse_vector_id: None,
        };
        catalog.replace_chunks(document.id, &[chunk.clone()]).await.expect("chunks");
        vector_store.upsert_dense(&collection_name, vec![(chunk.id, vec![1.0; 8])]).await.expect("dense");

        let mut config = Config::defaults(dir.path()).search;
        if reranker.is_some() {
            config.reranker.enabled = true;
        }
        let pipeline = RetrievalPipeline::new(catalog, vector_store, embedding, reranker, config);
        (dir, pipeline, chunk.id, project.name)
    }

    #[tokio::test]
    async fn test_retrieval_returns_matching_chunk() {
        let (_dir, pipeline, chunk_id, project_name) = build_pipeline().await;
        let query = RetrievalQuery {
            scope: ScopeRequest { project: project_name, datasets: vec![], include_global: false },
            text: "parse_chunk".into(),
            limit: 5,
        };
        let response = pipeline.run(&query).await.expect("run");
        assert!(!response.results.is_empty());
        assert_eq!(response.results[0].chunk.id, chunk_id);
        assert!(!response.reranked);
    }

    #[tokio::test]
    async fn test_retrieval_degrades_gracefully_when_reranker_fails() {
        let (_dir, baseline, _chunk_id, project_name) = build_pipeline().await;
        let query = RetrievalQuery {
            scope: ScopeRequest { project: project_name.clone(), datasets: vec![], include_global: false },
            text: "parse_chunk".into(),
            limit: 5,
        };
        let baseline_response = baseline.run(&query).await.expect("baseline run");
        let baseline_order: Vec<Uuid> = baseline_response.results.iter().map(|r| r.chunk.id).collect();

        let (_dir2, pipeline, _chunk_id2, _project_name2) =
            build_pipeline_with_reranker(Some(Arc::new(FailingReranker))).await;
        let response = pipeline.run(&query).await.expect("run with failing reranker");

        assert!(!response.reranked);
        assert!(response.reranker_skipped);
        let order: Vec<Uuid> = response.results.iter().map(|r| r.chunk.id).collect();
        assert_eq!(order, baseline_order);
    }

    #[tokio::test]
    async fn test_retrieval_unknown_project_errors() {
        let (_dir, pipeline, _chunk_id, _project_name) = build_pipeline().await;
        let query = RetrievalQuery {
            scope: ScopeRequest { project: "does-not-exist".into(), datasets: vec![], include_global: false },
            text: "parse_chunk".into(),
            limit: 5,
        };
        let result = pipeline.run(&query).await;
        assert!(result.is_err());
    }
}
