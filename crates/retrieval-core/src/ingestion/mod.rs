//! Ingestion pipeline: walks a code dataset's source tree, chunks changed
//! documents, embeds them, and upserts the result into the catalog and
//! vector store, reporting progress through each [`JobPhase`].
//!
//! The chunk and embed/upsert stages run concurrently, connected by a
//! bounded channel -- chunking for document N+1 proceeds while document N's
//! chunks are still being embedded, without unbounded memory growth if
//! embedding falls behind.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::{Glob, GlobSetBuilder};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::CatalogStore;
use crate::chunker::{chunk_code, chunk_document, chunk_fallback_text};
use crate::config::Config;
use crate::embedding::EmbeddingClients;
use crate::error::{RetrievalError, RetrievalResult};
use crate::parser::parse_file;
use crate::scope::ScopeManager;
use crate::types::{Chunk, Dataset, JobPhase, Language, Project};
use crate::vector::VectorStore;

fn hash_content(content: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content.as_bytes()))
}

struct PendingDocument {
    relative_path: PathBuf,
    language: Language,
    content: String,
}

/// Orchestrates one ingestion run for a code dataset rooted at a local
/// directory (already cloned, for GitHub-sourced datasets).
pub struct IngestionPipeline {
    catalog: Arc<CatalogStore>,
    vector_store: Arc<dyn VectorStore>,
    embedding: Arc<EmbeddingClients>,
    config: Config,
}

impl IngestionPipeline {
    pub fn new(catalog: Arc<CatalogStore>, vector_store: Arc<dyn VectorStore>, embedding: Arc<EmbeddingClients>, config: Config) -> Self {
        Self { catalog, vector_store, embedding, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a full ingestion pass over `root` for `dataset`, reporting
    /// progress against `job_id`.
    pub async fn ingest_code_dataset(
        &self,
        job_id: Uuid,
        project: &Project,
        dataset: &Dataset,
        root: &Path,
        cancel: &CancellationToken,
    ) -> RetrievalResult<()> {
        let collection_name = ScopeManager::collection_name(&project.name, &dataset.name);
        let collection = match self.catalog.get_collection_by_name(&collection_name).await? {
            Some(c) => c,
            None => self.catalog.create_collection(dataset.id, &collection_name, self.config.embedding.dimensions as u32).await?,
        };
        self.vector_store.ensure_collection(&collection_name, collection.dense_dimensions).await?;

        self.catalog.update_job_progress(job_id, JobPhase::Enumerate, 0).await?;
        let files = self.enumerate_files(root)?;
        let seen_paths: HashSet<String> = files.iter().map(|f| f.to_string_lossy().into_owned()).collect();

        let (tx, mut rx) = mpsc::channel::<Vec<Chunk>>(self.config.indexing.max_concurrent_batches);
        let chunk_task = self.spawn_chunk_stage(job_id, root, files, collection.id, tx, cancel.clone());

        self.catalog.update_job_progress(job_id, JobPhase::Embed, 0).await?;
        let mut total_upserted = 0u32;
        while let Some(chunks) = rx.recv().await {
            if cancel.is_cancelled() {
                return Err(RetrievalError::Cancelled("ingestion cancelled".into()));
            }
            total_upserted += chunks.len() as u32;
            self.embed_and_upsert(&collection_name, chunks).await?;
            self.catalog.update_job_progress(job_id, JobPhase::Upsert, 80).await?;
        }
        chunk_task.await.map_err(|e| RetrievalError::Internal(format!("chunk stage join error: {e}")))??;

        self.catalog.update_job_progress(job_id, JobPhase::Finalize, 95).await?;
        self.reconcile_deletions(collection.id, &collection_name, &seen_paths).await?;
        tracing::info!(job_id = %job_id, chunks = total_upserted, "ingestion run completed");
        Ok(())
    }

    fn enumerate_files(&self, root: &Path) -> RetrievalResult<Vec<PathBuf>> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.config.indexing.exclude_patterns {
            if let Ok(glob) = Glob::new(&format!("**/{pattern}")).or_else(|_| Glob::new(pattern)) {
                builder.add(glob);
            }
        }
        let excludes = builder.build().map_err(|e| RetrievalError::Config { details: format!("invalid exclude pattern set: {e}") })?;

        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let relative = path.strip_prefix(root).unwrap_or(&path);
                if excludes.is_match(relative) {
                    continue;
                }
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let metadata = entry.metadata()?;
                if metadata.len() > self.config.indexing.max_file_size {
                    continue;
                }
                files.push(relative.to_path_buf());
            }
        }
        Ok(files)
    }

    fn spawn_chunk_stage(
        &self,
        job_id: Uuid,
        root: &Path,
        files: Vec<PathBuf>,
        collection_id: Uuid,
        tx: mpsc::Sender<Vec<Chunk>>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<RetrievalResult<()>> {
        let catalog = Arc::clone(&self.catalog);
        let config = self.config.clone();
        let root = root.to_path_buf();
        let total = files.len().max(1);

        tokio::task::spawn(async move {
            let mut parse_failures = 0u32;
            for (i, relative_path) in files.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(RetrievalError::Cancelled("ingestion cancelled".into()));
                }
                let absolute = root.join(&relative_path);
                let content = match std::fs::read_to_string(&absolute) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::warn!(path = %relative_path.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };
                let ext = relative_path.extension().and_then(|e| e.to_str()).unwrap_or("");
                let language = Language::from_extension(ext);
                let pending = PendingDocument { relative_path: relative_path.clone(), language, content };

                let file_or_url = pending.relative_path.to_string_lossy().into_owned();
                let content_hash = hash_content(&pending.content);
                let document = catalog.upsert_document(collection_id, &file_or_url, &content_hash, 0).await?;

                let chunks = chunk_one_document(&pending, document.id, collection_id, &config, &mut parse_failures);
                catalog.replace_chunks(document.id, &chunks).await?;
                catalog.upsert_document(collection_id, &file_or_url, &content_hash, chunks.len() as u32).await?;

                if !chunks.is_empty() && tx.send(chunks).await.is_err() {
                    break;
                }
                catalog.update_job_progress(job_id, JobPhase::Chunk, ((i + 1) * 100 / total) as u8).await?;
            }
            if parse_failures > 0 {
                tracing::info!(job_id = %job_id, parse_failures, "some files fell back to the recursive text splitter");
            }
            Ok(())
        })
    }

    async fn embed_and_upsert(&self, collection_name: &str, mut chunks: Vec<Chunk>) -> RetrievalResult<()> {
        let cancel = CancellationToken::new();
        let texts: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let is_code = chunks.first().is_some_and(|c| c.language.is_code());
        let dense = self.embedding.embed_dense(&texts, is_code, &cancel).await?;
        let sparse = if self.embedding.hybrid_enabled() {
            self.embedding.embed_sparse(&texts, &cancel).await?
        } else {
            Vec::new()
        };

        let mut dense_points = Vec::with_capacity(chunks.len());
        let mut sparse_points = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.dense_vector_id = Some(chunk.id);
            dense_points.push((chunk.id, dense[i].clone()));
            if let Some(terms) = sparse.get(i) {
                chunk.sparse_vector_id = Some(chunk.id);
                sparse_points.push((chunk.id, terms.clone()));
            }
            self.catalog.set_chunk_vector_ids(chunk.id, chunk.dense_vector_id, chunk.sparse_vector_id).await?;
        }

        self.vector_store.upsert_dense(collection_name, dense_points).await?;
        if !sparse_points.is_empty() {
            self.vector_store.upsert_sparse(collection_name, sparse_points).await?;
        }
        Ok(())
    }

    async fn reconcile_deletions(&self, collection_id: Uuid, collection_name: &str, seen_paths: &HashSet<String>) -> RetrievalResult<()> {
        let documents = self.catalog.list_documents(collection_id).await?;
        for document in documents {
            if seen_paths.contains(&document.file_or_url) {
                continue;
            }
            let chunk_ids = self.catalog.delete_document(document.id).await?;
            if !chunk_ids.is_empty() {
                self.vector_store.delete_by_chunk_ids(collection_name, &chunk_ids).await?;
            }
        }
        Ok(())
    }
}

/// Chunk one document. A parse failure or an AST with no splittable nodes
/// is not fatal to the job: it's logged, counted in `parse_failures`, and
/// the document falls back to the recursive text splitter instead.
fn chunk_one_document(pending: &PendingDocument, document_id: Uuid, collection_id: Uuid, config: &Config, parse_failures: &mut u32) -> Vec<Chunk> {
    let file_or_url = pending.relative_path.to_string_lossy().into_owned();
    if !pending.language.is_code() {
        return chunk_document(&pending.content, document_id, collection_id, pending.language, &file_or_url, None, None, config);
    }

    match parse_file(&pending.relative_path, pending.content.as_bytes(), pending.language) {
        Ok(elements) if !elements.is_empty() => {
            chunk_code(&elements, document_id, collection_id, pending.language, &file_or_url, config)
        }
        Ok(_) => {
            tracing::debug!(path = %file_or_url, "no splittable AST nodes, using recursive text splitter");
            chunk_fallback_text(&pending.content, document_id, collection_id, pending.language, &file_or_url, config)
        }
        Err(e) => {
            *parse_failures += 1;
            tracing::warn!(path = %file_or_url, error = %e, "parse failed, using recursive text splitter");
            chunk_fallback_text(&pending.content, document_id, collection_id, pending.language, &file_or_url, config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{FakeDenseEmbeddingClient, FakeSparseEmbeddingClient};
    use crate::types::{DatasetSource, DatasetVisibility};
    use crate::vector::FileVectorStore;

    async fn build_pipeline() -> (tempfile::TempDir, IngestionPipeline, Project, Dataset) {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = Arc::new(CatalogStore::open(&dir.path().join("catalog.sqlite3")).expect("catalog"));
        let vector_store: Arc<dyn VectorStore> = Arc::new(FileVectorStore::open(&dir.path().join("vectors")).expect("vector"));
        let dense = Arc::new(FakeDenseEmbeddingClient { dimensions: 8 });
        let embedding = Arc::new(EmbeddingClients::new(dense.clone(), dense, Some(Arc::new(FakeSparseEmbeddingClient)), 2, 1, 8));
        let config = Config::defaults(dir.path());

        let project = catalog.create_project("acme").await.expect("project");
        let dataset = catalog.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");

        let pipeline = IngestionPipeline::new(catalog, vector_store, embedding, config);
        (dir, pipeline, project, dataset)
    }

    #[tokio::test]
    async fn test_ingest_code_dataset_chunks_and_embeds() {
        let (dir, pipeline, project, dataset) = build_pipeline().await;
        let src_dir = dir.path().join("src-repo");
        std::fs::create_dir_all(&src_dir).expect("mkdir");
        std::fs::write(src_dir.join("lib.rs"), "pub fn hello() {\n    println!(\"hi\");\n}\n").expect("write");

        let job = pipeline.catalog.enqueue_job(dataset.id, "ingest:docs").await.expect("enqueue").expect("job");
        let cancel = CancellationToken::new();
        pipeline.ingest_code_dataset(job.id, &project, &dataset, &src_dir, &cancel).await.expect("ingest");

        let collection_name = ScopeManager::collection_name(&project.name, &dataset.name);
        let stats = pipeline.vector_store.collection_stats(&collection_name).await.expect("stats");
        assert!(stats.dense_count > 0);
    }

    #[test]
    fn test_chunk_one_document_falls_back_when_no_splittable_nodes() {
        let config = Config::defaults(std::path::Path::new("./data"));
        let pending = PendingDocument {
            relative_path: PathBuf::from("empty.rs"),
            language: Language::Rust,
            content: "// just a comment, no items\n".to_string(),
        };
        let mut parse_failures = 0;
        let chunks = chunk_one_document(&pending, Uuid::new_v4(), Uuid::new_v4(), &config, &mut parse_failures);
        assert_eq!(parse_failures, 0);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.symbol.is_none()));
    }

    #[tokio::test]
    async fn test_enumerate_files_respects_excludes() {
        let (dir, pipeline, _project, _dataset) = build_pipeline().await;
        let root = dir.path().join("proj");
        std::fs::create_dir_all(root.join("target")).expect("mkdir");
        std::fs::write(root.join("target").join("ignored.rs"), "fn x() {}").expect("write");
        std::fs::write(root.join("main.rs"), "fn main() {}").expect("write");

        let files = pipeline.enumerate_files(&root).expect("enumerate");
        assert!(files.iter().any(|f| f.ends_with("main.rs")));
        assert!(!files.iter().any(|f| f.to_string_lossy().contains("target")));
    }
}
