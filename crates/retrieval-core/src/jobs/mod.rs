//! Ingestion job workers: claim loop against the durable queue in
//! [`crate::catalog::CatalogStore`], dispatched by dataset source kind.
//!
//! A [`JobSourceResolver`] tells a worker where a dataset's material
//! actually lives -- a local path already on disk, a GitHub repository to
//! shallow-clone, or a list of web pages to fetch -- since that's
//! deployment-specific and not part of the dataset's catalog row.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogStore;
use crate::chunker::chunk_document;
use crate::error::{RetrievalError, RetrievalResult};
use crate::ingestion::IngestionPipeline;
use crate::scope::ScopeManager;
use crate::types::{Dataset, DatasetSource, IngestionJob, JobStatus, Language, Project};

/// Where a dataset's source material lives, resolved per job rather than
/// stored on the dataset row.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Already-materialized directory, e.g. a CLI invocation ingesting the
    /// current working tree.
    LocalPath(PathBuf),
    /// Remote repository to shallow-clone before ingesting.
    GitHub { url: String, branch: Option<String> },
    /// Pages to fetch and chunk as prose.
    Web { urls: Vec<String> },
}

/// Resolves a dataset to the [`JobSource`] a worker should ingest from.
#[async_trait::async_trait]
pub trait JobSourceResolver: Send + Sync {
    async fn resolve(&self, dataset: &Dataset) -> RetrievalResult<JobSource>;
}

/// A worker that repeatedly claims and executes jobs from the queue.
pub struct Worker {
    id: String,
    catalog: Arc<CatalogStore>,
    ingestion: Arc<IngestionPipeline>,
    resolver: Arc<dyn JobSourceResolver>,
    http: reqwest::Client,
    poll_interval: Duration,
    visibility_timeout_secs: u64,
    max_attempts: u32,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        catalog: Arc<CatalogStore>,
        ingestion: Arc<IngestionPipeline>,
        resolver: Arc<dyn JobSourceResolver>,
        poll_interval: Duration,
        visibility_timeout_secs: u64,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            catalog,
            ingestion,
            resolver,
            http: reqwest::Client::new(),
            poll_interval,
            visibility_timeout_secs,
            max_attempts,
        }
    }

    /// Poll the queue until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.catalog.claim_next_job(&self.id, self.visibility_timeout_secs).await {
                Ok(Some(job)) => self.execute(job, &cancel).await,
                Ok(None) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    tracing::error!(worker = %self.id, error = %e, "failed to claim job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn execute(&self, job: IngestionJob, cancel: &CancellationToken) {
        let outcome = self.run_job(&job, cancel).await;
        match outcome {
            Ok(()) => {
                if let Err(e) = self.catalog.finish_job(job.id, JobStatus::Completed, None).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
            }
            Err(e) if e.is_cancelled() => {
                let _ = self.catalog.finish_job(job.id, JobStatus::Cancelled, Some(&e.to_string())).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, attempts = job.attempts, error = %e, "ingestion job failed");
                if job.attempts >= self.max_attempts {
                    let _ = self.catalog.finish_job(job.id, JobStatus::Failed, Some(&e.to_string())).await;
                }
                // Otherwise leave the job `running`; its claim expires and
                // `claim_next_job` picks it back up for another attempt.
            }
        }
    }

    async fn run_job(&self, job: &IngestionJob, cancel: &CancellationToken) -> RetrievalResult<()> {
        let dataset = self
            .catalog
            .get_dataset_by_id(job.dataset_id)
            .await?
            .ok_or_else(|| RetrievalError::NotFound { entity: format!("dataset {}", job.dataset_id) })?;
        let project = self
            .catalog
            .get_project_by_id(dataset.project_id)
            .await?
            .ok_or_else(|| RetrievalError::NotFound { entity: format!("project {}", dataset.project_id) })?;

        let source = self.resolver.resolve(&dataset).await?;
        match source {
            JobSource::LocalPath(root) => {
                self.ingestion.ingest_code_dataset(job.id, &project, &dataset, &root, cancel).await
            }
            JobSource::GitHub { url, branch } => {
                let scratch = tempfile::tempdir().map_err(RetrievalError::from)?;
                let sha = clone_shallow(&url, branch.as_deref(), scratch.path()).await?;
                self.catalog.set_job_sha(job.id, &sha).await?;
                self.ingestion.ingest_code_dataset(job.id, &project, &dataset, scratch.path(), cancel).await
            }
            JobSource::Web { urls } => self.ingest_web(job, &project, &dataset, &urls, cancel).await,
        }
    }

    async fn ingest_web(&self, job: &IngestionJob, project: &Project, dataset: &Dataset, urls: &[String], cancel: &CancellationToken) -> RetrievalResult<()> {
        let collection_name = ScopeManager::collection_name(&project.name, &dataset.name);
        let collection = match self.catalog.get_collection_by_name(&collection_name).await? {
            Some(c) => c,
            None => self.catalog.create_collection(dataset.id, &collection_name, self.ingestion_dense_dimensions()).await?,
        };

        for url in urls {
            if cancel.is_cancelled() {
                return Err(RetrievalError::Cancelled("web ingestion cancelled".into()));
            }
            let response = self.http.get(url).send().await.map_err(|e| RetrievalError::TransientRpc {
                service: "web-fetch".into(),
                message: e.to_string(),
            })?;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            if !status.is_success() {
                tracing::warn!(url, %status, "skipping page with non-success status");
                continue;
            }

            let content_hash = hash_content(&body);
            let document = self.catalog.upsert_document(collection.id, url, &content_hash, 0).await?;
            let chunks = chunk_document(&body, document.id, collection.id, Language::Html, url, Some(url), None, &self.ingestion_config());
            self.catalog.replace_chunks(document.id, &chunks).await?;
            self.catalog.upsert_document(collection.id, url, &content_hash, chunks.len() as u32).await?;
        }
        Ok(())
    }

    fn ingestion_config(&self) -> crate::config::Config {
        self.ingestion.config().clone()
    }

    fn ingestion_dense_dimensions(&self) -> u32 {
        self.ingestion.config().embedding.dimensions as u32
    }
}

fn hash_content(content: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Environment variable carrying a git credential (PAT or installation
/// token) for private repositories. Read here rather than accepting it
/// embedded in `url`, so it never ends up logged or persisted alongside the
/// dataset's source URL.
const GIT_TOKEN_ENV: &str = "RETRIEVAL_GIT_TOKEN";

/// Shallow, single-branch, tagless clone of `url` at `branch` (or the
/// remote's default branch) into `dest`, returning the checked-out commit
/// SHA.
///
/// `gix` never shells out to a credential helper or `GIT_ASKPASS`, so there
/// is no interactive prompt to suppress; a configured [`GIT_TOKEN_ENV`] is
/// injected as an `http.extraHeader` config override instead of being
/// embedded in the clone URL.
async fn clone_shallow(url: &str, branch: Option<&str>, dest: &std::path::Path) -> RetrievalResult<String> {
    let url = url.to_string();
    let branch = branch.map(str::to_string);
    let dest = dest.to_path_buf();
    let token = std::env::var(GIT_TOKEN_ENV).ok();

    tokio::task::spawn_blocking(move || -> RetrievalResult<String> {
        let mut open_options = gix::open::Options::default();
        if let Some(token) = &token {
            open_options = open_options
                .config_overrides([format!("http.extraHeader=Authorization: Bearer {token}")]);
        }

        let mut prepare = gix::clone::PrepareFetch::new(
            url.as_str(),
            &dest,
            gix::create::Kind::WithWorktree,
            gix::create::Options::default(),
            open_options,
        )
        .map_err(|e| RetrievalError::Internal(format!("clone setup failed: {e}")))?
        .with_shallow(gix::remote::fetch::Shallow::DepthAtRemote(1.try_into().expect("1 is a valid depth")));

        if let Some(branch) = &branch {
            prepare = prepare.with_ref_name(Some(branch.as_str())).map_err(|e| RetrievalError::Internal(format!("invalid branch ref: {e}")))?;
        }

        // Restrict the fetch refspec to the single ref being checked out
        // (or the remote's HEAD when no branch is requested) and skip tags
        // entirely -- this is a one-shot ingestion checkout, not a clone
        // meant for ongoing `git fetch`.
        prepare = prepare.configure_remote(|remote| Ok(remote.with_fetch_tags(gix::remote::fetch::Tags::None)));

        let (mut checkout, _outcome) = prepare
            .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
            .map_err(|e| RetrievalError::TransientRpc { service: "github-clone".into(), message: e.to_string() })?;
        let (repo, _outcome) = checkout
            .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
            .map_err(|e| RetrievalError::Internal(format!("checkout failed: {e}")))?;

        let sha = repo.head_id().map_err(|e| RetrievalError::Internal(format!("resolving checked-out HEAD failed: {e}")))?.to_string();
        Ok(sha)
    })
    .await
    .map_err(|e| RetrievalError::Internal(format!("clone task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(JobSourceKind);
    enum JobSourceKind {
        Local(PathBuf),
    }

    #[async_trait::async_trait]
    impl JobSourceResolver for FixedSource {
        async fn resolve(&self, _dataset: &Dataset) -> RetrievalResult<JobSource> {
            match &self.0 {
                JobSourceKind::Local(path) => Ok(JobSource::LocalPath(path.clone())),
            }
        }
    }

    #[tokio::test]
    async fn test_resolver_returns_local_path() {
        let resolver = FixedSource(JobSourceKind::Local(PathBuf::from("/tmp/example")));
        let dataset = Dataset {
            id: uuid::Uuid::new_v4(),
            project_id: uuid::Uuid::new_v4(),
            name: "docs".into(),
            source: DatasetSource::Code,
            visibility: crate::types::DatasetVisibility::Private,
            created_at: chrono::Utc::now(),
        };
        let source = resolver.resolve(&dataset).await.expect("resolve");
        match source {
            JobSource::LocalPath(path) => assert_eq!(path, PathBuf::from("/tmp/example")),
            _ => panic!("expected local path"),
        }
    }
}
