//! Command-line interface for the hybrid context retrieval engine.
//!
//! Each subcommand is a thin wrapper over `retrieval-core`: it opens the
//! catalog and vector store directly rather than talking to a running
//! `retrieval-server`, so it's useful both as an operator tool and as a
//! one-shot ingester in scripts and CI.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use retrieval_core::catalog::CatalogStore;
use retrieval_core::config::Config;
use retrieval_core::embedding::{EmbeddingClients, HttpDenseEmbeddingClient, HttpSparseEmbeddingClient};
use retrieval_core::ingestion::IngestionPipeline;
use retrieval_core::reranker::{HttpRerankerClient, RerankerClient};
use retrieval_core::retrieval::{RetrievalPipeline, RetrievalQuery};
use retrieval_core::scope::ScopeRequest;
use retrieval_core::types::{DatasetSource, DatasetVisibility, JobStatus};
use retrieval_core::vector::{FileVectorStore, VectorStore};

#[derive(Parser, Debug)]
#[command(name = "retrieval", version, about = "Operator CLI for the hybrid context retrieval engine")]
struct Cli {
    /// Directory the catalog database and vector store files live under.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a local directory into a project/dataset, running the job inline.
    Ingest {
        /// Project name, created if it doesn't exist.
        #[arg(long)]
        project: String,
        /// Dataset name, created if it doesn't exist.
        #[arg(long)]
        dataset: String,
        /// Directory to ingest as a code dataset.
        path: PathBuf,
        /// Mark the dataset shared with other projects via a project share.
        #[arg(long)]
        shared: bool,
    },
    /// Run a retrieval query against a project's datasets.
    Query {
        /// Project to search within.
        #[arg(long)]
        project: String,
        /// Dataset names to restrict the search to; empty searches all.
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Also search datasets shared into this project.
        #[arg(long)]
        include_global: bool,
        /// Maximum number of results to print.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Query text.
        text: String,
    },
    /// List known projects, or a project's datasets.
    Scopes {
        /// Project to list datasets for; omit to list all projects.
        project: Option<String>,
    },
    /// Show the status of an ingestion job.
    Jobs {
        /// Job id to look up.
        job_id: Uuid,
    },
    /// Ensure the catalog schema and data directories exist, then exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.unwrap_or_else(Config::default_data_dir);
    let config = Config::load(&data_dir)?;

    match cli.command {
        Command::Migrate => {
            CatalogStore::open(&config.catalog_path())?;
            FileVectorStore::open(&config.vector_dir())?;
            println!("catalog ready at {}", config.catalog_path().display());
            Ok(())
        }
        Command::Scopes { project } => run_scopes(&config, project).await,
        Command::Jobs { job_id } => run_jobs(&config, job_id).await,
        Command::Ingest { project, dataset, path, shared } => run_ingest(&config, project, dataset, path, shared).await,
        Command::Query { project, datasets, include_global, limit, text } => run_query(&config, project, datasets, include_global, limit, text).await,
    }
}

async fn run_scopes(config: &Config, project: Option<String>) -> Result<()> {
    let catalog = CatalogStore::open(&config.catalog_path())?;
    match project {
        None => {
            for project in catalog.list_projects().await? {
                println!("{}\t{}", project.id, project.name);
            }
        }
        Some(name) => {
            let project = catalog.get_project_by_name(&name).await?.ok_or_else(|| anyhow!("no such project: {name}"))?;
            for dataset in catalog.list_datasets(project.id).await? {
                println!("{}\t{}\t{}\t{:?}", dataset.id, dataset.name, dataset.source.as_str(), dataset.visibility);
            }
        }
    }
    Ok(())
}

async fn run_jobs(config: &Config, job_id: Uuid) -> Result<()> {
    let catalog = CatalogStore::open(&config.catalog_path())?;
    let job = catalog.get_job(job_id).await?.ok_or_else(|| anyhow!("no such job: {job_id}"))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

async fn run_ingest(config: &Config, project: String, dataset: String, path: PathBuf, shared: bool) -> Result<()> {
    let catalog = Arc::new(CatalogStore::open(&config.catalog_path())?);
    let vector_store: Arc<dyn VectorStore> = Arc::new(FileVectorStore::open(&config.vector_dir())?);
    let embedding = build_embedding_clients(config);
    let ingestion = IngestionPipeline::new(Arc::clone(&catalog), Arc::clone(&vector_store), Arc::clone(&embedding), config.clone());

    let project_row = match catalog.get_project_by_name(&project).await? {
        Some(p) => p,
        None => catalog.create_project(&project).await?,
    };
    let visibility = if shared { DatasetVisibility::Shared } else { DatasetVisibility::Private };
    let dataset_row = match catalog.list_datasets(project_row.id).await?.into_iter().find(|d| d.name == dataset) {
        Some(d) => d,
        None => catalog.create_dataset(project_row.id, &dataset, DatasetSource::Code, visibility).await?,
    };

    let singleton_key = format!("cli-ingest:{}:{}", project, dataset);
    let job = catalog
        .enqueue_job(dataset_row.id, &singleton_key)
        .await?
        .ok_or_else(|| anyhow!("a job for this dataset is already queued or running"))?;
    let claimed = catalog
        .claim_next_job("cli", config.jobs.visibility_timeout_secs)
        .await?
        .ok_or_else(|| anyhow!("enqueued job {} was not claimable", job.id))?;

    let cancel = CancellationToken::new();
    let outcome = ingestion.ingest_code_dataset(claimed.id, &project_row, &dataset_row, &path, &cancel).await;
    match outcome {
        Ok(()) => {
            catalog.finish_job(claimed.id, JobStatus::Completed, None).await?;
            println!("ingested {} into {}/{}", path.display(), project, dataset);
        }
        Err(e) => {
            catalog.finish_job(claimed.id, JobStatus::Failed, Some(&e.to_string())).await?;
            return Err(anyhow!(e));
        }
    }
    Ok(())
}

async fn run_query(config: &Config, project: String, datasets: Vec<String>, include_global: bool, limit: usize, text: String) -> Result<()> {
    let catalog = Arc::new(CatalogStore::open(&config.catalog_path())?);
    let vector_store: Arc<dyn VectorStore> = Arc::new(FileVectorStore::open(&config.vector_dir())?);
    let embedding = build_embedding_clients(config);
    let reranker: Option<Arc<dyn RerankerClient>> = config.search.reranker.enabled.then(|| Arc::new(HttpRerankerClient::from_config(&config.search.reranker)) as Arc<_>);

    let pipeline = RetrievalPipeline::new(catalog, vector_store, embedding, reranker, config.search.clone());
    let scope = ScopeRequest { project, datasets, include_global };
    let response = pipeline.run(&RetrievalQuery { scope, text, limit }).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn build_embedding_clients(config: &Config) -> Arc<EmbeddingClients> {
    let dense_text = Arc::new(HttpDenseEmbeddingClient::new(config.embedding.dense_url.clone()));
    let dense_code = Arc::new(HttpDenseEmbeddingClient::new(config.embedding.dense_code_url.clone()));
    let sparse = config
        .embedding
        .hybrid_enabled
        .then(|| Arc::new(HttpSparseEmbeddingClient::new(config.embedding.sparse_url.clone())) as Arc<_>);
    Arc::new(EmbeddingClients::new(
        dense_text,
        dense_code,
        sparse,
        config.embedding.concurrency,
        config.embedding.sparse_concurrency,
        config.embedding.batch_size,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_ingest_subcommand() {
        let cli = Cli::parse_from(["retrieval", "ingest", "--project", "demo", "--dataset", "main", "/tmp/repo"]);
        match cli.command {
            Command::Ingest { project, dataset, path, shared } => {
                assert_eq!(project, "demo");
                assert_eq!(dataset, "main");
                assert_eq!(path, PathBuf::from("/tmp/repo"));
                assert!(!shared);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_query_subcommand_with_datasets() {
        let cli = Cli::parse_from(["retrieval", "query", "--project", "demo", "--dataset", "main", "--dataset", "docs", "how does auth work"]);
        match cli.command {
            Command::Query { project, datasets, text, .. } => {
                assert_eq!(project, "demo");
                assert_eq!(datasets, vec!["main".to_string(), "docs".to_string()]);
                assert_eq!(text, "how does auth work");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
