//! HTTP/WebSocket surface for the hybrid context retrieval engine.
//!
//! Thin by design: request parsing and response serialization live in
//! [`routes`]; every decision is made inside `retrieval-core`. This binary
//! wires the core subsystems together, launches the ingestion workers, and
//! serves the axum app.

mod auth;
mod metrics;
mod resolver;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use retrieval_core::catalog::CatalogStore;
use retrieval_core::config::Config;
use retrieval_core::embedding::{EmbeddingClients, HttpDenseEmbeddingClient, HttpSparseEmbeddingClient};
use retrieval_core::events::EventBus;
use retrieval_core::ingestion::IngestionPipeline;
use retrieval_core::jobs::Worker;
use retrieval_core::reranker::{HttpRerankerClient, RerankerClient};
use retrieval_core::retrieval::RetrievalPipeline;
use retrieval_core::vector::{FileVectorStore, VectorStore};

use auth::{AuthGuard, UsageMeter};
use metrics::QueryMetrics;
use resolver::RegistryResolver;

#[derive(Parser, Debug)]
#[command(name = "retrieval-server", version, about = "HTTP/WebSocket surface for the hybrid context retrieval engine")]
struct Args {
    /// Directory the catalog database and vector store files live under.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    addr: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// API keys accepted on write endpoints; empty disables auth.
    #[arg(long)]
    api_key: Vec<String>,

    /// Number of ingestion workers to run in-process.
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

pub struct AppState {
    catalog: Arc<CatalogStore>,
    retrieval: RetrievalPipeline,
    resolver: Arc<RegistryResolver>,
    events: EventBus,
    metrics: QueryMetrics,
    auth: AuthGuard,
    usage: UsageMeter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).init();

    let data_dir = args.data_dir.unwrap_or_else(Config::default_data_dir);
    let config = Config::load(&data_dir)?;

    let catalog = Arc::new(CatalogStore::open(&config.catalog_path())?);
    let vector_store: Arc<dyn VectorStore> = Arc::new(FileVectorStore::open(&config.vector_dir())?);

    let dense_text = Arc::new(HttpDenseEmbeddingClient::new(config.embedding.dense_url.clone()));
    let dense_code = Arc::new(HttpDenseEmbeddingClient::new(config.embedding.dense_code_url.clone()));
    let sparse = config.embedding.hybrid_enabled.then(|| Arc::new(HttpSparseEmbeddingClient::new(config.embedding.sparse_url.clone())) as Arc<_>);
    let embedding = Arc::new(EmbeddingClients::new(
        dense_text,
        dense_code,
        sparse,
        config.embedding.concurrency,
        config.embedding.sparse_concurrency,
        config.embedding.batch_size,
    ));

    let reranker: Option<Arc<dyn RerankerClient>> = config.search.reranker.enabled.then(|| Arc::new(HttpRerankerClient::from_config(&config.search.reranker)) as Arc<_>);

    let retrieval = RetrievalPipeline::new(Arc::clone(&catalog), Arc::clone(&vector_store), Arc::clone(&embedding), reranker, config.search.clone());
    let ingestion = Arc::new(IngestionPipeline::new(Arc::clone(&catalog), Arc::clone(&vector_store), Arc::clone(&embedding), config.clone()));

    let events = EventBus::default();
    events.bridge_catalog_events("all", catalog.subscribe_job_events());

    let job_resolver = Arc::new(RegistryResolver::default());
    let cancel = CancellationToken::new();
    for i in 0..args.workers.max(1) {
        let worker = Worker::new(
            format!("worker-{i}"),
            Arc::clone(&catalog),
            Arc::clone(&ingestion),
            Arc::clone(&job_resolver) as Arc<_>,
            Duration::from_millis(config.jobs.poll_interval_ms),
            config.jobs.visibility_timeout_secs,
            config.jobs.max_attempts,
        );
        let worker_cancel = cancel.clone();
        tokio::spawn(async move { worker.run(worker_cancel).await });
    }

    let state = Arc::new(AppState {
        catalog,
        retrieval,
        resolver: job_resolver,
        events,
        metrics: QueryMetrics::default(),
        auth: AuthGuard::new(args.api_key, 0),
        usage: UsageMeter::default(),
    });

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", args.addr, args.port)).await?;
    tracing::info!(addr = %args.addr, port = args.port, "retrieval-server listening");
    axum::serve(listener, app).await?;

    cancel.cancel();
    Ok(())
}
