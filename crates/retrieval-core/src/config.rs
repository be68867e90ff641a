//! Configuration loading and validation.
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. CLI flags
//! 2. Environment variables (`RETRIEVAL_*`)
//! 3. Project config (`.retrieval/config.toml`)
//! 4. User config (`~/.config/retrieval/config.toml`)
//! 5. Compiled-in defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RetrievalError, RetrievalResult};

/// Top-level configuration for the retrieval engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory the catalog database and vector store files live under.
    pub data_dir: PathBuf,

    /// Indexing / chunking configuration.
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Retrieval (query-time) configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// Embedding service configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Ingestion job configuration.
    #[serde(default)]
    pub jobs: JobConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Indexing-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// File patterns to exclude from indexing (glob syntax).
    #[serde(default = "IndexingConfig::default_excludes")]
    pub exclude_patterns: Vec<String>,

    /// Maximum file size to index (in bytes). Files larger than this are skipped.
    #[serde(default = "IndexingConfig::default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum number of concurrent parse tasks.
    #[serde(default = "IndexingConfig::default_parse_concurrency")]
    pub parse_concurrency: usize,

    /// Target chunk size in tokens.
    #[serde(default = "IndexingConfig::default_max_chunk_tokens")]
    pub max_chunk_tokens: u32,

    /// Overlap fraction applied when an oversized structural element is
    /// re-split into multiple chunks (0.0 - 0.5).
    #[serde(default = "IndexingConfig::default_overlap_fraction")]
    pub overlap_fraction: f64,

    /// Chunk processing batch size, handed to the ingestion pipeline's
    /// chunk -> embed channel.
    #[serde(default = "IndexingConfig::default_chunk_batch_size")]
    pub chunk_batch_size: usize,

    /// Maximum number of embed/upsert batches in flight concurrently.
    #[serde(default = "IndexingConfig::default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Self::default_excludes(),
            max_file_size: Self::default_max_file_size(),
            parse_concurrency: Self::default_parse_concurrency(),
            max_chunk_tokens: Self::default_max_chunk_tokens(),
            overlap_fraction: Self::default_overlap_fraction(),
            chunk_batch_size: Self::default_chunk_batch_size(),
            max_concurrent_batches: Self::default_max_concurrent_batches(),
        }
    }
}

impl IndexingConfig {
    fn default_excludes() -> Vec<String> {
        vec![
            ".git".into(),
            "node_modules".into(),
            "target".into(),
            "__pycache__".into(),
            ".venv".into(),
            "venv".into(),
            "dist".into(),
            "build".into(),
            ".next".into(),
            "*.lock".into(),
            "*.min.js".into(),
            "*.min.css".into(),
            "*.map".into(),
        ]
    }

    fn default_max_file_size() -> u64 {
        5 * 1024 * 1024 // 5MB
    }

    fn default_parse_concurrency() -> usize {
        4
    }

    fn default_max_chunk_tokens() -> u32 {
        512
    }

    fn default_overlap_fraction() -> f64 {
        0.12
    }

    fn default_chunk_batch_size() -> usize {
        32
    }

    fn default_max_concurrent_batches() -> usize {
        4
    }
}

/// Retrieval (query-time) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default number of results to return.
    #[serde(default = "SearchConfig::default_limit")]
    pub default_limit: usize,

    /// Maximum number of results to return.
    #[serde(default = "SearchConfig::default_max_limit")]
    pub max_limit: usize,

    /// RRF constant (k parameter).
    #[serde(default = "SearchConfig::default_rrf_k")]
    pub rrf_k: u32,

    /// Weight given to the dense arm in weighted RRF fusion.
    #[serde(default = "SearchConfig::default_dense_weight")]
    pub hybrid_dense_weight: f64,

    /// Weight given to the sparse arm in weighted RRF fusion.
    #[serde(default = "SearchConfig::default_sparse_weight")]
    pub hybrid_sparse_weight: f64,

    /// Multiplier applied to the requested result count when searching each
    /// arm, before RRF fusion truncates back down. Over-fetching gives the
    /// fused ranking more candidates to draw from than either arm alone
    /// would have surfaced at the final size.
    #[serde(default = "SearchConfig::default_over_fetch")]
    pub over_fetch: usize,

    /// Reranker configuration.
    #[serde(default)]
    pub reranker: RerankerConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: Self::default_limit(),
            max_limit: Self::default_max_limit(),
            rrf_k: Self::default_rrf_k(),
            hybrid_dense_weight: Self::default_dense_weight(),
            hybrid_sparse_weight: Self::default_sparse_weight(),
            over_fetch: Self::default_over_fetch(),
            reranker: RerankerConfig::default(),
        }
    }
}

impl SearchConfig {
    fn default_limit() -> usize {
        10
    }
    fn default_max_limit() -> usize {
        100
    }
    fn default_rrf_k() -> u32 {
        60
    }
    fn default_dense_weight() -> f64 {
        0.6
    }
    fn default_sparse_weight() -> f64 {
        0.4
    }
    fn default_over_fetch() -> usize {
        3
    }
}

/// Cross-encoder reranker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerConfig {
    /// Whether reranking is enabled at all.
    #[serde(default = "RerankerConfig::default_enabled")]
    pub enabled: bool,

    /// Base URL of the reranker RPC service.
    #[serde(default = "RerankerConfig::default_url")]
    pub service_url: String,

    /// Number of RRF-ranked candidates passed into the reranker.
    #[serde(default = "RerankerConfig::default_initial_k")]
    pub initial_k: usize,

    /// Number of reranked results kept at the top of the final ordering.
    #[serde(default = "RerankerConfig::default_final_k")]
    pub final_k: usize,

    /// Maximum characters of chunk content sent to the reranker per
    /// document, truncated beyond this.
    #[serde(default = "RerankerConfig::default_text_max_chars")]
    pub text_max_chars: usize,

    /// Demotion factor applied to candidates outside `initial_k` (0.0 - 1.0).
    #[serde(default = "RerankerConfig::default_unranked_demotion")]
    pub unranked_demotion: f64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            service_url: Self::default_url(),
            initial_k: Self::default_initial_k(),
            final_k: Self::default_final_k(),
            text_max_chars: Self::default_text_max_chars(),
            unranked_demotion: Self::default_unranked_demotion(),
        }
    }
}

impl RerankerConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_url() -> String {
        "http://127.0.0.1:8081".into()
    }
    fn default_initial_k() -> usize {
        100
    }
    fn default_final_k() -> usize {
        20
    }
    fn default_text_max_chars() -> usize {
        2000
    }
    fn default_unranked_demotion() -> f64 {
        0.5
    }
}

/// Dense and sparse embedding RPC service configuration.
///
/// Dense embedding is split across two endpoints routed by chunk language:
/// a code-tuned model for AST-derived chunks and a text-tuned model for
/// prose and query text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Base URL of the text-tuned dense embedding service.
    #[serde(default = "EmbeddingConfig::default_dense_url")]
    pub dense_url: String,

    /// Base URL of the code-tuned dense embedding service.
    #[serde(default = "EmbeddingConfig::default_dense_code_url")]
    pub dense_code_url: String,

    /// Base URL of the sparse embedding service.
    #[serde(default = "EmbeddingConfig::default_sparse_url")]
    pub sparse_url: String,

    /// Output dense embedding dimensionality. Both dense endpoints must
    /// agree on this.
    #[serde(default = "EmbeddingConfig::default_dimensions")]
    pub dimensions: usize,

    /// Batch size for embedding RPC calls.
    #[serde(default = "EmbeddingConfig::default_batch_size")]
    pub batch_size: usize,

    /// Number of dense embedding RPC calls allowed in flight concurrently.
    #[serde(default = "EmbeddingConfig::default_concurrency")]
    pub concurrency: usize,

    /// Number of sparse embedding RPC calls allowed in flight concurrently.
    /// Defaults to 1: the sparse service is memory-constrained and doesn't
    /// tolerate the same concurrency as dense.
    #[serde(default = "EmbeddingConfig::default_sparse_concurrency")]
    pub sparse_concurrency: usize,

    /// Whether sparse embedding / hybrid search is enabled. When false,
    /// retrieval runs dense-only.
    #[serde(default = "EmbeddingConfig::default_hybrid_enabled")]
    pub hybrid_enabled: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dense_url: Self::default_dense_url(),
            dense_code_url: Self::default_dense_code_url(),
            sparse_url: Self::default_sparse_url(),
            dimensions: Self::default_dimensions(),
            batch_size: Self::default_batch_size(),
            concurrency: Self::default_concurrency(),
            sparse_concurrency: Self::default_sparse_concurrency(),
            hybrid_enabled: Self::default_hybrid_enabled(),
        }
    }
}

impl EmbeddingConfig {
    fn default_dense_url() -> String {
        "http://127.0.0.1:8082".into()
    }
    fn default_dense_code_url() -> String {
        "http://127.0.0.1:8084".into()
    }
    fn default_sparse_url() -> String {
        "http://127.0.0.1:8083".into()
    }
    fn default_dimensions() -> usize {
        768
    }
    fn default_batch_size() -> usize {
        32
    }
    fn default_concurrency() -> usize {
        4
    }
    fn default_sparse_concurrency() -> usize {
        1
    }
    fn default_hybrid_enabled() -> bool {
        true
    }
}

/// Ingestion job queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// How long a worker's claim on a job is valid before it's reclaimable.
    #[serde(default = "JobConfig::default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Maximum claim attempts before a job is marked failed.
    #[serde(default = "JobConfig::default_max_attempts")]
    pub max_attempts: u32,

    /// Polling interval for workers checking the queue.
    #[serde(default = "JobConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: Self::default_visibility_timeout_secs(),
            max_attempts: Self::default_max_attempts(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

impl JobConfig {
    fn default_visibility_timeout_secs() -> u64 {
        300
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_poll_interval_ms() -> u64 {
        500
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "trace").
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Whether to output logs as JSON.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".into()
    }
}

impl Config {
    /// Load configuration from defaults, then overlay user config, then
    /// project config, then environment variables.
    pub fn load(data_dir: &Path) -> RetrievalResult<Self> {
        let mut config = Self::defaults(data_dir);

        if let Some(user_config_dir) = dirs::config_dir() {
            let user_config_path = user_config_dir.join("retrieval").join("config.toml");
            if user_config_path.exists() {
                config.merge_from_file(&user_config_path)?;
            }
        }

        let project_config_path = PathBuf::from(".retrieval").join("config.toml");
        if project_config_path.exists() {
            config.merge_from_file(&project_config_path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Create a default configuration rooted at the given data directory.
    pub fn defaults(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            indexing: IndexingConfig::default(),
            search: SearchConfig::default(),
            embedding: EmbeddingConfig::default(),
            jobs: JobConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Returns the default data directory when none is configured
    /// explicitly: `<platform-data-dir>/retrieval-engine`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("retrieval-engine")
    }

    /// Path to the sqlite catalog database file.
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog.sqlite3")
    }

    /// Path to the directory holding per-collection vector store files.
    pub fn vector_dir(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Reject configurations that cannot run: hybrid search requested with
    /// no sparse service configured, or a data directory that cannot be
    /// created.
    fn validate(&self) -> RetrievalResult<()> {
        if self.embedding.hybrid_enabled && self.embedding.sparse_url.trim().is_empty() {
            return Err(RetrievalError::Config {
                details: "embedding.hybrid_enabled is true but embedding.sparse_url is empty"
                    .into(),
            });
        }
        if self.search.hybrid_dense_weight < 0.0 || self.search.hybrid_sparse_weight < 0.0 {
            return Err(RetrievalError::Config {
                details: "hybrid fusion weights must be non-negative".into(),
            });
        }
        Ok(())
    }

    /// Merge values from a TOML config file (non-destructive overlay).
    fn merge_from_file(&mut self, path: &Path) -> RetrievalResult<()> {
        let content = std::fs::read_to_string(path)?;
        let overlay: toml::Value = toml::from_str(&content).map_err(|e| RetrievalError::Config {
            details: format!("invalid TOML in {}: {e}", path.display()),
        })?;

        if let Some(indexing) = overlay.get("indexing") {
            if let Ok(parsed) = indexing.clone().try_into::<IndexingConfig>() {
                self.indexing = parsed;
            }
        }
        if let Some(search) = overlay.get("search") {
            if let Ok(parsed) = search.clone().try_into::<SearchConfig>() {
                self.search = parsed;
            }
        }
        if let Some(embedding) = overlay.get("embedding") {
            if let Ok(parsed) = embedding.clone().try_into::<EmbeddingConfig>() {
                self.embedding = parsed;
            }
        }
        if let Some(jobs) = overlay.get("jobs") {
            if let Ok(parsed) = jobs.clone().try_into::<JobConfig>() {
                self.jobs = parsed;
            }
        }
        if let Some(logging) = overlay.get("logging") {
            if let Ok(parsed) = logging.clone().try_into::<LoggingConfig>() {
                self.logging = parsed;
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("RETRIEVAL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(v) = std::env::var("EMBEDDING_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.embedding.concurrency = n;
            }
        }
        if let Ok(v) = std::env::var("CHUNK_BATCH_SIZE") {
            if let Ok(n) = v.parse() {
                self.indexing.chunk_batch_size = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_BATCHES") {
            if let Ok(n) = v.parse() {
                self.indexing.max_concurrent_batches = n;
            }
        }
        if let Ok(v) = std::env::var("HYBRID_DENSE_WEIGHT") {
            if let Ok(n) = v.parse() {
                self.search.hybrid_dense_weight = n;
            }
        }
        if let Ok(v) = std::env::var("HYBRID_SPARSE_WEIGHT") {
            if let Ok(n) = v.parse() {
                self.search.hybrid_sparse_weight = n;
            }
        }
        if let Ok(v) = std::env::var("RERANK_INITIAL_K") {
            if let Ok(n) = v.parse() {
                self.search.reranker.initial_k = n;
            }
        }
        if let Ok(v) = std::env::var("RERANK_FINAL_K") {
            if let Ok(n) = v.parse() {
                self.search.reranker.final_k = n;
            }
        }
        if let Ok(v) = std::env::var("RERANK_TEXT_MAX_CHARS") {
            if let Ok(n) = v.parse() {
                self.search.reranker.text_max_chars = n;
            }
        }
        if let Ok(url) = std::env::var("DENSE_EMBEDDING_URL") {
            self.embedding.dense_url = url;
        }
        if let Ok(url) = std::env::var("SPARSE_EMBEDDING_URL") {
            self.embedding.sparse_url = url;
        }
        if let Ok(url) = std::env::var("RERANKER_URL") {
            self.search.reranker.service_url = url;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::defaults(Path::new("/tmp/test-data"));
        assert_eq!(config.indexing.max_file_size, 5 * 1024 * 1024);
        assert_eq!(config.search.default_limit, 10);
        assert_eq!(config.search.rrf_k, 60);
        assert_eq!(config.embedding.dimensions, 768);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hybrid_enabled_requires_sparse_url() {
        let mut config = Config::defaults(Path::new("/tmp/test-data"));
        config.embedding.hybrid_enabled = true;
        config.embedding.sparse_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_language_from_extension() {
        use crate::types::Language;
        assert_eq!(Language::from_extension("py"), Language::Python);
        assert_eq!(Language::from_extension("rs"), Language::Rust);
        assert_eq!(Language::from_extension("ts"), Language::TypeScript);
        assert_eq!(Language::from_extension("tsx"), Language::TypeScript);
        assert_eq!(Language::from_extension("go"), Language::Go);
        assert_eq!(Language::from_extension("xyz"), Language::Unknown);
    }

    #[test]
    fn test_env_override_applies() {
        std::env::set_var("RERANK_FINAL_K", "7");
        let config = Config::load(Path::new("/tmp/test-data-env")).expect("load");
        assert_eq!(config.search.reranker.final_k, 7);
        std::env::remove_var("RERANK_FINAL_K");
    }
}
