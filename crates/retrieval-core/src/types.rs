//! Core domain types shared across all retrieval-core subsystems.
//!
//! These types form the API contract between modules. Changing them
//! requires updating all consumers, so they should be stable and minimal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Language
// ---------------------------------------------------------------------------

/// Supported programming languages and document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Python (.py)
    Python,
    /// TypeScript (.ts, .tsx)
    TypeScript,
    /// JavaScript (.js, .jsx)
    JavaScript,
    /// Rust (.rs)
    Rust,
    /// Go (.go)
    Go,
    /// Java (.java)
    Java,
    /// HTML (.html, .htm)
    Html,
    /// Shell / Bash (.sh, .bash, .zsh)
    Shell,
    /// Markdown (.md, .mdx)
    Markdown,
    /// TOML configuration (.toml)
    Toml,
    /// YAML configuration (.yml, .yaml)
    Yaml,
    /// JSON data (.json, .jsonc)
    Json,
    /// Unknown / unsupported
    Unknown,
}

impl Language {
    /// Detect language from a file extension (no leading dot).
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "py" => Self::Python,
            "ts" | "tsx" => Self::TypeScript,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "rs" => Self::Rust,
            "go" => Self::Go,
            "java" => Self::Java,
            "html" | "htm" => Self::Html,
            "sh" | "bash" | "zsh" => Self::Shell,
            "md" | "mdx" => Self::Markdown,
            "toml" => Self::Toml,
            "yml" | "yaml" => Self::Yaml,
            "json" | "jsonc" => Self::Json,
            _ => Self::Unknown,
        }
    }

    /// Returns the language identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::Java => "java",
            Self::Html => "html",
            Self::Shell => "shell",
            Self::Markdown => "markdown",
            Self::Toml => "toml",
            Self::Yaml => "yaml",
            Self::Json => "json",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true if this is an AST-parseable programming language with a
    /// registered tree-sitter analyzer.
    pub fn is_code(&self) -> bool {
        matches!(
            self,
            Self::Python | Self::TypeScript | Self::JavaScript | Self::Rust | Self::Go | Self::Java
        )
    }

    /// Returns true if this is a documentation, web, or config format,
    /// chunked by section rather than by AST.
    pub fn is_document(&self) -> bool {
        matches!(
            self,
            Self::Markdown | Self::Toml | Self::Yaml | Self::Json | Self::Html | Self::Shell
        )
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Chunk types
// ---------------------------------------------------------------------------

/// The kind of construct a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    /// Function or method definition.
    Function,
    /// Class, struct, or record definition.
    Class,
    /// Trait, interface, or protocol definition.
    Trait,
    /// Implementation block (Rust `impl`, Java anonymous class, etc.).
    Impl,
    /// Constant or static variable.
    Const,
    /// Type alias or definition.
    TypeDef,
    /// Module or namespace declaration, or a document section heading.
    Module,
    /// Test function or test block.
    Test,
    /// Prose from a web page or document with no further structure.
    Prose,
    /// Top-level statements that don't fit other categories.
    TopLevel,
}

impl ChunkKind {
    /// Convert to storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Trait => "trait",
            Self::Impl => "impl",
            Self::Const => "const",
            Self::TypeDef => "typedef",
            Self::Module => "module",
            Self::Test => "test",
            Self::Prose => "prose",
            Self::TopLevel => "top_level",
        }
    }

    /// Parse from storage string, defaulting to `TopLevel` for anything
    /// unrecognized rather than failing -- chunk kind is metadata, not an
    /// invariant the read path should enforce.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "function" => Self::Function,
            "class" => Self::Class,
            "trait" => Self::Trait,
            "impl" => Self::Impl,
            "const" => Self::Const,
            "typedef" => Self::TypeDef,
            "module" => Self::Module,
            "test" => Self::Test,
            "prose" => Self::Prose,
            _ => Self::TopLevel,
        }
    }
}

/// Visibility of a code symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Accessible from outside the module/crate.
    Public,
    /// Accessible only within the current crate/package.
    Crate,
    /// Accessible from parent class or subclasses.
    Protected,
    /// Accessible only within the defining scope.
    Private,
}

impl Visibility {
    /// Convert to storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Crate => "crate",
            Self::Protected => "protected",
            Self::Private => "private",
        }
    }

    /// Parse from storage string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "public" => Self::Public,
            "crate" => Self::Crate,
            "protected" => Self::Protected,
            _ => Self::Private,
        }
    }
}

/// Symbol metadata attached to a code chunk (spec §3 `symbol` shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolMeta {
    /// Short name (e.g. `validate_token`).
    pub name: String,
    /// Construct kind.
    pub kind: ChunkKind,
    /// Declaration signature, when extractable (function/method parameter
    /// list and return type, class/trait header).
    pub signature: Option<String>,
    /// Enclosing symbol's fully qualified path, if any.
    pub parent: Option<String>,
    /// Extracted doc comment, if any.
    pub docstring: Option<String>,
}

/// Provenance metadata attached to a chunk sourced from a web page (spec §3
/// `web` shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebMeta {
    /// Canonical URL of the source page.
    pub url: String,
    /// Registrable domain of the URL.
    pub domain: String,
    /// Page title, if known.
    pub title: Option<String>,
    /// Heading breadcrumb leading to this section (e.g. `["Guide", "Auth"]`).
    pub section_path: Vec<String>,
}

/// A semantically meaningful chunk of content extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable chunk identifier.
    pub id: Uuid,
    /// ID of the parent document.
    pub document_id: Uuid,
    /// ID of the collection this chunk belongs to.
    pub collection_id: Uuid,
    /// Ordinal position of this chunk within its document, from 0.
    pub ordinal: u32,
    /// Starting line number within the source file, 1-indexed (code only).
    pub start_line: Option<u32>,
    /// Ending line number within the source file, 1-indexed inclusive.
    pub end_line: Option<u32>,
    /// Detected language / format.
    pub language: Language,
    /// The file path (code sources) or URL (web sources) this chunk came
    /// from.
    pub file_or_url: String,
    /// Display title for this chunk (symbol name, section heading, or a
    /// truncated content preview as a last resort).
    pub chunk_title: String,
    /// Symbol metadata, present for AST-derived code chunks.
    pub symbol: Option<SymbolMeta>,
    /// Web provenance metadata, present for web-sourced chunks.
    pub web: Option<WebMeta>,
    /// The chunk's text content, as sent to the embedding service.
    pub content: String,
    /// SHA-256 hash of `content`, used for idempotent re-ingest.
    pub content_hash: String,
    /// Estimated token count for this chunk.
    pub token_count: u32,
    /// Dense vector point ID in the vector store, once embedded.
    pub dense_vector_id: Option<Uuid>,
    /// Sparse vector point ID in the vector store, once embedded.
    pub sparse_vector_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Scope entities (spec §3)
// ---------------------------------------------------------------------------

/// A top-level tenant boundary. All datasets, collections, and jobs are
/// scoped under exactly one project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Stable identifier.
    pub id: Uuid,
    /// Human-assigned name, normalized (see [`crate::scope`]).
    pub name: String,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// The kind of source material a dataset ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    /// A local or cloned code repository.
    Code,
    /// One or more fetched web pages.
    Web,
}

impl DatasetSource {
    /// Storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Web => "web",
        }
    }

    /// Parse from storage string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "web" => Self::Web,
            _ => Self::Code,
        }
    }
}

/// Visibility of a dataset with respect to other datasets in the same
/// project (spec §9 Open Question 2: `include_global` semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetVisibility {
    /// Only reachable when a query names it explicitly.
    Private,
    /// Reachable by `include_global=true` queries within the same project.
    Shared,
}

impl DatasetVisibility {
    /// Storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Shared => "shared",
        }
    }

    /// Parse from storage string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "shared" => Self::Shared,
            _ => Self::Private,
        }
    }
}

/// A named grouping of collections within a project, e.g. one dataset per
/// ingested repository or crawled site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Human-assigned name, normalized.
    pub name: String,
    /// What kind of source this dataset ingests.
    pub source: DatasetSource,
    /// Sharing visibility within the project.
    pub visibility: DatasetVisibility,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A vector-store collection backing one dataset. Collections are the unit
/// the `VectorStore` trait operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning dataset.
    pub dataset_id: Uuid,
    /// Vector-store-facing name (`ctx_<project>_<dataset>`).
    pub name: String,
    /// Dense embedding dimensionality, fixed at creation.
    pub dense_dimensions: u32,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A single ingested unit: one file within a code dataset, or one page
/// within a web dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable identifier.
    pub id: Uuid,
    /// Owning collection.
    pub collection_id: Uuid,
    /// File path (code) or URL (web) that identifies this document within
    /// its dataset.
    pub file_or_url: String,
    /// SHA-256 hash of the full raw document content, used to skip
    /// re-chunking unchanged documents on re-ingest.
    pub content_hash: String,
    /// Number of chunks currently derived from this document.
    pub chunk_count: u32,
    /// Last time this document was (re-)ingested.
    pub ingested_at: chrono::DateTime<chrono::Utc>,
}

/// HTTP caching and change-detection metadata for a web-sourced document
/// (spec §9 Open Question 4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebProvenance {
    /// Owning document.
    pub document_id: Uuid,
    /// Canonical URL fetched.
    pub url: String,
    /// `ETag` response header from the last successful fetch, if any.
    pub etag: Option<String>,
    /// `Last-Modified` response header from the last successful fetch, if
    /// any.
    pub last_modified: Option<String>,
    /// HTTP status of the most recent fetch attempt.
    pub last_status: Option<u16>,
}

/// Cross-project sharing grant (spec §3 `ProjectShare`). Consulted during
/// scope resolution when a query sets `include_global`: the target
/// project's active (non-expired) shares pull in the source project's
/// shared-visibility datasets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectShare {
    /// Stable identifier.
    pub id: Uuid,
    /// Project granting access.
    pub source_project_id: Uuid,
    /// Project receiving access.
    pub target_project_id: Uuid,
    /// Dataset within the source project being shared, or `None` for all of
    /// the source project's shared-visibility datasets.
    pub dataset_id: Option<Uuid>,
    /// When this grant stops applying. `None` means it never expires.
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Ingestion jobs (spec §3, §4.9)
// ---------------------------------------------------------------------------

/// Lifecycle state of an ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker to claim it.
    Queued,
    /// Claimed by a worker and in progress.
    Running,
    /// Completed all phases successfully.
    Completed,
    /// Failed after exhausting retries.
    Failed,
    /// Cancelled by a caller before completion.
    Cancelled,
}

impl JobStatus {
    /// Storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from storage string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => Self::Queued,
        }
    }

    /// True once the job will not transition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Phase of the ingestion pipeline an in-progress job is in (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Acquiring source material (cloning a repo, fetching a page).
    Acquire,
    /// Enumerating the set of documents to process.
    Enumerate,
    /// Splitting documents into chunks.
    Chunk,
    /// Calling out to embedding services.
    Embed,
    /// Writing chunks and vectors to the catalog and vector store.
    Upsert,
    /// Reconciling deletions and committing job completion.
    Finalize,
}

impl JobPhase {
    /// Storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acquire => "acquire",
            Self::Enumerate => "enumerate",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
            Self::Upsert => "upsert",
            Self::Finalize => "finalize",
        }
    }
}

/// A durable ingestion job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJob {
    /// Stable identifier.
    pub id: Uuid,
    /// Target dataset.
    pub dataset_id: Uuid,
    /// Coalescing key: a second job submitted with the same key while one is
    /// queued or running is dropped rather than duplicated.
    pub singleton_key: String,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Current phase, set once the job starts running.
    pub phase: Option<JobPhase>,
    /// Completion percentage within the current phase, 0-100.
    pub progress_pct: u8,
    /// Number of claim attempts so far.
    pub attempts: u32,
    /// Error message from the most recent failed attempt, if any.
    pub last_error: Option<String>,
    /// Worker identity holding the current claim, if running.
    pub claimed_by: Option<String>,
    /// When the current claim expires and the job becomes reclaimable.
    pub claimed_until: Option<chrono::DateTime<chrono::Utc>>,
    /// Creation timestamp.
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Last update timestamp.
    pub updated_at: chrono::DateTime<chrono::Utc>,
    /// Commit SHA actually checked out, for a git-sourced job. Resolved
    /// after clone, once `HEAD` exists on disk.
    pub sha: Option<String>,
}

// ---------------------------------------------------------------------------
// Retrieval types (spec §4.8)
// ---------------------------------------------------------------------------

/// Per-retrieval-arm scoring detail attached to a result, preserved for
/// observability even after reranking overwrites the primary ordering key
/// (spec §9 Open Question 3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArmScores {
    /// Rank from dense vector search (1-indexed), if matched.
    pub dense_rank: Option<u32>,
    /// Rank from sparse vector search (1-indexed), if matched.
    pub sparse_rank: Option<u32>,
    /// Raw dense similarity score, if matched. Used as an RRF tie-break.
    pub dense_score: Option<f64>,
    /// Raw sparse similarity score, if matched.
    pub sparse_score: Option<f64>,
    /// Reciprocal rank fusion score across all arms.
    pub rrf_score: f64,
    /// Cross-encoder reranker score, if this result was reranked.
    pub reranker_score: Option<f64>,
    /// True if this result fell outside the reranked prefix and was
    /// demoted rather than scored.
    pub reranker_skipped: bool,
}

/// A single retrieval result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    /// The matched chunk.
    pub chunk: Chunk,
    /// Final relevance score used for ordering (reranker score when
    /// present, RRF score otherwise).
    pub score: f64,
    /// Per-arm scoring breakdown.
    pub arm_scores: ArmScores,
}

/// A fully assembled retrieval response: ranked results plus totals useful
/// for pagination and observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResponse {
    /// Ranked, truncated results.
    pub results: Vec<SearchResult>,
    /// Number of candidates considered before truncation.
    pub candidates_considered: usize,
    /// True if reranking was requested and actually ran.
    pub reranked: bool,
    /// True if reranking was requested but skipped after the reranker RPC
    /// failed; `results` keep their pre-rerank RRF ordering in that case.
    pub reranker_skipped: bool,
}
