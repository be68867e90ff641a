//! SQLite-backed relational catalog.
//!
//! Stores every scope entity (projects, datasets, collections, documents,
//! web provenance, project shares), chunk metadata (vector content itself
//! lives in the [`crate::vector`] store), and the durable ingestion job
//! queue. Configured in WAL mode; SQLite allows only one writer at a time,
//! so every method serializes through a single [`std::sync::Mutex`]
//! connection rather than pooling.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{RetrievalError, RetrievalResult};
use crate::types::{
    Chunk, Collection, Dataset, DatasetSource, DatasetVisibility, Document, IngestionJob, JobPhase,
    JobStatus, Language, Project, ProjectShare, SymbolMeta, WebMeta, WebProvenance,
};

/// Notification emitted whenever a job's status or phase changes, fanned
/// out to anyone subscribed via [`CatalogStore::subscribe_job_events`].
/// Stands in for a `LISTEN`/`NOTIFY` channel on a single-process deployment.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub phase: Option<JobPhase>,
    pub progress_pct: u8,
}

/// Relational catalog store.
pub struct CatalogStore {
    conn: Mutex<Connection>,
    job_events: broadcast::Sender<JobEvent>,
}

impl CatalogStore {
    /// Open or create a catalog database at `db_path`.
    pub fn open(db_path: &Path) -> RetrievalResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        let (job_events, _) = broadcast::channel(256);
        Ok(Self { conn: Mutex::new(conn), job_events })
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobEvent> {
        self.job_events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("catalog connection lock poisoned")
    }

    // ---- Projects ----

    pub async fn create_project(&self, name: &str) -> RetrievalResult<Project> {
        let project = Project { id: Uuid::new_v4(), name: name.to_string(), created_at: Utc::now() };
        self.lock().execute(
            "INSERT INTO projects (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![project.id.to_string(), project.name, project.created_at.to_rfc3339()],
        )?;
        Ok(project)
    }

    pub async fn get_project_by_name(&self, name: &str) -> RetrievalResult<Option<Project>> {
        self.lock()
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE name = ?1",
                params![name],
                row_to_project,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    pub async fn list_projects(&self) -> RetrievalResult<Vec<Project>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM projects ORDER BY name")?;
        let rows = stmt.query_map([], row_to_project)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RetrievalError::from)
    }

    pub async fn get_project_by_id(&self, project_id: Uuid) -> RetrievalResult<Option<Project>> {
        self.lock()
            .query_row(
                "SELECT id, name, created_at FROM projects WHERE id = ?1",
                params![project_id.to_string()],
                row_to_project,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    // ---- Datasets ----

    pub async fn create_dataset(
        &self,
        project_id: Uuid,
        name: &str,
        source: DatasetSource,
        visibility: DatasetVisibility,
    ) -> RetrievalResult<Dataset> {
        let dataset = Dataset {
            id: Uuid::new_v4(),
            project_id,
            name: name.to_string(),
            source,
            visibility,
            created_at: Utc::now(),
        };
        self.lock().execute(
            "INSERT INTO datasets (id, project_id, name, source, visibility, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                dataset.id.to_string(),
                dataset.project_id.to_string(),
                dataset.name,
                dataset.source.as_str(),
                dataset.visibility.as_str(),
                dataset.created_at.to_rfc3339(),
            ],
        )?;
        Ok(dataset)
    }

    pub async fn list_datasets(&self, project_id: Uuid) -> RetrievalResult<Vec<Dataset>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, name, source, visibility, created_at FROM datasets WHERE project_id = ?1",
        )?;
        let rows = stmt.query_map(params![project_id.to_string()], row_to_dataset)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RetrievalError::from)
    }

    pub async fn get_dataset_by_id(&self, dataset_id: Uuid) -> RetrievalResult<Option<Dataset>> {
        self.lock()
            .query_row(
                "SELECT id, project_id, name, source, visibility, created_at FROM datasets WHERE id = ?1",
                params![dataset_id.to_string()],
                row_to_dataset,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    // ---- Collections ----

    pub async fn create_collection(&self, dataset_id: Uuid, name: &str, dense_dimensions: u32) -> RetrievalResult<Collection> {
        let collection = Collection { id: Uuid::new_v4(), dataset_id, name: name.to_string(), dense_dimensions, created_at: Utc::now() };
        self.lock().execute(
            "INSERT INTO collections (id, dataset_id, name, dense_dimensions, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection.id.to_string(),
                collection.dataset_id.to_string(),
                collection.name,
                collection.dense_dimensions,
                collection.created_at.to_rfc3339(),
            ],
        )?;
        Ok(collection)
    }

    pub async fn get_collection_by_name(&self, name: &str) -> RetrievalResult<Option<Collection>> {
        self.lock()
            .query_row(
                "SELECT id, dataset_id, name, dense_dimensions, created_at FROM collections WHERE name = ?1",
                params![name],
                row_to_collection,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    // ---- Documents ----

    /// Insert or update a document row by `(collection_id, file_or_url)`,
    /// reconciling chunk count and content hash on re-ingest.
    pub async fn upsert_document(&self, collection_id: Uuid, file_or_url: &str, content_hash: &str, chunk_count: u32) -> RetrievalResult<Document> {
        let conn = self.lock();
        let existing: Option<Uuid> = conn
            .query_row(
                "SELECT id FROM documents WHERE collection_id = ?1 AND file_or_url = ?2",
                params![collection_id.to_string(), file_or_url],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|s| s.parse().expect("stored document id is a valid uuid"));

        let ingested_at = Utc::now();
        let id = existing.unwrap_or_else(Uuid::new_v4);
        conn.execute(
            "INSERT INTO documents (id, collection_id, file_or_url, content_hash, chunk_count, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(collection_id, file_or_url)
             DO UPDATE SET content_hash = excluded.content_hash, chunk_count = excluded.chunk_count, ingested_at = excluded.ingested_at",
            params![id.to_string(), collection_id.to_string(), file_or_url, content_hash, chunk_count, ingested_at.to_rfc3339()],
        )?;

        Ok(Document { id, collection_id, file_or_url: file_or_url.to_string(), content_hash: content_hash.to_string(), chunk_count, ingested_at })
    }

    pub async fn list_documents(&self, collection_id: Uuid) -> RetrievalResult<Vec<Document>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, collection_id, file_or_url, content_hash, chunk_count, ingested_at FROM documents WHERE collection_id = ?1",
        )?;
        let rows = stmt.query_map(params![collection_id.to_string()], row_to_document)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RetrievalError::from)
    }

    pub async fn get_document(&self, collection_id: Uuid, file_or_url: &str) -> RetrievalResult<Option<Document>> {
        self.lock()
            .query_row(
                "SELECT id, collection_id, file_or_url, content_hash, chunk_count, ingested_at FROM documents WHERE collection_id = ?1 AND file_or_url = ?2",
                params![collection_id.to_string(), file_or_url],
                row_to_document,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    /// Delete a document and cascade its chunks. Returns the chunk ids that
    /// existed, so callers can remove the matching vector points too.
    pub async fn delete_document(&self, document_id: Uuid) -> RetrievalResult<Vec<Uuid>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM chunks WHERE document_id = ?1")?;
        let ids: Vec<Uuid> = stmt
            .query_map(params![document_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|s| s.parse().expect("stored chunk id is a valid uuid"))
            .collect();
        conn.execute("DELETE FROM documents WHERE id = ?1", params![document_id.to_string()])?;
        Ok(ids)
    }

    pub async fn set_web_provenance(&self, provenance: &WebProvenance) -> RetrievalResult<()> {
        self.lock().execute(
            "INSERT INTO web_provenance (document_id, url, etag, last_modified, last_status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(document_id) DO UPDATE SET url = excluded.url, etag = excluded.etag,
                last_modified = excluded.last_modified, last_status = excluded.last_status",
            params![
                provenance.document_id.to_string(),
                provenance.url,
                provenance.etag,
                provenance.last_modified,
                provenance.last_status,
            ],
        )?;
        Ok(())
    }

    // ---- Project shares ----

    pub async fn create_project_share(
        &self,
        source_project_id: Uuid,
        target_project_id: Uuid,
        dataset_id: Option<Uuid>,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) -> RetrievalResult<ProjectShare> {
        let share =
            ProjectShare { id: Uuid::new_v4(), source_project_id, target_project_id, dataset_id, expires_at, created_at: Utc::now() };
        self.lock().execute(
            "INSERT INTO project_shares (id, source_project_id, target_project_id, dataset_id, expires_at, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                share.id.to_string(),
                share.source_project_id.to_string(),
                share.target_project_id.to_string(),
                share.dataset_id.map(|d| d.to_string()),
                share.expires_at.map(|t| t.to_rfc3339()),
                share.created_at.to_rfc3339(),
            ],
        )?;
        Ok(share)
    }

    /// Shares targeting `target_project_id` that haven't expired, consulted
    /// by retrieval when a query sets `include_global`.
    pub async fn list_active_shares_for_target(&self, target_project_id: Uuid) -> RetrievalResult<Vec<ProjectShare>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, source_project_id, target_project_id, dataset_id, expires_at, created_at
             FROM project_shares
             WHERE target_project_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )?;
        let rows = stmt.query_map(params![target_project_id.to_string(), Utc::now().to_rfc3339()], row_to_project_share)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RetrievalError::from)
    }

    // ---- Chunks ----

    /// Replace all chunks belonging to a document within one transaction.
    pub async fn replace_chunks(&self, document_id: Uuid, chunks: &[Chunk]) -> RetrievalResult<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![document_id.to_string()])?;
        for chunk in chunks {
            let symbol_json = chunk.symbol.as_ref().map(serde_json::to_string).transpose()?;
            let web_json = chunk.web.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO chunks (id, document_id, collection_id, ordinal, start_line, end_line, language,
                    file_or_url, chunk_title, symbol_json, web_json, content, content_hash, token_count,
                    dense_vector_id, sparse_vector_id)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                params![
                    chunk.id.to_string(),
                    chunk.document_id.to_string(),
                    chunk.collection_id.to_string(),
                    chunk.ordinal,
                    chunk.start_line,
                    chunk.end_line,
                    chunk.language.as_str(),
                    chunk.file_or_url,
                    chunk.chunk_title,
                    symbol_json,
                    web_json,
                    chunk.content,
                    chunk.content_hash,
                    chunk.token_count,
                    chunk.dense_vector_id.map(|id| id.to_string()),
                    chunk.sparse_vector_id.map(|id| id.to_string()),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn set_chunk_vector_ids(&self, chunk_id: Uuid, dense_vector_id: Option<Uuid>, sparse_vector_id: Option<Uuid>) -> RetrievalResult<()> {
        self.lock().execute(
            "UPDATE chunks SET dense_vector_id = ?2, sparse_vector_id = ?3 WHERE id = ?1",
            params![chunk_id.to_string(), dense_vector_id.map(|id| id.to_string()), sparse_vector_id.map(|id| id.to_string())],
        )?;
        Ok(())
    }

    pub async fn get_chunks_by_ids(&self, ids: &[Uuid]) -> RetrievalResult<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock();
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, document_id, collection_id, ordinal, start_line, end_line, language, file_or_url,
                chunk_title, symbol_json, web_json, content, content_hash, token_count, dense_vector_id, sparse_vector_id
             FROM chunks WHERE id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let rows = stmt.query_map(rusqlite::params_from_iter(id_strings), row_to_chunk)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(RetrievalError::from)
    }

    // ---- Ingestion jobs ----

    /// Enqueue a job, coalescing with any already-queued-or-running job
    /// sharing `singleton_key`. Returns `None` when coalesced.
    pub async fn enqueue_job(&self, dataset_id: Uuid, singleton_key: &str) -> RetrievalResult<Option<IngestionJob>> {
        let now = Utc::now();
        let job = IngestionJob {
            id: Uuid::new_v4(),
            dataset_id,
            singleton_key: singleton_key.to_string(),
            status: JobStatus::Queued,
            phase: None,
            progress_pct: 0,
            attempts: 0,
            last_error: None,
            claimed_by: None,
            claimed_until: None,
            created_at: now,
            updated_at: now,
            sha: None,
        };
        let result = self.lock().execute(
            "INSERT INTO ingestion_jobs (id, dataset_id, singleton_key, status, phase, progress_pct, attempts,
                last_error, claimed_by, claimed_until, created_at, updated_at, sha)
             VALUES (?1,?2,?3,?4,NULL,0,0,NULL,NULL,NULL,?5,?5,NULL)",
            params![job.id.to_string(), job.dataset_id.to_string(), job.singleton_key, job.status.as_str(), job.created_at.to_rfc3339()],
        );

        match result {
            Ok(_) => {
                let _ = self.job_events.send(JobEvent { job_id: job.id, status: job.status, phase: None, progress_pct: 0 });
                Ok(Some(job))
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest queued job (or a running job whose visibility
    /// timeout has expired), setting it to `Running` with a fresh claim.
    pub async fn claim_next_job(&self, worker_id: &str, visibility_timeout_secs: u64) -> RetrievalResult<Option<IngestionJob>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let now = Utc::now();
        let claimed_until = now + chrono::Duration::seconds(visibility_timeout_secs as i64);

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM ingestion_jobs
                 WHERE status = 'queued' OR (status = 'running' AND claimed_until < ?1)
                 ORDER BY created_at ASC LIMIT 1",
                params![now.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        tx.execute(
            "UPDATE ingestion_jobs SET status = 'running', claimed_by = ?2, claimed_until = ?3,
                attempts = attempts + 1, updated_at = ?4 WHERE id = ?1",
            params![id, worker_id, claimed_until.to_rfc3339(), now.to_rfc3339()],
        )?;

        let job = tx.query_row(
            "SELECT id, dataset_id, singleton_key, status, phase, progress_pct, attempts, last_error,
                claimed_by, claimed_until, created_at, updated_at, sha
             FROM ingestion_jobs WHERE id = ?1",
            params![id],
            row_to_job,
        )?;
        tx.commit()?;

        let _ = self.job_events.send(JobEvent { job_id: job.id, status: job.status, phase: job.phase, progress_pct: job.progress_pct });
        Ok(Some(job))
    }

    pub async fn update_job_progress(&self, job_id: Uuid, phase: JobPhase, progress_pct: u8) -> RetrievalResult<()> {
        self.lock().execute(
            "UPDATE ingestion_jobs SET phase = ?2, progress_pct = ?3, updated_at = ?4 WHERE id = ?1",
            params![job_id.to_string(), phase.as_str(), progress_pct, Utc::now().to_rfc3339()],
        )?;
        let _ = self.job_events.send(JobEvent { job_id, status: JobStatus::Running, phase: Some(phase), progress_pct });
        Ok(())
    }

    pub async fn finish_job(&self, job_id: Uuid, status: JobStatus, error: Option<&str>) -> RetrievalResult<()> {
        self.lock().execute(
            "UPDATE ingestion_jobs SET status = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?1",
            params![job_id.to_string(), status.as_str(), error, Utc::now().to_rfc3339()],
        )?;
        let _ = self.job_events.send(JobEvent { job_id, status, phase: None, progress_pct: if status == JobStatus::Completed { 100 } else { 0 } });
        Ok(())
    }

    pub async fn get_job(&self, job_id: Uuid) -> RetrievalResult<Option<IngestionJob>> {
        self.lock()
            .query_row(
                "SELECT id, dataset_id, singleton_key, status, phase, progress_pct, attempts, last_error,
                    claimed_by, claimed_until, created_at, updated_at, sha
                 FROM ingestion_jobs WHERE id = ?1",
                params![job_id.to_string()],
                row_to_job,
            )
            .optional()
            .map_err(RetrievalError::from)
    }

    /// Record the commit SHA actually checked out for a git-sourced job,
    /// once the clone has completed.
    pub async fn set_job_sha(&self, job_id: Uuid, sha: &str) -> RetrievalResult<()> {
        self.lock().execute(
            "UPDATE ingestion_jobs SET sha = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id.to_string(), sha, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn language_from_str(s: &str) -> Language {
    match s {
        "python" => Language::Python,
        "typescript" => Language::TypeScript,
        "javascript" => Language::JavaScript,
        "rust" => Language::Rust,
        "go" => Language::Go,
        "java" => Language::Java,
        "html" => Language::Html,
        "shell" => Language::Shell,
        "markdown" => Language::Markdown,
        "toml" => Language::Toml,
        "yaml" => Language::Yaml,
        "json" => Language::Json,
        _ => Language::Unknown,
    }
}

fn parse_uuid(s: String) -> Uuid {
    s.parse().expect("stored uuid column is malformed")
}

fn parse_timestamp(s: String) -> chrono::DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(&s).expect("stored timestamp column is malformed").with_timezone(&Utc)
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project { id: parse_uuid(row.get(0)?), name: row.get(1)?, created_at: parse_timestamp(row.get(2)?) })
}

fn row_to_dataset(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dataset> {
    Ok(Dataset {
        id: parse_uuid(row.get(0)?),
        project_id: parse_uuid(row.get(1)?),
        name: row.get(2)?,
        source: DatasetSource::from_str_lossy(&row.get::<_, String>(3)?),
        visibility: DatasetVisibility::from_str_lossy(&row.get::<_, String>(4)?),
        created_at: parse_timestamp(row.get(5)?),
    })
}

fn row_to_collection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: parse_uuid(row.get(0)?),
        dataset_id: parse_uuid(row.get(1)?),
        name: row.get(2)?,
        dense_dimensions: row.get(3)?,
        created_at: parse_timestamp(row.get(4)?),
    })
}

fn row_to_project_share(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectShare> {
    let dataset_id: Option<String> = row.get(3)?;
    let expires_at: Option<String> = row.get(4)?;
    Ok(ProjectShare {
        id: parse_uuid(row.get(0)?),
        source_project_id: parse_uuid(row.get(1)?),
        target_project_id: parse_uuid(row.get(2)?),
        dataset_id: dataset_id.map(parse_uuid),
        expires_at: expires_at.map(parse_timestamp),
        created_at: parse_timestamp(row.get(5)?),
    })
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: parse_uuid(row.get(0)?),
        collection_id: parse_uuid(row.get(1)?),
        file_or_url: row.get(2)?,
        content_hash: row.get(3)?,
        chunk_count: row.get(4)?,
        ingested_at: parse_timestamp(row.get(5)?),
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let symbol_json: Option<String> = row.get(9)?;
    let web_json: Option<String> = row.get(10)?;
    let symbol: Option<SymbolMeta> = symbol_json.and_then(|s| serde_json::from_str(&s).ok());
    let web: Option<WebMeta> = web_json.and_then(|s| serde_json::from_str(&s).ok());
    let dense_vector_id: Option<String> = row.get(14)?;
    let sparse_vector_id: Option<String> = row.get(15)?;

    Ok(Chunk {
        id: parse_uuid(row.get(0)?),
        document_id: parse_uuid(row.get(1)?),
        collection_id: parse_uuid(row.get(2)?),
        ordinal: row.get(3)?,
        start_line: row.get(4)?,
        end_line: row.get(5)?,
        language: language_from_str(&row.get::<_, String>(6)?),
        file_or_url: row.get(7)?,
        chunk_title: row.get(8)?,
        symbol,
        web,
        content: row.get(11)?,
        content_hash: row.get(12)?,
        token_count: row.get(13)?,
        dense_vector_id: dense_vector_id.map(parse_uuid),
        sparse_vector_id: sparse_vector_id.map(parse_uuid),
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestionJob> {
    let phase: Option<String> = row.get(4)?;
    let claimed_until: Option<String> = row.get(9)?;
    Ok(IngestionJob {
        id: parse_uuid(row.get(0)?),
        dataset_id: parse_uuid(row.get(1)?),
        singleton_key: row.get(2)?,
        status: JobStatus::from_str_lossy(&row.get::<_, String>(3)?),
        phase: phase.map(|p| match p.as_str() {
            "acquire" => JobPhase::Acquire,
            "enumerate" => JobPhase::Enumerate,
            "chunk" => JobPhase::Chunk,
            "embed" => JobPhase::Embed,
            "upsert" => JobPhase::Upsert,
            _ => JobPhase::Finalize,
        }),
        progress_pct: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        claimed_by: row.get(8)?,
        claimed_until: claimed_until.map(parse_timestamp),
        created_at: parse_timestamp(row.get(10)?),
        updated_at: parse_timestamp(row.get(11)?),
        sha: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_catalog() -> (tempfile::TempDir, CatalogStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CatalogStore::open(&dir.path().join("catalog.sqlite3")).expect("open");
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_fetch_project() {
        let (_dir, store) = open_test_catalog().await;
        let project = store.create_project("acme").await.expect("create");
        let fetched = store.get_project_by_name("acme").await.expect("fetch").expect("found");
        assert_eq!(fetched.id, project.id);
    }

    #[tokio::test]
    async fn test_document_upsert_reconciles_on_reingest() {
        let (_dir, store) = open_test_catalog().await;
        let project = store.create_project("acme").await.expect("create");
        let dataset = store.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");
        let collection = store.create_collection(dataset.id, "ctx_acme_docs", 768).await.expect("collection");

        let first = store.upsert_document(collection.id, "src/lib.rs", "hash1", 3).await.expect("upsert");
        let second = store.upsert_document(collection.id, "src/lib.rs", "hash2", 5).await.expect("upsert");
        assert_eq!(first.id, second.id);
        assert_eq!(second.content_hash, "hash2");
        assert_eq!(second.chunk_count, 5);
    }

    #[tokio::test]
    async fn test_job_singleton_coalescing() {
        let (_dir, store) = open_test_catalog().await;
        let project = store.create_project("acme").await.expect("create");
        let dataset = store.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");

        let first = store.enqueue_job(dataset.id, "ingest:docs").await.expect("enqueue");
        let second = store.enqueue_job(dataset.id, "ingest:docs").await.expect("enqueue");
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_claim_next_job_marks_running() {
        let (_dir, store) = open_test_catalog().await;
        let project = store.create_project("acme").await.expect("create");
        let dataset = store.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");
        store.enqueue_job(dataset.id, "ingest:docs").await.expect("enqueue");

        let claimed = store.claim_next_job("worker-1", 300).await.expect("claim").expect("job");
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

        let none_left = store.claim_next_job("worker-2", 300).await.expect("claim");
        assert!(none_left.is_none());
    }

    #[tokio::test]
    async fn test_replace_chunks_round_trips() {
        let (_dir, store) = open_test_catalog().await;
        let project = store.create_project("acme").await.expect("create");
        let dataset = store.create_dataset(project.id, "docs", DatasetSource::Code, DatasetVisibility::Private).await.expect("dataset");
        let collection = store.create_collection(dataset.id, "ctx_acme_docs", 768).await.expect("collection");
        let document = store.upsert_document(collection.id, "src/lib.rs", "hash1", 1).await.expect("doc");

        let chunk = Chunk {
            id: Uuid::new_v4(),
            document_id: document.id,
            collection_id: collection.id,
            ordinal: 0,
            start_line: Some(1),
            end_line: Some(10),
            language: Language::Rust,
            file_or_url: "src/lib.rs".into(),
            chunk_title: "parse".into(),
            symbol: None,
            web: None,
            content: "fn parse() {}".into(),
            content_hash: "abc".into(),
            token_count: 4,
            dense_vector_id: None,
            sparse_vector_id: None,
        };
        store.replace_chunks(document.id, &[chunk.clone()]).await.expect("replace");

        let fetched = store.get_chunks_by_ids(&[chunk.id]).await.expect("fetch");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].content, "fn parse() {}");
    }
}
