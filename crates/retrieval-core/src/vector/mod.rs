//! Dense and sparse vector storage, plus reciprocal rank fusion.
//!
//! Each collection gets a flat dense index (brute-force cosine scan) and an
//! inverted sparse index (postings list per term), held in memory and
//! persisted to newline-delimited JSON under the data directory. A flat
//! scan is the right tradeoff at the scale a single collection holds here;
//! an HNSW index is the natural upgrade path if collections grow past a
//! few hundred thousand chunks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::embedding::SparseVector;
use crate::error::{RetrievalError, RetrievalResult};
use crate::types::ArmScores;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DensePoint {
    chunk_id: Uuid,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SparsePoint {
    chunk_id: Uuid,
    terms: SparseVector,
}

#[derive(Default)]
struct CollectionData {
    dense_dimensions: u32,
    dense: Vec<DensePoint>,
    sparse: Vec<SparsePoint>,
    /// term_id -> indices into `sparse` holding that term, for faster
    /// sparse search than a full linear scan.
    postings: HashMap<u32, Vec<usize>>,
}

impl CollectionData {
    fn rebuild_postings(&mut self) {
        self.postings.clear();
        for (idx, point) in self.sparse.iter().enumerate() {
            for &(term_id, _) in &point.terms {
                self.postings.entry(term_id).or_default().push(idx);
            }
        }
    }
}

/// Summary statistics for a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionStats {
    pub name: String,
    pub dense_dimensions: u32,
    pub dense_count: usize,
    pub sparse_count: usize,
}

/// Storage and search over per-collection dense and sparse vectors.
#[async_trait::async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_collection(&self, collection: &str, dense_dimensions: u32) -> RetrievalResult<()>;
    async fn upsert_dense(&self, collection: &str, points: Vec<(Uuid, Vec<f32>)>) -> RetrievalResult<()>;
    async fn upsert_sparse(&self, collection: &str, points: Vec<(Uuid, SparseVector)>) -> RetrievalResult<()>;
    async fn delete_by_chunk_ids(&self, collection: &str, chunk_ids: &[Uuid]) -> RetrievalResult<()>;
    async fn search_dense(&self, collection: &str, query: &[f32], k: usize) -> RetrievalResult<Vec<(Uuid, f32)>>;
    async fn search_sparse(&self, collection: &str, query: &SparseVector, k: usize) -> RetrievalResult<Vec<(Uuid, f32)>>;
    async fn list_collections(&self) -> RetrievalResult<Vec<String>>;
    async fn collection_stats(&self, collection: &str) -> RetrievalResult<CollectionStats>;
}

/// File-backed [`VectorStore`], one JSONL pair of files per collection.
pub struct FileVectorStore {
    root: PathBuf,
    collections: RwLock<HashMap<String, RwLock<CollectionData>>>,
}

impl FileVectorStore {
    /// Open (creating if necessary) a vector store rooted at `root`,
    /// loading any collections already persisted there.
    pub fn open(root: &Path) -> RetrievalResult<Self> {
        std::fs::create_dir_all(root)?;
        let store = Self { root: root.to_path_buf(), collections: RwLock::new(HashMap::new()) };
        store.load_existing()?;
        Ok(store)
    }

    fn load_existing(&self) -> RetrievalResult<()> {
        let mut collections = self.collections.write().expect("collections lock poisoned");
        // Collection names are recovered from "<name>.dense.jsonl" file names.
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            let Some(name) = file_name.strip_suffix(".dense.jsonl") else { continue };
            let data = self.read_collection(name)?;
            collections.insert(name.to_string(), RwLock::new(data));
        }
        Ok(())
    }

    fn dense_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.dense.jsonl"))
    }

    fn sparse_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.sparse.jsonl"))
    }

    fn meta_path(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{collection}.meta.json"))
    }

    fn read_collection(&self, collection: &str) -> RetrievalResult<CollectionData> {
        let dense_dimensions = if self.meta_path(collection).exists() {
            let raw = std::fs::read_to_string(self.meta_path(collection))?;
            raw.trim().parse().unwrap_or(0)
        } else {
            0
        };

        let dense = read_jsonl(&self.dense_path(collection))?;
        let sparse = read_jsonl(&self.sparse_path(collection))?;
        let mut data = CollectionData { dense_dimensions, dense, sparse, postings: HashMap::new() };
        data.rebuild_postings();
        Ok(data)
    }

    fn persist(&self, collection: &str, data: &CollectionData) -> RetrievalResult<()> {
        write_jsonl(&self.dense_path(collection), &data.dense)?;
        write_jsonl(&self.sparse_path(collection), &data.sparse)?;
        std::fs::write(self.meta_path(collection), data.dense_dimensions.to_string())?;
        Ok(())
    }

    fn with_collection<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionData) -> RetrievalResult<T>,
    ) -> RetrievalResult<T> {
        let collections = self.collections.read().expect("collections lock poisoned");
        let Some(lock) = collections.get(collection) else {
            return Err(RetrievalError::NotFound { entity: format!("vector collection {collection}") });
        };
        let mut data = lock.write().expect("collection lock poisoned");
        f(&mut data)
    }
}

fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> RetrievalResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(RetrievalError::from))
        .collect()
}

fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> RetrievalResult<()> {
    let mut buf = String::new();
    for item in items {
        buf.push_str(&serde_json::to_string(item)?);
        buf.push('\n');
    }
    std::fs::write(path, buf)?;
    Ok(())
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn top_k<T>(mut scored: Vec<(T, f32)>, k: usize) -> Vec<(T, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}

#[async_trait::async_trait]
impl VectorStore for FileVectorStore {
    async fn ensure_collection(&self, collection: &str, dense_dimensions: u32) -> RetrievalResult<()> {
        let mut collections = self.collections.write().expect("collections lock poisoned");
        match collections.get(collection) {
            Some(existing) => {
                let existing_dimensions = existing.read().expect("collection lock poisoned").dense_dimensions;
                if existing_dimensions != dense_dimensions {
                    return Err(RetrievalError::Consistency {
                        details: format!(
                            "collection {collection} already exists with dense_dimensions={existing_dimensions}, \
                             requested dense_dimensions={dense_dimensions}"
                        ),
                    });
                }
                Ok(())
            }
            None => {
                let data = CollectionData { dense_dimensions, ..Default::default() };
                self.persist(collection, &data)?;
                collections.insert(collection.to_string(), RwLock::new(data));
                Ok(())
            }
        }
    }

    async fn upsert_dense(&self, collection: &str, points: Vec<(Uuid, Vec<f32>)>) -> RetrievalResult<()> {
        self.with_collection(collection, |data| {
            for (chunk_id, vector) in points {
                data.dense.retain(|p| p.chunk_id != chunk_id);
                data.dense.push(DensePoint { chunk_id, vector });
            }
            Ok(())
        })?;
        let collections = self.collections.read().expect("collections lock poisoned");
        let data = collections[collection].read().expect("collection lock poisoned");
        self.persist(collection, &data)
    }

    async fn upsert_sparse(&self, collection: &str, points: Vec<(Uuid, SparseVector)>) -> RetrievalResult<()> {
        self.with_collection(collection, |data| {
            for (chunk_id, terms) in points {
                data.sparse.retain(|p| p.chunk_id != chunk_id);
                data.sparse.push(SparsePoint { chunk_id, terms });
            }
            data.rebuild_postings();
            Ok(())
        })?;
        let collections = self.collections.read().expect("collections lock poisoned");
        let data = collections[collection].read().expect("collection lock poisoned");
        self.persist(collection, &data)
    }

    async fn delete_by_chunk_ids(&self, collection: &str, chunk_ids: &[Uuid]) -> RetrievalResult<()> {
        self.with_collection(collection, |data| {
            data.dense.retain(|p| !chunk_ids.contains(&p.chunk_id));
            data.sparse.retain(|p| !chunk_ids.contains(&p.chunk_id));
            data.rebuild_postings();
            Ok(())
        })?;
        let collections = self.collections.read().expect("collections lock poisoned");
        let data = collections[collection].read().expect("collection lock poisoned");
        self.persist(collection, &data)
    }

    async fn search_dense(&self, collection: &str, query: &[f32], k: usize) -> RetrievalResult<Vec<(Uuid, f32)>> {
        self.with_collection(collection, |data| {
            let scored: Vec<(Uuid, f32)> =
                data.dense.iter().map(|p| (p.chunk_id, cosine(query, &p.vector))).collect();
            Ok(top_k(scored, k))
        })
    }

    async fn search_sparse(&self, collection: &str, query: &SparseVector, k: usize) -> RetrievalResult<Vec<(Uuid, f32)>> {
        self.with_collection(collection, |data| {
            let mut candidate_idx: std::collections::HashSet<usize> = std::collections::HashSet::new();
            for &(term_id, _) in query {
                if let Some(idxs) = data.postings.get(&term_id) {
                    candidate_idx.extend(idxs);
                }
            }
            let scored: Vec<(Uuid, f32)> = candidate_idx
                .into_iter()
                .map(|idx| {
                    let point = &data.sparse[idx];
                    let score: f32 = query
                        .iter()
                        .filter_map(|(term_id, weight)| {
                            point.terms.iter().find(|(t, _)| t == term_id).map(|(_, w)| weight * w)
                        })
                        .sum();
                    (point.chunk_id, score)
                })
                .collect();
            Ok(top_k(scored, k))
        })
    }

    async fn list_collections(&self) -> RetrievalResult<Vec<String>> {
        let collections = self.collections.read().expect("collections lock poisoned");
        Ok(collections.keys().cloned().collect())
    }

    async fn collection_stats(&self, collection: &str) -> RetrievalResult<CollectionStats> {
        self.with_collection(collection, |data| {
            Ok(CollectionStats {
                name: collection.to_string(),
                dense_dimensions: data.dense_dimensions,
                dense_count: data.dense.len(),
                sparse_count: data.sparse.len(),
            })
        })
    }
}

/// Reciprocal rank fusion across a dense-ranked and sparse-ranked result
/// list, producing one [`ArmScores`]-annotated entry per chunk id that
/// appeared in either list.
///
/// Ties in `rrf_score` (common with small candidate sets, or identical
/// weights) break first on raw dense score, then on chunk id, so ordering
/// is deterministic across runs rather than depending on hash iteration
/// order.
pub fn rrf_fuse(
    dense: &[(Uuid, f32)],
    sparse: &[(Uuid, f32)],
    k: f64,
    dense_weight: f64,
    sparse_weight: f64,
) -> Vec<(Uuid, ArmScores)> {
    let mut scores: HashMap<Uuid, ArmScores> = HashMap::new();

    for (rank, (chunk_id, score)) in dense.iter().enumerate() {
        let entry = scores.entry(*chunk_id).or_default();
        entry.dense_rank = Some(rank as u32 + 1);
        entry.dense_score = Some(f64::from(*score));
        entry.rrf_score += dense_weight / (k + (rank as f64 + 1.0));
    }
    for (rank, (chunk_id, score)) in sparse.iter().enumerate() {
        let entry = scores.entry(*chunk_id).or_default();
        entry.sparse_rank = Some(rank as u32 + 1);
        entry.sparse_score = Some(f64::from(*score));
        entry.rrf_score += sparse_weight / (k + (rank as f64 + 1.0));
    }

    let mut fused: Vec<(Uuid, ArmScores)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.rrf_score
            .total_cmp(&a.1.rrf_score)
            .then_with(|| b.1.dense_score.unwrap_or(f64::MIN).total_cmp(&a.1.dense_score.unwrap_or(f64::MIN)))
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[tokio::test]
    async fn test_dense_upsert_and_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVectorStore::open(dir.path()).expect("open");
        store.ensure_collection("ctx_test", 3).await.expect("ensure");
        store
            .upsert_dense("ctx_test", vec![(uuid(1), vec![1.0, 0.0, 0.0]), (uuid(2), vec![0.0, 1.0, 0.0])])
            .await
            .expect("upsert");

        let results = store.search_dense("ctx_test", &[1.0, 0.0, 0.0], 5).await.expect("search");
        assert_eq!(results[0].0, uuid(1));
    }

    #[tokio::test]
    async fn test_sparse_upsert_and_search() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVectorStore::open(dir.path()).expect("open");
        store.ensure_collection("ctx_test", 3).await.expect("ensure");
        store
            .upsert_sparse("ctx_test", vec![(uuid(1), vec![(5, 1.0), (9, 2.0)]), (uuid(2), vec![(5, 0.1)])])
            .await
            .expect("upsert");

        let results = store.search_sparse("ctx_test", &vec![(5, 1.0), (9, 1.0)], 5).await.expect("search");
        assert_eq!(results[0].0, uuid(1));
    }

    #[tokio::test]
    async fn test_delete_removes_from_both_indices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVectorStore::open(dir.path()).expect("open");
        store.ensure_collection("ctx_test", 3).await.expect("ensure");
        store.upsert_dense("ctx_test", vec![(uuid(1), vec![1.0, 0.0, 0.0])]).await.expect("upsert");
        store.delete_by_chunk_ids("ctx_test", &[uuid(1)]).await.expect("delete");

        let stats = store.collection_stats("ctx_test").await.expect("stats");
        assert_eq!(stats.dense_count, 0);
    }

    #[test]
    fn test_rrf_fuse_combines_both_arms() {
        let dense = vec![(uuid(1), 0.9), (uuid(2), 0.8)];
        let sparse = vec![(uuid(2), 5.0), (uuid(1), 4.0)];
        let fused = rrf_fuse(&dense, &sparse, 60.0, 0.6, 0.4);
        assert_eq!(fused.len(), 2);
        assert!(fused[0].1.rrf_score > 0.0);
        assert!(fused.iter().all(|(_, s)| s.dense_rank.is_some() && s.sparse_rank.is_some()));
    }

    #[test]
    fn test_rrf_fuse_handles_dense_only_match() {
        let dense = vec![(uuid(3), 0.5)];
        let sparse: Vec<(Uuid, f32)> = Vec::new();
        let fused = rrf_fuse(&dense, &sparse, 60.0, 0.6, 0.4);
        assert_eq!(fused.len(), 1);
        assert!(fused[0].1.sparse_rank.is_none());
    }

    #[test]
    fn test_rrf_fuse_ties_break_on_dense_score() {
        // uuid(1) ranks 1st dense-only, uuid(2) ranks 1st sparse-only; with
        // equal arm weights their rrf_score ties exactly, so the tie-break
        // must prefer the entry carrying a raw dense score.
        let dense = vec![(uuid(1), 0.5)];
        let sparse = vec![(uuid(2), 10.0)];
        let fused = rrf_fuse(&dense, &sparse, 60.0, 0.5, 0.5);
        assert!((fused[0].1.rrf_score - fused[1].1.rrf_score).abs() < 1e-12);
        assert_eq!(fused[0].0, uuid(1));
    }

    #[tokio::test]
    async fn test_ensure_collection_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVectorStore::open(dir.path()).expect("open");
        store.ensure_collection("ctx_test", 8).await.expect("first ensure");
        let result = store.ensure_collection("ctx_test", 16).await;
        assert!(matches!(result, Err(RetrievalError::Consistency { .. })));
    }

    #[tokio::test]
    async fn test_ensure_collection_is_idempotent_for_matching_dimensions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVectorStore::open(dir.path()).expect("open");
        store.ensure_collection("ctx_test", 8).await.expect("first ensure");
        store.ensure_collection("ctx_test", 8).await.expect("second ensure");
    }
}
