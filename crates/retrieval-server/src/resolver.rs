//! Maps a dataset to the [`JobSource`] a worker should ingest from.
//!
//! The catalog's `datasets` row has no column for "where is the material",
//! since that's deployment-specific. The ingest endpoint records it here
//! the first time a dataset is targeted; workers read it back when they
//! claim a job for that dataset.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use retrieval_core::error::RetrievalResult;
use retrieval_core::jobs::{JobSource, JobSourceResolver};
use retrieval_core::types::Dataset;
use uuid::Uuid;

#[derive(Default)]
pub struct RegistryResolver {
    sources: Mutex<HashMap<Uuid, JobSource>>,
}

impl RegistryResolver {
    pub fn set(&self, dataset_id: Uuid, source: JobSource) {
        self.sources.lock().expect("registry lock poisoned").insert(dataset_id, source);
    }
}

#[async_trait]
impl JobSourceResolver for RegistryResolver {
    async fn resolve(&self, dataset: &Dataset) -> RetrievalResult<JobSource> {
        let sources = self.sources.lock().expect("registry lock poisoned");
        match sources.get(&dataset.id) {
            Some(source) => Ok(source.clone()),
            None => Err(retrieval_core::error::RetrievalError::NotFound { entity: format!("ingest source for dataset {}", dataset.id) }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use retrieval_core::types::{DatasetSource, DatasetVisibility};
    use std::path::PathBuf;

    fn dataset(id: Uuid) -> Dataset {
        Dataset { id, project_id: Uuid::new_v4(), name: "docs".into(), source: DatasetSource::Code, visibility: DatasetVisibility::Private, created_at: Utc::now() }
    }

    #[tokio::test]
    async fn test_unregistered_dataset_errors() {
        let resolver = RegistryResolver::default();
        let result = resolver.resolve(&dataset(Uuid::new_v4())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_registered_dataset_resolves() {
        let resolver = RegistryResolver::default();
        let ds = dataset(Uuid::new_v4());
        resolver.set(ds.id, JobSource::LocalPath(PathBuf::from("/tmp/repo")));
        let source = resolver.resolve(&ds).await.expect("resolve");
        match source {
            JobSource::LocalPath(path) => assert_eq!(path, PathBuf::from("/tmp/repo")),
            _ => panic!("expected local path"),
        }
    }
}
