//! Dataset and result storage collaborators.

use crate::protocol::Tuple;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait DatasetStore: Send + Sync {
    async fn load(&self, dataset_id: &str) -> Result<Vec<Tuple>>;
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn store(&self, key: &str, bundle: &Value) -> Result<()>;
}

/// Rejects ids that would escape the store directory.
fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(anyhow!("invalid store key {:?}", key));
    }
    Ok(())
}

/// Datasets as `<root>/datasets/<id>.json` (an array of five-integer
/// arrays) and results as `<root>/results/<key>.json`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join("datasets").join(format!("{}.json", dataset_id))
    }

    pub fn result_path(&self, key: &str) -> PathBuf {
        self.root.join("results").join(format!("{}.json", key))
    }

    pub async fn put_dataset(&self, dataset_id: &str, tuples: &[Tuple]) -> Result<()> {
        check_key(dataset_id)?;
        let path = self.dataset_path(dataset_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let rows: Vec<[i32; 5]> = tuples.iter().map(Tuple::fields).collect();
        tokio::fs::write(&path, serde_json::to_vec(&rows)?)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    pub async fn get_result(&self, key: &str) -> Result<Value> {
        check_key(key)?;
        let path = self.result_path(key);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DatasetStore for FsStore {
    async fn load(&self, dataset_id: &str) -> Result<Vec<Tuple>> {
        check_key(dataset_id)?;
        let path = self.dataset_path(dataset_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading dataset {}", path.display()))?;
        let rows: Vec<[i32; 5]> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing dataset {}", path.display()))?;
        Ok(rows.into_iter().map(Tuple::from_fields).collect())
    }
}

#[async_trait]
impl ResultStore for FsStore {
    async fn store(&self, key: &str, bundle: &Value) -> Result<()> {
        check_key(key)?;
        let path = self.result_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(bundle)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(key, path = %path.display(), "stored measurements");
        Ok(())
    }
}

/// Shared in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    datasets: Arc<DashMap<String, Vec<Tuple>>>,
    results: Arc<DashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_dataset(&self, dataset_id: &str, tuples: Vec<Tuple>) {
        self.datasets.insert(dataset_id.to_string(), tuples);
    }

    pub fn result(&self, key: &str) -> Option<Value> {
        self.results.get(key).map(|v| v.clone())
    }
}

#[async_trait]
impl DatasetStore for MemoryStore {
    async fn load(&self, dataset_id: &str) -> Result<Vec<Tuple>> {
        self.datasets
            .get(dataset_id)
            .map(|d| d.clone())
            .ok_or_else(|| anyhow!("no dataset {:?}", dataset_id))
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn store(&self, key: &str, bundle: &Value) -> Result<()> {
        self.results.insert(key.to_string(), bundle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fs_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let tuples = vec![
            Tuple::from_fields([1, 0, 2, 3, 4]),
            Tuple::from_fields([-1, 1, 2, 3, 4]),
        ];
        store.put_dataset("small", &tuples).await.unwrap();
        assert_eq!(store.load("small").await.unwrap(), tuples);
        assert!(store.load("missing").await.is_err());

        store.store("sink_t1", &json!({"ok": true})).await.unwrap();
        assert_eq!(store.get_result("sink_t1").await.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_keys_cannot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.store("a/b", &json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.put_dataset("d", vec![Tuple::from_fields([1, 2, 3, 4, 5])]);
        assert_eq!(store.load("d").await.unwrap().len(), 1);
        store.store("k", &json!(1)).await.unwrap();
        assert_eq!(store.result("k"), Some(json!(1)));
    }
}
