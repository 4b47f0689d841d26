// src/store.rs
//! Load stage: upsert-by-key into the target document store.
//!
//! The store itself is a capability behind [`DocumentStore`]; the pipeline
//! only ever needs "replace the document stored under this key". Repeated
//! delivery of the same record therefore converges to one document, with
//! `_ingested_at` reflecting the most recent successful sync.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert the document under `key`, replacing any previous version.
    async fn upsert(&self, key: &str, doc: &Value) -> Result<()>;

    /// Target label for logs, e.g. `threatintel.otx_pulses_raw`.
    fn target(&self) -> String;
}

/// Outcome of loading one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub succeeded: usize,
    pub failed_ids: Vec<String>,
}

impl LoadResult {
    /// A batch where nothing landed is a systemic write failure, not a
    /// per-record one.
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0 && !self.failed_ids.is_empty()
    }
}

/// Upsert every document of a batch by its `_id`. One bad write is recorded
/// and the rest of the batch proceeds.
pub async fn load_batch(store: &dyn DocumentStore, docs: &[Value]) -> LoadResult {
    let mut out = LoadResult::default();
    for doc in docs {
        let Some(key) = doc.get("_id").and_then(Value::as_str) else {
            // enrich() always sets _id; a document without one cannot be keyed.
            tracing::warn!(target = %store.target(), "document without _id, counting as failed");
            out.failed_ids.push("<missing _id>".to_string());
            continue;
        };
        match store.upsert(key, doc).await {
            Ok(()) => out.succeeded += 1,
            Err(e) => {
                tracing::warn!(error = ?e, id = key, target = %store.target(), "upsert failed");
                out.failed_ids.push(key.to_string());
            }
        }
    }
    out
}

/// One JSON file per key under `{uri}/{database}/{collection}/`. The crate's
/// default local store, so a run works end-to-end without external services.
pub struct JsonDirStore {
    root: PathBuf,
    label: String,
}

impl JsonDirStore {
    pub fn new(uri: impl Into<PathBuf>, database: &str, collection: &str) -> Self {
        Self {
            root: uri.into().join(database).join(collection),
            label: format!("{database}.{collection}"),
        }
    }
}

#[async_trait]
impl DocumentStore for JsonDirStore {
    async fn upsert(&self, key: &str, doc: &Value) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let file = self.root.join(format!("{}.json", file_safe(key)));
        let tmp = file.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(doc).context("encoding document")?;
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &file)
            .await
            .with_context(|| format!("replacing {}", file.display()))?;
        Ok(())
    }

    fn target(&self) -> String {
        self.label.clone()
    }
}

fn file_safe(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// In-memory store for tests, with injectable per-id write failures.
#[derive(Default)]
pub struct MemoryStore {
    docs: std::sync::Mutex<HashMap<String, Value>>,
    fail_ids: std::sync::Mutex<HashSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert of `id` fail from now on.
    pub fn fail_on(&self, id: &str) {
        self.fail_ids.lock().unwrap().insert(id.to_string());
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        self.docs.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn upsert(&self, key: &str, doc: &Value) -> Result<()> {
        if self.fail_ids.lock().unwrap().contains(key) {
            anyhow::bail!("injected write failure for {key}");
        }
        self.docs
            .lock()
            .unwrap()
            .insert(key.to_string(), doc.clone());
        Ok(())
    }

    fn target(&self) -> String {
        "memory".to_string()
    }
}

/// Swallows every write; backs `--dry-run`-style invocations.
pub struct NoopStore;

#[async_trait]
impl DocumentStore for NoopStore {
    async fn upsert(&self, _key: &str, _doc: &Value) -> Result<()> {
        Ok(())
    }

    fn target(&self) -> String {
        "dry-run".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, rev: u32) -> Value {
        json!({"_id": id, "revision": rev})
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_key() {
        let store = MemoryStore::new();
        load_batch(&store, &[doc("a", 1)]).await;
        load_batch(&store, &[doc("a", 2)]).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a").unwrap()["revision"], 2);
    }

    #[tokio::test]
    async fn partial_failure_does_not_abort_batch() {
        let store = MemoryStore::new();
        store.fail_on("b");
        store.fail_on("d");

        let batch: Vec<Value> = ["a", "b", "c", "d", "e"]
            .iter()
            .map(|id| doc(id, 1))
            .collect();
        let result = load_batch(&store, &batch).await;

        assert_eq!(result.succeeded, 3);
        assert_eq!(result.failed_ids, vec!["b".to_string(), "d".to_string()]);
        assert!(!result.all_failed());
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn fully_failed_batch_is_systemic() {
        let store = MemoryStore::new();
        store.fail_on("a");
        let result = load_batch(&store, &[doc("a", 1)]).await;
        assert!(result.all_failed());

        // An empty batch is not.
        let empty = load_batch(&store, &[]).await;
        assert!(!empty.all_failed());
    }

    #[tokio::test]
    async fn json_dir_store_replaces_documents_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path(), "threatintel", "pulses");

        store.upsert("p/1", &doc("p/1", 1)).await.unwrap();
        store.upsert("p/1", &doc("p/1", 2)).await.unwrap();

        let path = dir.path().join("threatintel/pulses/p_1.json");
        let raw = std::fs::read_to_string(path).unwrap();
        let read: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(read["revision"], 2);
        assert_eq!(store.target(), "threatintel.pulses");
    }
}
