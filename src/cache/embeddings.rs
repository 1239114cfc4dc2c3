//! Embedding cache (`embeddings.db`)
//!
//! Maps canonical FQTNs to dense vectors plus the lexical feature bundle
//! the fallback ranker uses. Entries are valid only while their recorded
//! `tool_hash` matches the metadata cache; stale entries are dropped and
//! regenerated on the next indexing pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::fqtn::Fqtn;
use crate::{Error, Result};

/// Lexical features derived from a tool's name and description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBundle {
    /// Lowercased word tokens
    pub tokens: Vec<String>,
    /// Adjacent-token bigrams, space-joined
    pub bigrams: Vec<String>,
}

/// One cached embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingEntry {
    /// Dense vector, L2-normalized
    pub vector: Vec<f32>,
    /// Derived lexical features
    pub features: FeatureBundle,
    /// Owning provider
    pub provider: String,
    /// Hash of the tool metadata this embedding was computed from
    pub tool_hash: String,
}

/// Persistent FQTN → embedding map with a single in-process writer.
pub struct EmbeddingStore {
    path: PathBuf,
    state: Mutex<BTreeMap<String, EmbeddingEntry>>,
}

impl EmbeddingStore {
    /// Open the store, loading `embeddings.db` if present.
    ///
    /// Legacy entries keyed by unprefixed tool names are normalized to the
    /// canonical `provider:tool` form using the entry's recorded provider.
    /// Writers only ever emit canonical keys.
    pub async fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join("embeddings.db");
        let raw: BTreeMap<String, EmbeddingEntry> = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "Embedding cache unparseable, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        let mut entries = BTreeMap::new();
        for (key, entry) in raw {
            let canonical = Fqtn::normalize_cached(&entry.provider, &key).canonical();
            entries.insert(canonical, entry);
        }

        Self {
            path,
            state: Mutex::new(entries),
        }
    }

    /// Store an embedding under its canonical FQTN and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn put(&self, fqtn: &Fqtn, entry: EmbeddingEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(fqtn.canonical(), entry);
        self.persist(&state).await
    }

    /// Store a batch of embeddings in one write.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn put_batch(&self, batch: Vec<(Fqtn, EmbeddingEntry)>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        for (fqtn, entry) in batch {
            state.insert(fqtn.canonical(), entry);
        }
        self.persist(&state).await
    }

    /// Fetch an embedding, but only if its recorded hash matches the
    /// current tool hash. A mismatch means the tool changed; the entry is
    /// left for the next indexing pass to overwrite.
    pub async fn get_validated(&self, fqtn: &Fqtn, tool_hash: &str) -> Option<EmbeddingEntry> {
        let state = self.state.lock().await;
        state
            .get(&fqtn.canonical())
            .filter(|e| e.tool_hash == tool_hash)
            .cloned()
    }

    /// Remove all embeddings belonging to a provider and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn remove_provider(&self, provider: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.len();
        state.retain(|_, entry| entry.provider != provider);
        if state.len() != before {
            self.persist(&state).await?;
        }
        Ok(())
    }

    /// Snapshot the whole corpus (for ranking)
    pub async fn all(&self) -> BTreeMap<String, EmbeddingEntry> {
        self.state.lock().await.clone()
    }

    /// Number of cached embeddings
    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    /// Whether the corpus is empty
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.is_empty()
    }

    async fn persist(&self, state: &BTreeMap<String, EmbeddingEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("db.tmp");
        let content =
            serde_json::to_string(state).map_err(|e| Error::CacheCorrupt(e.to_string()))?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(entries = state.len(), "Embedding cache persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(provider: &str, tool_hash: &str) -> EmbeddingEntry {
        EmbeddingEntry {
            vector: vec![0.6, 0.8],
            features: FeatureBundle {
                tokens: vec!["read".into(), "file".into()],
                bigrams: vec!["read file".into()],
            },
            provider: provider.to_string(),
            tool_hash: tool_hash.to_string(),
        }
    }

    #[tokio::test]
    async fn put_and_get_validated() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).await;
        let fqtn = Fqtn::new("fs", "read_file");

        store.put(&fqtn, entry("fs", "h1")).await.unwrap();
        assert!(store.get_validated(&fqtn, "h1").await.is_some());
        // Hash mismatch invalidates without deleting
        assert!(store.get_validated(&fqtn, "h2").await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn remove_provider_drops_only_its_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = EmbeddingStore::open(dir.path()).await;

        store
            .put(&Fqtn::new("fs", "read"), entry("fs", "h"))
            .await
            .unwrap();
        store
            .put(&Fqtn::new("shell", "run"), entry("shell", "h"))
            .await
            .unwrap();

        store.remove_provider("fs").await.unwrap();
        assert_eq!(store.len().await, 1);
        assert!(
            store
                .get_validated(&Fqtn::new("shell", "run"), "h")
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn legacy_unprefixed_keys_normalize_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut legacy = BTreeMap::new();
        legacy.insert("read_file".to_string(), entry("fs", "h1"));
        tokio::fs::write(
            dir.path().join("embeddings.db"),
            serde_json::to_string(&legacy).unwrap(),
        )
        .await
        .unwrap();

        let store = EmbeddingStore::open(dir.path()).await;
        let all = store.all().await;
        assert!(all.contains_key("fs:read_file"));
        assert!(!all.contains_key("read_file"));
    }

    #[tokio::test]
    async fn batch_put_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = EmbeddingStore::open(dir.path()).await;
            store
                .put_batch(vec![
                    (Fqtn::new("fs", "read"), entry("fs", "h")),
                    (Fqtn::new("fs", "write"), entry("fs", "h")),
                ])
                .await
                .unwrap();
        }
        let store = EmbeddingStore::open(dir.path()).await;
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn unparseable_store_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("embeddings.db"), "not json")
            .await
            .unwrap();
        let store = EmbeddingStore::open(dir.path()).await;
        assert!(store.is_empty().await);
    }
}
