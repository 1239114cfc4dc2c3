//! Tool metadata cache (`metadata.json`)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{CACHE_VERSION, content_hash};
use crate::protocol::{Info, Prompt, Resource, Tool};
use crate::{Error, Result};

/// Top-level cache bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// Document version
    pub version: u32,
    /// Content hash of the profile this cache reflects
    pub profile_hash: String,
    /// When the cache was first created
    pub created_at: DateTime<Utc>,
    /// When the cache was last patched
    pub last_updated_at: DateTime<Utc>,
    /// Sum of per-provider tool counts
    pub total_tools: usize,
    /// Per-provider content hashes, for change detection
    pub per_provider_hash: BTreeMap<String, String>,
}

impl CacheMetadata {
    fn empty() -> Self {
        let now = Utc::now();
        Self {
            version: CACHE_VERSION,
            profile_hash: String::new(),
            created_at: now,
            last_updated_at: now,
            total_tools: 0,
            per_provider_hash: BTreeMap::new(),
        }
    }
}

/// Probed listings for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    /// Tools, raw provider-side names
    pub tools: Vec<Tool>,
    /// Resources
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Resource>,
    /// Prompts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<Prompt>,
    /// Server info from the initialize handshake
    #[serde(rename = "serverInfo", skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Info>,
    /// Content hash over tools + server info
    pub hash: String,
    /// Hash of the provider spec this entry was probed under; a spec change
    /// (new command, args, env) invalidates the entry
    #[serde(default)]
    pub spec_hash: String,
}

impl ProviderEntry {
    /// Build an entry, computing its content hash
    #[must_use]
    pub fn new(
        tools: Vec<Tool>,
        resources: Vec<Resource>,
        prompts: Vec<Prompt>,
        server_info: Option<Info>,
        spec_hash: String,
    ) -> Self {
        let hash = Self::compute_hash(&tools, server_info.as_ref());
        Self {
            tools,
            resources,
            prompts,
            server_info,
            hash,
            spec_hash,
        }
    }

    /// Content hash over the parts that invalidate embeddings
    #[must_use]
    pub fn compute_hash(tools: &[Tool], server_info: Option<&Info>) -> String {
        content_hash(&(tools, server_info))
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Number of cached providers
    pub mcp_count: usize,
    /// Total cached tools
    pub tool_count: usize,
    /// Whether `metadata.json` exists on disk
    pub metadata_exists: bool,
}

/// On-disk document shape
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataDocument {
    metadata: CacheMetadata,
    providers: BTreeMap<String, ProviderEntry>,
}

/// Tool metadata cache with patch-based updates.
///
/// All mutation goes through a single in-process writer lock; every write
/// lands atomically (temp file + rename), so readers only ever see the last
/// committed version.
pub struct MetadataStore {
    path: PathBuf,
    state: Mutex<MetadataDocument>,
}

impl MetadataStore {
    /// Open the store, loading `metadata.json` if present.
    ///
    /// Unparseable documents are treated as absent: the cache is rebuilt by
    /// re-probing rather than failing startup.
    pub async fn open(cache_dir: &Path) -> Self {
        let path = cache_dir.join("metadata.json");
        let document = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<MetadataDocument>(&content) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(error = %e, "Metadata cache unparseable, starting fresh");
                    MetadataDocument {
                        metadata: CacheMetadata::empty(),
                        providers: BTreeMap::new(),
                    }
                }
            },
            Err(_) => MetadataDocument {
                metadata: CacheMetadata::empty(),
                providers: BTreeMap::new(),
            },
        };
        Self {
            path,
            state: Mutex::new(document),
        }
    }

    /// Whether the stored `profile_hash` matches the given hash
    pub async fn validate_against(&self, profile_hash: &str) -> bool {
        let state = self.state.lock().await;
        !state.metadata.profile_hash.is_empty() && state.metadata.profile_hash == profile_hash
    }

    /// Merge one provider's probed listings into the cache and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn patch_add(&self, provider: &str, entry: ProviderEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .metadata
            .per_provider_hash
            .insert(provider.to_string(), entry.hash.clone());
        state.providers.insert(provider.to_string(), entry);
        Self::refresh_totals(&mut state);
        self.persist(&state).await
    }

    /// Remove one provider from the cache and persist.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn patch_remove(&self, provider: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.providers.remove(provider);
        state.metadata.per_provider_hash.remove(provider);
        Self::refresh_totals(&mut state);
        self.persist(&state).await
    }

    /// Commit the top-level profile hash. Called last, after all concurrent
    /// per-provider patches have settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn commit_profile_hash(&self, profile_hash: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.metadata.profile_hash = profile_hash.to_string();
        state.metadata.last_updated_at = Utc::now();
        self.persist(&state).await
    }

    /// Verify per-provider hash consistency; truncate corrupted entries.
    ///
    /// Returns the names of providers whose entries were dropped and need
    /// re-probing.
    pub async fn validate_and_repair(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut corrupted = Vec::new();

        for (name, entry) in &state.providers {
            let recomputed = ProviderEntry::compute_hash(&entry.tools, entry.server_info.as_ref());
            let recorded = state.metadata.per_provider_hash.get(name);
            if recorded != Some(&entry.hash) || recomputed != entry.hash {
                corrupted.push(name.clone());
            }
        }

        if !corrupted.is_empty() {
            for name in &corrupted {
                warn!(provider = %name, "Cache entry corrupt, truncating for re-probe");
                state.providers.remove(name);
                state.metadata.per_provider_hash.remove(name);
            }
            Self::refresh_totals(&mut state);
            self.persist(&state).await?;
        }

        Ok(corrupted)
    }

    /// Providers that need re-probing (absent from the cache, or cached
    /// under a different spec hash), plus cached providers no longer
    /// wanted. `wanted` maps provider name to its current spec hash.
    pub async fn diff_providers(&self, wanted: &BTreeMap<String, String>) -> CacheDiff {
        let state = self.state.lock().await;
        let mut stale: Vec<String> = Vec::new();
        for (name, spec_hash) in wanted {
            match state.providers.get(name) {
                Some(entry) if &entry.spec_hash == spec_hash => {}
                _ => stale.push(name.clone()),
            }
        }
        let removed: Vec<String> = state
            .providers
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        CacheDiff { stale, removed }
    }

    /// Snapshot one provider's cached entry
    pub async fn provider_entry(&self, provider: &str) -> Option<ProviderEntry> {
        self.state.lock().await.providers.get(provider).cloned()
    }

    /// Snapshot all cached entries
    pub async fn all_entries(&self) -> BTreeMap<String, ProviderEntry> {
        self.state.lock().await.providers.clone()
    }

    /// Cache statistics
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            mcp_count: state.providers.len(),
            tool_count: state.metadata.total_tools,
            metadata_exists: self.path.exists(),
        }
    }

    /// Current top-level metadata
    pub async fn metadata(&self) -> CacheMetadata {
        self.state.lock().await.metadata.clone()
    }

    fn refresh_totals(state: &mut MetadataDocument) {
        state.metadata.total_tools = state.providers.values().map(|e| e.tools.len()).sum();
        state.metadata.last_updated_at = Utc::now();
        state.metadata.version = CACHE_VERSION;
    }

    /// Write the document atomically
    async fn persist(&self, state: &MetadataDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| Error::CacheCorrupt(e.to_string()))?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(
            providers = state.providers.len(),
            tools = state.metadata.total_tools,
            "Metadata cache persisted"
        );
        Ok(())
    }
}

/// Result of diffing the cache against a wanted provider set
#[derive(Debug, Clone, Default)]
pub struct CacheDiff {
    /// Providers missing from the cache that need probing
    pub stale: Vec<String>,
    /// Cached providers no longer in the profile
    pub removed: Vec<String>,
}
