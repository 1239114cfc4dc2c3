//! Orchestrator
//!
//! Composition root: owns the pool, the health monitor, both caches, and
//! the discovery engine; mediates every externally observable operation.
//! Nothing a provider does may hang the client: `initialize` installs the
//! cached view and returns while reconciliation proceeds in the background,
//! and `find`/`run` consult health before touching a process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EmbeddingStore, MetadataStore, ProviderEntry, content_hash};
use crate::config::Settings;
use crate::discovery::{
    DiscoveryEngine, FindOptions, HashedEmbedder, IndexJob, RankedTool, ToolCandidate,
    classify_provider,
};
use crate::fqtn::Fqtn;
use crate::health::HealthMonitor;
use crate::profile::{Profile, ProfileStore, ProviderSpec};
use crate::protocol::{Prompt, Resource, ToolsCallResult};
use crate::provider::{ConnectionPool, normalize_call_result};
use crate::{Error, Result};

/// The gateway's composition root
pub struct Orchestrator {
    profile_name: String,
    profile: RwLock<Profile>,
    store: ProfileStore,
    pool: Arc<ConnectionPool>,
    health: Arc<HealthMonitor>,
    metadata: Arc<MetadataStore>,
    embeddings: Arc<EmbeddingStore>,
    engine: Arc<DiscoveryEngine>,
    settings: Settings,
    /// Background reconciliation in progress
    reconciling: AtomicBool,
    /// Cancels background tasks on cleanup
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Load the named profile and install the cached view.
    ///
    /// Returns as soon as the caches are loaded. When the cache's
    /// `profile_hash` matches the profile, no provider process is spawned;
    /// otherwise reconciliation runs in the background without blocking the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable local failures (unreadable
    /// profile document); provider failures never surface here.
    pub async fn initialize(
        data_dir: &Path,
        settings: Settings,
        profile_name: &str,
    ) -> Result<Arc<Self>> {
        let store = ProfileStore::new(data_dir);
        let profile = store.load(profile_name).await?;
        let profile_hash = profile.content_hash();

        let cache_dir = data_dir.join("cache");
        let metadata = Arc::new(MetadataStore::open(&cache_dir).await);
        let embeddings = Arc::new(EmbeddingStore::open(&cache_dir).await);

        let engine = Arc::new(DiscoveryEngine::new(
            Arc::new(HashedEmbedder::default()),
            Arc::clone(&embeddings),
            data_dir,
            settings.base_threshold,
        ));
        engine.load_usage().await;
        engine.spawn_indexer();

        let pool = Arc::new(ConnectionPool::new(
            settings.spawn_fanout,
            settings.spawn_timeout(),
            settings.call_timeout(),
        ));
        let health = Arc::new(HealthMonitor::new(
            settings.failure_threshold,
            settings.cooldown_cap(),
        ));

        let shutdown = CancellationToken::new();
        pool.spawn_idle_sweeper(settings.idle_threshold(), shutdown.clone());

        let orchestrator = Arc::new(Self {
            profile_name: profile_name.to_string(),
            profile: RwLock::new(profile),
            store,
            pool,
            health,
            metadata,
            embeddings,
            engine,
            settings,
            reconciling: AtomicBool::new(false),
            shutdown,
        });

        let corrupted = orchestrator.metadata.validate_and_repair().await?;
        let cache_valid =
            corrupted.is_empty() && orchestrator.metadata.validate_against(&profile_hash).await;

        if cache_valid {
            info!(
                profile = profile_name,
                tools = orchestrator.metadata.stats().await.tool_count,
                "Warm start from cache"
            );
            orchestrator.backfill_embeddings().await;
        } else {
            info!(profile = profile_name, "Cache mismatch, reconciling in background");
            let background = Arc::clone(&orchestrator);
            orchestrator.reconciling.store(true, Ordering::Relaxed);
            tokio::spawn(async move {
                background.reconcile().await;
                background.reconciling.store(false, Ordering::Relaxed);
            });
        }

        Ok(orchestrator)
    }

    /// Whether background reconciliation is still running
    #[must_use]
    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::Relaxed)
    }

    /// Profile name this orchestrator serves
    #[must_use]
    pub fn profile_name(&self) -> &str {
        &self.profile_name
    }

    /// Queue index jobs for cached tools whose embeddings are missing.
    ///
    /// Covers the warm-metadata, cold-embeddings case (embeddings.db
    /// deleted or invalidated) without any provider probe.
    async fn backfill_embeddings(&self) {
        let entries = self.metadata.all_entries().await;
        let corpus = self.embeddings.all().await;
        for (provider, entry) in entries {
            let Some(spec) = self.spec_of(&provider) else {
                continue;
            };
            let kind = classify_provider(&provider, &spec.command, &spec.args);
            let missing: Vec<_> = entry
                .tools
                .iter()
                .filter(|tool| {
                    let key = Fqtn::new(&provider, &tool.name).canonical();
                    corpus
                        .get(&key)
                        .is_none_or(|e| e.tool_hash != content_hash(tool))
                })
                .cloned()
                .collect();
            if missing.is_empty() {
                continue;
            }
            debug!(provider = %provider, tools = missing.len(), "Backfilling embeddings");
            let job = IndexJob {
                provider: provider.clone(),
                kind,
                tools: missing,
            };
            if self.engine.queue_index(job).await.is_err() {
                break;
            }
        }
    }

    /// Bring the cache in line with the profile: probe stale providers
    /// concurrently under the spawn fan-out, patch per provider as each
    /// finishes, drop removed providers, and commit the profile hash last.
    async fn reconcile(&self) {
        let (profile_hash, wanted) = {
            let profile = self.profile.read();
            let wanted: BTreeMap<String, String> = profile
                .providers()
                .iter()
                .map(|(name, spec)| (name.clone(), content_hash(spec)))
                .collect();
            (profile.content_hash(), wanted)
        };

        let diff = self.metadata.diff_providers(&wanted).await;

        for removed in &diff.removed {
            if let Err(e) = self.evict_provider(removed).await {
                warn!(provider = %removed, error = %e, "Failed to evict removed provider");
            }
        }

        let probes = diff.stale.iter().map(|name| {
            let name = name.clone();
            async move {
                let outcome = self.probe_and_patch(&name).await;
                (name, outcome)
            }
        });

        for (name, outcome) in join_all(probes).await {
            match outcome {
                Ok(tools) => debug!(provider = %name, tools, "Provider probed and cached"),
                Err(e) => {
                    self.health.record_failure(&name, &e.to_string());
                    warn!(provider = %name, error = %e, "Probe failed during reconciliation");
                }
            }
        }

        if let Err(e) = self.metadata.commit_profile_hash(&profile_hash).await {
            warn!(error = %e, "Failed to commit profile hash");
        } else {
            info!(
                probed = diff.stale.len(),
                removed = diff.removed.len(),
                "Reconciliation complete"
            );
        }

        self.backfill_embeddings().await;
    }

    /// Probe one provider and patch the caches with its listings
    async fn probe_and_patch(&self, name: &str) -> Result<usize> {
        let spec = self
            .spec_of(name)
            .ok_or_else(|| Error::NotConfigured(name.to_string()))?;

        let connection = self.pool.ready(name, &spec, &self.shutdown.child_token()).await?;
        let (listings, server_info) = connection.probe(&self.shutdown.child_token()).await?;
        self.health.record_success(name);

        let kind = classify_provider(name, &spec.command, &spec.args);
        let tool_count = listings.tools.len();
        let entry = ProviderEntry::new(
            listings.tools.clone(),
            listings.resources,
            listings.prompts,
            server_info,
            content_hash(&spec),
        );
        self.metadata.patch_add(name, entry).await?;

        self.engine
            .queue_index(IndexJob {
                provider: name.to_string(),
                kind,
                tools: listings.tools,
            })
            .await?;

        Ok(tool_count)
    }

    /// Remove a provider's runtime and cached state
    async fn evict_provider(&self, name: &str) -> Result<()> {
        self.pool.remove(name).await;
        self.health.forget(name);
        self.metadata.patch_remove(name).await?;
        self.embeddings.remove_provider(name).await?;
        self.store.remove_schema(name).await;
        Ok(())
    }

    fn spec_of(&self, name: &str) -> Option<ProviderSpec> {
        self.profile.read().get(name).cloned()
    }

    // ------------------------------------------------------------------
    // find / run
    // ------------------------------------------------------------------

    /// Rank tools for a natural-language query.
    ///
    /// Serves from the cache: if at least one tool is cached, partial
    /// results return immediately; an empty corpus yields the
    /// indexing-in-progress sentinel instead of blocking.
    pub async fn find(&self, query: &str, options: &FindOptions) -> Vec<RankedTool> {
        let candidates = self.candidates().await;
        match tokio::time::timeout(
            self.settings.find_timeout(),
            self.engine.rank(query, &candidates, options),
        )
        .await
        {
            Ok(ranked) => ranked,
            Err(_) => {
                warn!(query, "find exceeded its wall-clock budget");
                Vec::new()
            }
        }
    }

    /// Candidates from cached metadata, restricted to healthy providers
    async fn candidates(&self) -> Vec<ToolCandidate> {
        let entries = self.metadata.all_entries().await;
        let profile = self.profile.read();
        let mut candidates = Vec::new();
        for (provider, entry) in entries {
            let Some(spec) = profile.get(&provider) else {
                continue;
            };
            if !self.health.is_routable(&provider) {
                continue;
            }
            let kind = classify_provider(&provider, &spec.command, &spec.args);
            for tool in &entry.tools {
                candidates.push(ToolCandidate::from_tool(&provider, kind, tool));
            }
        }
        candidates
    }

    /// Execute a tool by FQTN.
    ///
    /// `meta` is forwarded into the provider's `_meta` unchanged. Routing
    /// fails fast on providers in health cooldown without re-spawning them.
    ///
    /// # Errors
    ///
    /// `invalid_request` for malformed FQTNs, `not_configured` for unknown
    /// providers, `provider_unavailable` during cooldown, and the transport
    /// taxonomy (`call_timeout`, `protocol_violation`, `cancelled`, spawn
    /// errors) from the call itself.
    #[tracing::instrument(
        skip(self, arguments, meta, timeout_override, cancel),
        fields(
            tool = %fqtn_raw,
            request_id = %uuid::Uuid::new_v4()
        )
    )]
    pub async fn run(
        &self,
        fqtn_raw: &str,
        arguments: Value,
        meta: Option<Value>,
        timeout_override: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolsCallResult> {
        let fqtn = Fqtn::parse(fqtn_raw)?;

        let spec = self
            .spec_of(&fqtn.provider)
            .ok_or_else(|| Error::NotConfigured(fqtn.provider.clone()))?;

        if !self.health.is_routable(&fqtn.provider) {
            return Err(Error::ProviderUnavailable(fqtn.provider.clone()));
        }

        // A provider with a cached configuration schema and missing required
        // variables will refuse to start; say so instead of spawning it.
        if let Some(schema) = self.store.load_schema(&fqtn.provider).await {
            let missing: Vec<String> = schema
                .missing_required(&spec.env)
                .into_iter()
                .map(String::from)
                .collect();
            if !missing.is_empty() {
                return Err(Error::ConfigRequired {
                    provider: fqtn.provider.clone(),
                    missing,
                });
            }
        }

        let connection = self.pool.ready(&fqtn.provider, &spec, cancel).await.inspect_err(
            |e| {
                self.health.record_failure(&fqtn.provider, &e.to_string());
            },
        )?;

        let outcome = connection
            .call_tool(&fqtn.tool, arguments, meta, timeout_override, cancel)
            .await;

        match outcome {
            Ok(result) => {
                self.health.record_success(&fqtn.provider);
                self.engine.record_use(&fqtn);
                Ok(normalize_call_result(result))
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.health.record_failure(&fqtn.provider, &e.to_string());
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------

    /// Resources across all providers, FQTN-style attribution preserved in
    /// the resource name. Providers that failed to list are simply absent.
    pub async fn resources(&self) -> Vec<Resource> {
        let entries = self.metadata.all_entries().await;
        let profile = self.profile.read();
        entries
            .into_iter()
            .filter(|(provider, _)| profile.contains(provider))
            .flat_map(|(_, entry)| entry.resources)
            .collect()
    }

    /// Prompts across all providers
    pub async fn prompts(&self) -> Vec<Prompt> {
        let entries = self.metadata.all_entries().await;
        let profile = self.profile.read();
        let mut prompts = Vec::new();
        for (provider, entry) in entries {
            if !profile.contains(&provider) {
                continue;
            }
            for mut prompt in entry.prompts {
                prompt.name = Fqtn::new(&provider, &prompt.name).canonical();
                prompts.push(prompt);
            }
        }
        prompts
    }

    /// Find the provider owning a resource URI.
    ///
    /// Routes by longest prefix match over the aggregated resource URIs, so
    /// a request for a sub-URI reaches the provider that advertised the
    /// closest ancestor. An exact match is the longest possible prefix.
    pub async fn resource_owner(&self, uri: &str) -> Option<String> {
        let entries = self.metadata.all_entries().await;
        let mut best: Option<(usize, String)> = None;
        for (provider, entry) in entries {
            for resource in &entry.resources {
                if uri.starts_with(&resource.uri)
                    && best
                        .as_ref()
                        .is_none_or(|(len, _)| resource.uri.len() > *len)
                {
                    best = Some((resource.uri.len(), provider.clone()));
                }
            }
        }
        best.map(|(_, provider)| provider)
    }

    /// Proxy a raw provider request (resources/read, subscriptions).
    ///
    /// # Errors
    ///
    /// `not_configured` for unknown providers plus the transport taxonomy.
    pub async fn proxy_request(
        &self,
        provider: &str,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let spec = self
            .spec_of(provider)
            .ok_or_else(|| Error::NotConfigured(provider.to_string()))?;
        if !self.health.is_routable(provider) {
            return Err(Error::ProviderUnavailable(provider.to_string()));
        }
        let connection = self.pool.ready(provider, &spec, cancel).await?;
        let response = connection.proxy(method, params, cancel).await?;
        if let Some(error) = response.error {
            return Err(Error::Internal(error.message));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    // ------------------------------------------------------------------
    // Profile mutation (the internal add path)
    // ------------------------------------------------------------------

    /// Add a provider: persist the profile, then patch caches coherently.
    ///
    /// # Errors
    ///
    /// Rejects duplicates; persists nothing on validation failure.
    pub async fn add_provider(&self, name: &str, spec: ProviderSpec) -> Result<()> {
        {
            let mut profile = self.profile.write();
            profile.add(name.to_string(), spec)?;
        }
        let (snapshot, hash) = {
            let profile = self.profile.read();
            (profile.clone(), profile.content_hash())
        };
        self.store.save(&self.profile_name, &snapshot).await?;

        match self.probe_and_patch(name).await {
            Ok(tools) => info!(provider = name, tools, "Provider added"),
            Err(e) => {
                // The profile keeps the entry; the provider is probed again
                // on the next reconciliation or call.
                self.health.record_failure(name, &e.to_string());
                warn!(provider = name, error = %e, "Provider added but probe failed");
            }
        }
        self.metadata.commit_profile_hash(&hash).await
    }

    /// Remove a provider: profile, pool, health, caches, schema.
    ///
    /// # Errors
    ///
    /// `not_configured` when absent.
    pub async fn remove_provider(&self, name: &str) -> Result<()> {
        {
            let mut profile = self.profile.write();
            profile.remove(name)?;
        }
        let (snapshot, hash) = {
            let profile = self.profile.read();
            (profile.clone(), profile.content_hash())
        };
        self.store.save(&self.profile_name, &snapshot).await?;
        self.evict_provider(name).await?;
        self.metadata.commit_profile_hash(&hash).await?;
        info!(provider = name, "Provider removed");
        Ok(())
    }

    /// Close all connections and flush dirty state
    pub async fn cleanup(&self) {
        self.shutdown.cancel();
        self.pool.close_all().await;
        if let Err(e) = self.engine.save_usage().await {
            warn!(error = %e, "Failed to persist usage counts");
        }
        info!("Orchestrator cleanup complete");
    }

    /// Child token tied to the orchestrator's shutdown
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
