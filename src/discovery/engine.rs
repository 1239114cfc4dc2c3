//! Ranking pipeline and indexing queue

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::embedding::{Embedder, cosine_similarity, tokenize};
use super::enhance::{EnhanceCandidate, ProviderKind, enhancement_boosts, total_boost};
use crate::cache::{EmbeddingEntry, EmbeddingStore, content_hash};
use crate::fqtn::Fqtn;
use crate::protocol::Tool;
use crate::{Error, Result};

/// Weight of the usage-frequency boost
const USAGE_BOOST_WEIGHT: f64 = 0.05;

/// Indexing queue capacity; senders await when the buffer is full
const INDEX_QUEUE_CAPACITY: usize = 256;

/// One candidate the engine may rank
#[derive(Debug, Clone)]
pub struct ToolCandidate {
    /// Canonical tool identity
    pub fqtn: Fqtn,
    /// Tool description (empty string when the provider gave none)
    pub description: String,
    /// Inferred provider kind
    pub kind: ProviderKind,
    /// Content hash of the tool metadata
    pub tool_hash: String,
    /// Input schema, forwarded verbatim in detailed results
    pub input_schema: Option<Value>,
}

impl ToolCandidate {
    /// Build a candidate from a cached tool
    #[must_use]
    pub fn from_tool(provider: &str, kind: ProviderKind, tool: &Tool) -> Self {
        Self {
            fqtn: Fqtn::new(provider, &tool.name),
            description: tool.description.clone().unwrap_or_default(),
            kind,
            tool_hash: content_hash(tool),
            input_schema: Some(tool.input_schema.clone()),
        }
    }

    /// The text the embedder sees for this tool
    #[must_use]
    pub fn embedding_text(&self) -> String {
        format!("{} {}", self.fqtn.tool, self.description)
    }
}

/// Options for one `find` invocation
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Maximum results per page
    pub limit: usize,
    /// 1-based page
    pub page: usize,
    /// Include input schemas
    pub detailed: bool,
    /// Override of the base similarity threshold
    pub confidence_threshold: Option<f64>,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: 5,
            page: 1,
            detailed: false,
            confidence_threshold: None,
        }
    }
}

/// One ranked result
#[derive(Debug, Clone, Serialize)]
pub struct RankedTool {
    /// Canonical FQTN
    pub fqtn: String,
    /// Tool description
    pub description: String,
    /// Final confidence (0..1)
    pub confidence: f64,
    /// Reasons attached by the enhancement layer
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    /// Input schema (detailed mode)
    #[serde(rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// A unit of indexing work: one provider's tools
#[derive(Debug)]
pub struct IndexJob {
    /// Owning provider
    pub provider: String,
    /// Inferred provider kind
    pub kind: ProviderKind,
    /// Tools to embed
    pub tools: Vec<Tool>,
}

/// Semantic discovery engine
pub struct DiscoveryEngine {
    embedder: Arc<dyn Embedder>,
    embeddings: Arc<EmbeddingStore>,
    usage: UsageTracker,
    base_threshold: f64,
    index_tx: mpsc::Sender<IndexJob>,
    index_rx: parking_lot::Mutex<Option<mpsc::Receiver<IndexJob>>>,
    /// Jobs indexed so far, for observability
    indexed_jobs: AtomicU64,
}

impl DiscoveryEngine {
    /// Create an engine over the given embedder and embedding store.
    ///
    /// Indexing work queued before [`DiscoveryEngine::spawn_indexer`] runs
    /// buffers in a bounded FIFO and drains in call order once the drainer
    /// starts, which keeps rankings deterministic.
    #[must_use]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        embeddings: Arc<EmbeddingStore>,
        data_dir: &Path,
        base_threshold: f64,
    ) -> Self {
        let (index_tx, index_rx) = mpsc::channel(INDEX_QUEUE_CAPACITY);
        Self {
            embedder,
            embeddings,
            usage: UsageTracker::new(data_dir),
            base_threshold,
            index_tx,
            index_rx: parking_lot::Mutex::new(Some(index_rx)),
            indexed_jobs: AtomicU64::new(0),
        }
    }

    /// Queue a provider's tools for embedding. Awaits only when the buffer
    /// is full.
    ///
    /// # Errors
    ///
    /// Returns an error if the indexing task has shut down.
    pub async fn queue_index(&self, job: IndexJob) -> Result<()> {
        self.index_tx
            .send(job)
            .await
            .map_err(|_| Error::Internal("indexing task is gone".to_string()))
    }

    /// Start the single drainer task. Jobs are processed strictly in the
    /// order they were queued.
    pub fn spawn_indexer(self: &Arc<Self>) {
        let Some(mut rx) = self.index_rx.lock().take() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let batch: Vec<(Fqtn, EmbeddingEntry)> = job
                    .tools
                    .iter()
                    .map(|tool| {
                        let candidate = ToolCandidate::from_tool(&job.provider, job.kind, tool);
                        let text = candidate.embedding_text();
                        let entry = EmbeddingEntry {
                            vector: engine.embedder.embed(&text),
                            features: engine.embedder.features(&text),
                            provider: job.provider.clone(),
                            tool_hash: candidate.tool_hash,
                        };
                        (candidate.fqtn, entry)
                    })
                    .collect();

                let count = batch.len();
                if let Err(e) = engine.embeddings.put_batch(batch).await {
                    warn!(provider = %job.provider, error = %e, "Failed to persist embeddings");
                } else {
                    debug!(provider = %job.provider, tools = count, "Provider indexed");
                }
                engine.indexed_jobs.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    /// Record a tool invocation for the usage-frequency boost
    pub fn record_use(&self, fqtn: &Fqtn) {
        self.usage.record(&fqtn.canonical());
    }

    /// Persist usage counts
    ///
    /// # Errors
    ///
    /// Returns an error if the usage file cannot be written.
    pub async fn save_usage(&self) -> Result<()> {
        self.usage.save().await
    }

    /// Load persisted usage counts
    pub async fn load_usage(&self) {
        self.usage.load().await;
    }

    /// The sentinel returned while the corpus is still empty
    #[must_use]
    pub fn indexing_placeholder() -> RankedTool {
        RankedTool {
            fqtn: "ncp:discovery".to_string(),
            description: "Tool indexing is in progress; retry this search shortly for full \
                          results."
                .to_string(),
            confidence: 0.0,
            reasons: vec!["indexing in progress".to_string()],
            input_schema: None,
        }
    }

    /// Rank candidates for a query.
    ///
    /// Pipeline per the scoring contract: dense retrieval with enhancement
    /// boosts, then the lexical fallback when no dense candidate qualifies,
    /// then the indexing-in-progress sentinel for an empty corpus.
    /// Deterministic for a fixed corpus and usage history.
    pub async fn rank(
        &self,
        query: &str,
        candidates: &[ToolCandidate],
        options: &FindOptions,
    ) -> Vec<RankedTool> {
        if candidates.is_empty() {
            return vec![Self::indexing_placeholder()];
        }

        let threshold = options.confidence_threshold.unwrap_or(self.base_threshold);
        let corpus = self.embeddings.all().await;

        let mut scored = self.dense_pass(query, candidates, &corpus, threshold);
        if scored.is_empty() {
            scored = self.lexical_pass(query, candidates, &corpus);
        }
        if scored.is_empty() {
            return Vec::new();
        }

        // Final score desc, enhancement boost desc, FQTN asc
        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.boost.total_cmp(&a.boost))
                .then_with(|| a.fqtn.cmp(&b.fqtn))
        });

        let start = options.page.saturating_sub(1) * options.limit;
        scored
            .into_iter()
            .skip(start)
            .take(options.limit)
            .map(|s| RankedTool {
                fqtn: s.fqtn,
                description: s.description,
                confidence: s.score.clamp(0.0, 1.0),
                reasons: s.reasons,
                input_schema: if options.detailed { s.input_schema } else { None },
            })
            .collect()
    }

    /// Dense retrieval: cosine similarity over cached embeddings.
    ///
    /// A candidate qualifies when its similarity clears the threshold, or
    /// when the enhancement layer vouches for it. The second path is what
    /// bridges implicit domains: a query about committing changes carries no
    /// token a shell tool shares, yet the capability rules know a shell can
    /// run version control.
    fn dense_pass(
        &self,
        query: &str,
        candidates: &[ToolCandidate],
        corpus: &BTreeMap<String, EmbeddingEntry>,
        threshold: f64,
    ) -> Vec<Scored> {
        let query_vector = self.embedder.embed(query);
        let mut scored = Vec::new();

        for candidate in candidates {
            let Some(entry) = corpus.get(&candidate.fqtn.canonical()) else {
                continue;
            };
            if entry.tool_hash != candidate.tool_hash {
                // Stale embedding; the indexer will regenerate it
                continue;
            }
            let similarity = cosine_similarity(&query_vector, &entry.vector);
            let result = self.finish_scoring(query, candidate, similarity);
            if similarity >= threshold || result.boost > 0.0 {
                scored.push(result);
            }
        }

        scored
    }

    /// Lexical fallback: token overlap with length normalization
    fn lexical_pass(
        &self,
        query: &str,
        candidates: &[ToolCandidate],
        corpus: &BTreeMap<String, EmbeddingEntry>,
    ) -> Vec<Scored> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }
        let query_lower = query.to_lowercase();
        let mut scored = Vec::new();

        for candidate in candidates {
            // Reuse cached features when present, tokenize otherwise
            let tokens = corpus
                .get(&candidate.fqtn.canonical())
                .map_or_else(
                    || tokenize(&candidate.embedding_text()),
                    |e| e.features.tokens.clone(),
                );
            if tokens.is_empty() {
                continue;
            }

            let overlap = query_tokens
                .iter()
                .filter(|qt| tokens.contains(*qt))
                .count();
            #[allow(clippy::cast_precision_loss)]
            let mut relevance = overlap as f64 / (tokens.len() as f64).sqrt();
            if candidate.fqtn.tool.to_lowercase().contains(&query_lower) {
                relevance += 0.3;
            }
            let result = self.finish_scoring(query, candidate, relevance);
            if relevance > 0.0 || result.boost > 0.0 {
                scored.push(result);
            }
        }

        scored
    }

    /// Add enhancement and usage boosts onto a base relevance score
    fn finish_scoring(&self, query: &str, candidate: &ToolCandidate, base: f64) -> Scored {
        let boosts = enhancement_boosts(
            query,
            &EnhanceCandidate {
                tool_name: &candidate.fqtn.tool,
                description: &candidate.description,
                kind: candidate.kind,
            },
        );
        let boost = total_boost(&boosts);

        let uses = self.usage.count(&candidate.fqtn.canonical());
        #[allow(clippy::cast_precision_loss)]
        let usage_boost = if uses > 0 {
            ((uses + 1) as f64).log2() * USAGE_BOOST_WEIGHT
        } else {
            0.0
        };

        Scored {
            fqtn: candidate.fqtn.canonical(),
            description: candidate.description.clone(),
            score: base + boost + usage_boost,
            boost,
            reasons: boosts.iter().map(|b| b.reason.to_string()).collect(),
            input_schema: candidate.input_schema.clone(),
        }
    }
}

/// Intermediate scoring record
struct Scored {
    fqtn: String,
    description: String,
    score: f64,
    boost: f64,
    reasons: Vec<String>,
    input_schema: Option<Value>,
}

/// Usage counts persisted in `usage.json`
struct UsageTracker {
    counts: DashMap<String, AtomicU64>,
    path: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct UsageEntry {
    fqtn: String,
    count: u64,
}

impl UsageTracker {
    fn new(data_dir: &Path) -> Self {
        Self {
            counts: DashMap::new(),
            path: data_dir.join("usage.json"),
        }
    }

    fn record(&self, fqtn: &str) {
        self.counts
            .entry(fqtn.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn count(&self, fqtn: &str) -> u64 {
        self.counts
            .get(fqtn)
            .map_or(0, |e| e.load(Ordering::Relaxed))
    }

    async fn load(&self) {
        let Ok(content) = tokio::fs::read_to_string(&self.path).await else {
            return;
        };
        let Ok(entries) = serde_json::from_str::<Vec<UsageEntry>>(&content) else {
            return;
        };
        for entry in entries {
            self.counts.insert(entry.fqtn, AtomicU64::new(entry.count));
        }
    }

    async fn save(&self) -> Result<()> {
        let entries: Vec<UsageEntry> = self
            .counts
            .iter()
            .map(|e| UsageEntry {
                fqtn: e.key().clone(),
                count: e.value().load(Ordering::Relaxed),
            })
            .collect();
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
