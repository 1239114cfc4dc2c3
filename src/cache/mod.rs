//! Incremental cache layer
//!
//! Two co-validated documents under `<data-dir>/cache/` keep cold starts
//! sub-second: `metadata.json` maps providers to their probed listings, and
//! `embeddings.db` maps fully-qualified tool names to dense vectors plus
//! derived lexical features. Both support per-provider patches so a profile
//! mutation never forces a full rebuild.

pub mod embeddings;
pub mod metadata;

use sha2::{Digest, Sha256};

pub use embeddings::{EmbeddingEntry, EmbeddingStore, FeatureBundle};
pub use metadata::{CacheMetadata, CacheStats, MetadataStore, ProviderEntry};

/// Current cache document version
pub const CACHE_VERSION: u32 = 2;

/// Content hash of an arbitrary serializable value (canonical JSON, SHA-256)
#[must_use]
pub fn content_hash<T: serde::Serialize>(value: &T) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}
