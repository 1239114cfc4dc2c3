//! Semantic discovery engine
//!
//! Ranks tools against a natural-language query. Dense retrieval over
//! embeddings runs first; a curated enhancement layer bridges user language
//! to provider capability; a lexical fallback catches queries the dense
//! layer misses. The whole pipeline is deterministic for a fixed corpus.

pub mod embedding;
pub mod engine;
pub mod enhance;

pub use embedding::{Embedder, HashedEmbedder, cosine_similarity};
pub use engine::{DiscoveryEngine, FindOptions, IndexJob, RankedTool, ToolCandidate};
pub use enhance::{Boost, ProviderKind, classify_provider, enhancement_boosts};
