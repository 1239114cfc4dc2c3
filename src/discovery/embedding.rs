//! Deterministic text embeddings
//!
//! Queries and the tool corpus go through the identical pipeline, so a
//! fixed corpus always produces the same rankings. The default embedder is
//! a hashed-feature model: unigram and bigram features are hashed into a
//! fixed-dimension vector with a sign bit and L2-normalized. Cosine
//! similarity over these vectors behaves like any dense retrieval backend,
//! and the trait seam lets a transformer-backed embedder replace it without
//! touching the engine.

use sha2::{Digest, Sha256};

use crate::cache::FeatureBundle;

/// Text embedding pipeline
pub trait Embedder: Send + Sync {
    /// Embed a text into a dense, L2-normalized vector
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Derive the lexical feature bundle for the same text
    fn features(&self, text: &str) -> FeatureBundle;

    /// Vector dimensionality
    fn dims(&self) -> usize;
}

/// Hashed-feature embedder
pub struct HashedEmbedder {
    dims: usize,
}

/// Default vector dimensionality
pub const DEFAULT_DIMS: usize = 256;

/// Weight of bigram features relative to unigrams
const BIGRAM_WEIGHT: f32 = 0.6;

impl HashedEmbedder {
    /// Create an embedder with the given dimensionality
    #[must_use]
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    /// Map one feature string to (dimension, signed weight)
    fn feature_slot(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let index = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize
            % self.dims;
        let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMS)
    }
}

impl Embedder for HashedEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let bundle = self.features(text);
        let mut vector = vec![0.0_f32; self.dims];

        for token in &bundle.tokens {
            let (index, sign) = self.feature_slot(token);
            vector[index] += sign;
        }
        for bigram in &bundle.bigrams {
            let (index, sign) = self.feature_slot(bigram);
            vector[index] += sign * BIGRAM_WEIGHT;
        }

        l2_normalize(&mut vector);
        vector
    }

    fn features(&self, text: &str) -> FeatureBundle {
        let tokens = tokenize(text);
        let bigrams = tokens
            .windows(2)
            .map(|pair| format!("{} {}", pair[0], pair[1]))
            .collect();
        FeatureBundle { tokens, bigrams }
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// Lowercased word tokens: splits on non-alphanumerics and camelCase
/// boundaries, drops single characters.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, tokens: &mut Vec<String>| {
        if current.len() > 1 {
            tokens.push(std::mem::take(current));
        } else {
            current.clear();
        }
    };

    let mut prev_lower = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                flush(&mut current, &mut tokens);
            }
            prev_lower = ch.is_lowercase() || ch.is_numeric();
            current.extend(ch.to_lowercase());
        } else {
            prev_lower = false;
            flush(&mut current, &mut tokens);
        }
    }
    flush(&mut current, &mut tokens);
    tokens
}

/// Cosine similarity between two vectors.
///
/// Vectors from [`Embedder::embed`] are already L2-normalized, so this is a
/// dot product; mismatched lengths or zero vectors score 0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    f64::from(dot / (norm_a * norm_b))
}

fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tokenize_splits_snake_and_camel_case() {
        assert_eq!(tokenize("read_file"), vec!["read", "file"]);
        assert_eq!(tokenize("readFile"), vec!["read", "file"]);
        assert_eq!(tokenize("HTTPRequest"), vec!["httprequest"]);
        assert_eq!(
            tokenize("Run a shell command!"),
            vec!["run", "shell", "command"]
        );
    }

    #[test]
    fn tokenize_drops_single_chars() {
        assert_eq!(tokenize("a b read"), vec!["read"]);
    }

    #[test]
    fn embedding_is_deterministic() {
        let embedder = HashedEmbedder::default();
        let a = embedder.embed("read a file from disk");
        let b = embedder.embed("read a file from disk");
        assert_eq!(a, b);
    }

    #[test]
    fn embedding_is_normalized() {
        let embedder = HashedEmbedder::default();
        let v = embedder.embed("search the web for news");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn identical_text_has_similarity_one() {
        let embedder = HashedEmbedder::default();
        let a = embedder.embed("write data to a file");
        let b = embedder.embed("write data to a file");
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_text_scores_above_unrelated() {
        let embedder = HashedEmbedder::default();
        let query = embedder.embed("read file contents");
        let related = embedder.embed("read the contents of a file on disk");
        let unrelated = embedder.embed("play a chess move against the engine");

        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated),
            "related tool should outrank unrelated tool"
        );
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let embedder = HashedEmbedder::default();
        let v = embedder.embed("");
        assert!(v.iter().all(|x| *x == 0.0));
        assert_eq!(cosine_similarity(&v, &v), 0.0);
    }

    #[test]
    fn features_include_bigrams() {
        let embedder = HashedEmbedder::default();
        let bundle = embedder.features("read file contents");
        assert_eq!(bundle.tokens, vec!["read", "file", "contents"]);
        assert_eq!(bundle.bigrams, vec!["read file", "file contents"]);
    }
}
