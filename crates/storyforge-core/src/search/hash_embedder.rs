//! Deterministic, offline embedder based on FNV-1a feature hashing.
//!
//! Each text contributes three feature families, hashed into `dimension`
//! signed buckets and L2-normalised:
//! - lowercase words (weight 2.0), so names and key nouns dominate
//! - adjacent word pairs (weight 1.0)
//! - character trigrams inside each word (weight 0.5), which carry
//!   inflections and scripts written without spaces
use async_trait::async_trait;

use super::embedder::{EmbedError, Embedder, EmbedderInfo};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const WORD_WEIGHT: f32 = 2.0;
const PAIR_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

// feature families hash into disjoint seeds so "ab" the word and "ab" the
// trigram land in different buckets
const WORD_SEED: u8 = b'w';
const PAIR_SEED: u8 = b'p';
const TRIGRAM_SEED: u8 = b't';

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    /// A zero `dimension` is clamped to 1.
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// Synchronous core of [`Embedder::embed`]. Text without any word
    /// characters yields the zero vector.
    #[must_use]
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .map(|w| w.trim_matches('\''))
            .filter(|w| !w.is_empty())
            .collect();

        for word in &words {
            self.add(&mut vector, WORD_SEED, word.as_bytes(), WORD_WEIGHT);
            let chars: Vec<char> = word.chars().collect();
            let mut buf = String::new();
            for window in chars.windows(3) {
                buf.clear();
                buf.extend(window);
                self.add(&mut vector, TRIGRAM_SEED, buf.as_bytes(), TRIGRAM_WEIGHT);
            }
        }
        for pair in words.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            self.add(&mut vector, PAIR_SEED, joined.as_bytes(), PAIR_WEIGHT);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn add(&self, vector: &mut [f32], seed: u8, feature: &[u8], weight: f32) {
        let h = fnv1a(seed, feature);
        let bucket = (h % self.dimension as u64) as usize;
        // high bit picks the sign so collisions tend to cancel
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn fnv1a(seed: u8, bytes: &[u8]) -> u64 {
    let mut hash = (FNV_OFFSET ^ u64::from(seed)).wrapping_mul(FNV_PRIME);
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: format!("fnv1a-words-{}", self.dimension),
            dimension: self.dimension,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.embed_sync(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::vector_index::cosine_similarity;

    #[tokio::test]
    async fn embeddings_are_unit_length() {
        let emb = HashEmbedder::new(64);
        let v = emb.embed("the lighthouse keeper").await.unwrap();
        assert_eq!(v.len(), 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
    }

    #[test]
    fn deterministic_and_case_insensitive() {
        let emb = HashEmbedder::new(64);
        assert_eq!(emb.embed_sync("storm"), emb.embed_sync("storm"));
        assert_eq!(emb.embed_sync("Mara"), emb.embed_sync("mara"));
    }

    #[test]
    fn shared_names_score_higher_than_unrelated_text() {
        let emb = HashEmbedder::new(256);
        let query = emb.embed_sync("Where did Mara hide the ship's log?");
        let related = emb.embed_sync("Mara tucked the ship's log under the lamp room floor.");
        let unrelated = emb.embed_sync("A duel in the throne room ended at dawn.");
        let near = cosine_similarity(&query, &related).unwrap();
        let far = cosine_similarity(&query, &unrelated).unwrap();
        assert!(near > far, "{near} <= {far}");
    }

    #[test]
    fn punctuation_only_is_zero_vector() {
        let emb = HashEmbedder::new(32);
        assert!(emb.embed_sync("").iter().all(|&x| x == 0.0));
        assert!(emb.embed_sync("... -- !!").iter().all(|&x| x == 0.0));
    }

    #[test]
    fn unspaced_scripts_embed() {
        let emb = HashEmbedder::new(64);
        let v = emb.embed_sync("灯塔守护者在黎明醒来");
        assert!(v.iter().any(|&x| x != 0.0));
    }

    #[test]
    fn zero_dimension_is_clamped() {
        assert_eq!(HashEmbedder::new(0).dimension(), 1);
        assert_eq!(HashEmbedder::new(256).info().dimension, 256);
    }
}
