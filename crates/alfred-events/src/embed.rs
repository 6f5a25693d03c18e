// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Deterministic local text embedding.
//!
//! A sha256-bucketed bag-of-tokens projected into a fixed-dimension space and
//! L2-normalized.  Not a semantic model: the point is a stable cosine ranking
//! that is identical across processes and restarts, which is what retrieval
//! tests and the idempotent index upserts rely on.

use sha2::{Digest, Sha256};

pub const EMBED_DIM: usize = 64;

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Embed `text` into a unit-length `EMBED_DIM` vector.  Empty or
/// token-free input embeds to the zero vector.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut vec = vec![0f32; EMBED_DIM];
    for token in tokens(text) {
        let digest = Sha256::digest(token.as_bytes());
        let bucket = (u16::from_be_bytes([digest[0], digest[1]]) as usize) % EMBED_DIM;
        let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket] += sign;
    }
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}

/// Cosine similarity; zero vectors compare as 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Little-endian f32 packing for BLOB columns.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_deterministic() {
        assert_eq!(embed_text("use redis for caching"), embed_text("use redis for caching"));
    }

    #[test]
    fn identical_text_has_unit_cosine() {
        let v = embed_text("alpha beta gamma");
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn disjoint_text_scores_below_identical() {
        let a = embed_text("redis caching layer");
        let b = embed_text("redis caching layer");
        let c = embed_text("completely unrelated topic words");
        assert!(cosine(&a, &b) > cosine(&a, &c));
    }

    #[test]
    fn empty_text_embeds_to_zero() {
        let v = embed_text("   ");
        assert!(v.iter().all(|&x| x == 0.0));
        assert_eq!(cosine(&v, &embed_text("something")), 0.0);
    }

    #[test]
    fn blob_round_trip() {
        let v = embed_text("round trip");
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn case_and_punctuation_insensitive() {
        assert_eq!(embed_text("Use Redis!"), embed_text("use redis"));
    }
}
