//! The embedder collaborator (`spec.md` §6).
//!
//! This module provides the trait contract for turning text into vectors.
//! The core never embeds anything itself — it only calls through
//! [`Embedder`]. A [`NullEmbedder`] test double is included for tests and
//! examples that don't need real embeddings.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Vector;

/// Embedder service trait.
///
/// Implementations must be `Send + Sync`. Returned vectors are expected to
/// be unit-normalized; an empty input string maps to the zero vector of the
/// correct dimension, matching `spec.md` §6's embedder contract.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds a single piece of text.
    async fn embed(&self, text: &str) -> Result<Vector>;

    /// Embeds a batch of texts. Implementations should override this when
    /// the underlying provider has a cheaper batch call; the default just
    /// calls [`Embedder::embed`] sequentially.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vector>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// The dimension of vectors this embedder produces.
    fn dimension(&self) -> usize;
}

/// A deterministic test double: every non-empty string embeds to a
/// fixed-dimension vector derived from its byte length, the empty string
/// embeds to the zero vector.
pub struct NullEmbedder {
    dimension: usize,
}

impl NullEmbedder {
    /// Creates a null embedder that reports `dimension`-length vectors.
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed(&self, text: &str) -> Result<Vector> {
        if text.is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }
        let seed = text.len() as f32;
        let mut v: Vector = (0..self.dimension)
            .map(|i| ((i as f32 + seed).sin()))
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
