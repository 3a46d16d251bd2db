use async_trait::async_trait;

use super::{l2_normalize, EmbeddingModel};
use crate::error::EmbedError;

/// Deterministic embedding stand-in: a seeded pseudo-random unit vector
/// derived from the text hash. Keeps the pipeline functional when no model
/// is reachable and makes test runs reproducible. The model id makes these
/// vectors unmistakable in persisted records.
pub struct HashEmbeddings {
    dimension: usize,
    model_id: String,
}

impl HashEmbeddings {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("hash-fallback-{}d", dimension),
        }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = md5::compute(text.as_bytes());
        let mut seed = u64::from_be_bytes([
            digest.0[0], digest.0[1], digest.0[2], digest.0[3],
            digest.0[4], digest.0[5], digest.0[6], digest.0[7],
        ]);
        // A zero seed would freeze the generator.
        if seed == 0 {
            seed = 0x9E37_79B9_7F4A_7C15;
        }

        let mut vector = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            seed = xorshift64star(seed);
            // Map the top 24 bits to [-0.5, 0.5).
            let unit = (seed >> 40) as f32 / (1u64 << 24) as f32;
            vector.push(unit - 0.5);
        }
        l2_normalize(&mut vector);
        vector
    }
}

fn xorshift64star(mut state: u64) -> u64 {
    state ^= state >> 12;
    state ^= state << 25;
    state ^= state >> 27;
    state.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

#[async_trait]
impl EmbeddingModel for HashEmbeddings {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.vector_for(text))
    }

    async fn embed_document(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        Ok(self.vector_for(text))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn batch_limit(&self) -> usize {
        // No remote round-trip, so batches are unbounded in practice.
        256
    }
}
