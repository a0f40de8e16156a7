//! Embedding response types and vector math.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Embedding produced for an [`EmbeddingRequest`](super::EmbeddingRequest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Identifier of the request this answers.
    pub request_id: Uuid,
    /// The embedding vector.
    pub embedding: Vec<f32>,
    /// Model that produced the vector.
    pub model: String,
}

impl EmbeddingResponse {
    /// Creates a new embedding response.
    pub fn new(request_id: Uuid, model: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            request_id,
            embedding,
            model: model.into(),
        }
    }

    /// Returns the dimensionality of the vector.
    pub fn dimensions(&self) -> usize {
        self.embedding.len()
    }

    /// Computes the L2 norm of the vector.
    pub fn magnitude(&self) -> f32 {
        magnitude(&self.embedding)
    }
}

fn magnitude(vector: &[f32]) -> f32 {
    vector.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Computes the cosine similarity between two vectors.
///
/// Returns `None` if the vectors differ in length or either has zero
/// magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(&x, &y)| x * y).sum();

    let magnitude_product = magnitude(a) * magnitude(b);
    if magnitude_product > 0.0 {
        Some(dot_product / magnitude_product)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_score_one() {
        let score = cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]).unwrap();
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let score = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(score.abs() < 1e-6);
    }

    #[test]
    fn mismatched_or_zero_vectors_have_no_score() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_none());
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[], &[]).is_none());
    }
}
