use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::emb::{EmbeddingProvider, EmbeddingRequest, EmbeddingResponse};
use crate::{Error, ErrorKind, Result, ServiceHealth};

const DEFAULT_DIMENSIONS: usize = 64;
const MOCK_MODEL: &str = "mock-embedding";

#[derive(Debug, Default)]
struct State {
    overrides: HashMap<String, Vec<f32>>,
    failures: Vec<(String, ErrorKind)>,
    delay: Option<Duration>,
    calls: usize,
}

/// Deterministic embedding provider.
///
/// Each lowercase alphanumeric token is hashed into one of `dimensions`
/// buckets and the resulting bag-of-words vector is normalized, so texts
/// sharing vocabulary score higher under cosine similarity.
#[derive(Debug, Clone)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
    state: Arc<Mutex<State>>,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSIONS)
    }
}

impl MockEmbeddingProvider {
    /// Creates a provider producing vectors of the given size.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            state: Arc::default(),
        }
    }

    /// Returns a fixed vector whenever the input equals `text`.
    pub fn with_vector(self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.lock().overrides.insert(text.into(), vector);
        self
    }

    /// Fails every request whose input contains `needle`.
    pub fn with_failure(self, needle: impl Into<String>, kind: ErrorKind) -> Self {
        self.lock().failures.push((needle.into(), kind));
        self
    }

    /// Sleeps before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    /// Returns the number of requests served or failed.
    pub fn call_count(&self) -> usize {
        self.lock().calls
    }

    /// Returns the vector this provider produces for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.lock().overrides.get(text) {
            return vector.clone();
        }

        let mut vector = vec![0.0_f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0_u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            vector[index] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let (delay, failure) = {
            let mut state = self.lock();
            state.calls += 1;
            let failure = state
                .failures
                .iter()
                .find(|(needle, _)| request.input.contains(needle.as_str()))
                .map(|(_, kind)| *kind);
            (state.delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = failure {
            return Err(Error::new(kind).with_message("injected embedding failure"));
        }

        if request.input.trim().is_empty() {
            return Err(Error::invalid_input().with_message("cannot embed empty input"));
        }

        let model = request.model.as_deref().unwrap_or(MOCK_MODEL);
        Ok(EmbeddingResponse::new(
            request.request_id,
            model,
            self.vector_for(&request.input),
        ))
    }

    async fn health_check(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emb::cosine_similarity;

    #[tokio::test]
    async fn deterministic_and_normalized() {
        let provider = MockEmbeddingProvider::new(32);
        let first = provider.embed(&EmbeddingRequest::new("Reset my password")).await.unwrap();
        let second = provider.embed(&EmbeddingRequest::new("reset MY password")).await.unwrap();

        assert_eq!(first.embedding, second.embedding);
        assert_eq!(first.dimensions(), 32);
        assert!((first.magnitude() - 1.0).abs() < 1e-5);
        assert_eq!(provider.call_count(), 2);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let provider = MockEmbeddingProvider::new(256);
        let base = provider.vector_for("printer on floor three is jammed");
        let near = provider.vector_for("printer jammed on floor three");
        let far = provider.vector_for("quarterly budget review meeting");

        let near_score = cosine_similarity(&base, &near).unwrap();
        let far_score = cosine_similarity(&base, &far).unwrap_or(0.0);
        assert!(near_score > far_score);
    }

    #[tokio::test]
    async fn overrides_and_failures() {
        let provider = MockEmbeddingProvider::new(4)
            .with_vector("fixed", vec![1.0, 0.0, 0.0, 0.0])
            .with_failure("boom", ErrorKind::ServiceUnavailable);

        let fixed = provider.embed(&EmbeddingRequest::new("fixed")).await.unwrap();
        assert_eq!(fixed.embedding, vec![1.0, 0.0, 0.0, 0.0]);

        let err = provider
            .embed(&EmbeddingRequest::new("this goes boom"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);

        let err = provider.embed(&EmbeddingRequest::new("   ")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
