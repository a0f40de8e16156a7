use crate::emb::EmbeddingService;
use crate::inference::CompletionService;

/// The pair of AI backends a workflow deployment talks to.
#[derive(Debug, Clone)]
pub struct AiServices {
    pub completion: CompletionService,
    pub embedding: EmbeddingService,
}

impl AiServices {
    /// Bundles a completion and an embedding service.
    pub fn new(completion: CompletionService, embedding: EmbeddingService) -> Self {
        Self {
            completion,
            embedding,
        }
    }
}
