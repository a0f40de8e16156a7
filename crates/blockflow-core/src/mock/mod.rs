//! Scriptable providers for tests and offline runs.
//!
//! This module is only available when the `test-utils` feature is enabled:
//!
//! ```toml
//! [dev-dependencies]
//! blockflow-core = { workspace = true, features = ["test-utils"] }
//! ```
//!
//! ```rust,ignore
//! use blockflow_core::mock::{MockCompletionProvider, MockReply};
//!
//! let provider = MockCompletionProvider::new()
//!     .with_rule("Summarize", [MockReply::text("not json"), MockReply::text(r#"{"summary":"ok"}"#)])
//!     .with_default_reply(MockReply::text("{}"));
//! ```

mod completion;
mod embedding;

pub use completion::{MockCompletionProvider, MockReply};
pub use embedding::MockEmbeddingProvider;

use crate::AiServices;
use crate::emb::EmbeddingService;
use crate::inference::CompletionService;

/// Builds [`AiServices`] backed by the given mocks.
pub fn mock_services(
    completion: MockCompletionProvider,
    embedding: MockEmbeddingProvider,
) -> AiServices {
    AiServices::new(
        CompletionService::from_provider(completion),
        EmbeddingService::from_provider(embedding),
    )
}
