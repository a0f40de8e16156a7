//! Text completion abstractions.
//!
//! A [`CompletionProvider`] turns a rendered prompt into model output. The
//! [`CompletionService`] wraps any provider with structured logging and is
//! what the workflow runtime holds on to.
//!
//! ```rust,ignore
//! use blockflow_core::inference::{CompletionRequest, CompletionService};
//!
//! let service = CompletionService::from_provider(my_provider);
//! let response = service.complete(&CompletionRequest::new("llama3.2", prompt)).await?;
//! ```

mod request;
mod response;
mod service;

pub use request::{CompletionRequest, ModelParameters};
pub use response::{CompletionResponse, TokenUsage};
pub use service::CompletionService;

use crate::ServiceHealth;
pub use crate::{Error, Result};

/// Trait for text completion backends.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Runs a single completion request.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Reports whether the backend is reachable.
    async fn health_check(&self) -> Result<ServiceHealth>;
}
