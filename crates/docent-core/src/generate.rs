//! Answer-generation capability trait.
//!
//! Concrete backends (Ollama, OpenAI-compatible chat) live in the app
//! crate. Implementations receive the fused context and conversation
//! history and are responsible for turning them into a prompt, usually via
//! [`PromptBuilder`](crate::prompt::PromptBuilder).

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::fusion::ContextPayload;
use crate::models::ChatMessage;

/// Everything a generator needs for one answer.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub question: String,
    pub context: ContextPayload,
    pub history: Vec<ChatMessage>,
    /// Overrides the configured model when set.
    pub model: Option<String>,
}

/// Incremental answer text.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Produces the complete answer.
    async fn generate(&self, request: GenerationRequest) -> Result<String>;

    /// Produces the answer as a stream of text fragments.
    async fn generate_stream(&self, request: GenerationRequest) -> Result<TokenStream>;

    /// `true` if the backend is reachable.
    async fn health_check(&self) -> bool;

    /// Models the backend can serve.
    async fn list_models(&self) -> Result<Vec<String>>;
}
