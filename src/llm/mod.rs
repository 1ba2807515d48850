pub mod openai;

pub use openai::{ChatOptions, ContentPart, LlmClient, LlmConfig, LlmError, LlmMessage};

use async_trait::async_trait;

/// A chat-completion backend that accepts inline images.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn complete(
        &self,
        messages: &[LlmMessage],
        options: &ChatOptions,
    ) -> Result<String, LlmError>;
}
