//! Generative response provider: trait used by the dispatcher and the OpenAI-compatible client.
//!
//! Calls are never retried; a failure is reported to the end user by the caller.

mod openai;

pub use openai::OpenAiClient;

use async_trait::async_trait;

/// Text completion: one entry per returned choice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub choices: Vec<String>,
}

/// Generated images, as URLs hosted by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageSet {
    pub urls: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(reqwest::Error),
    #[error("provider api error: {status} {body}")]
    Api { status: u16, body: String },
    #[error("provider not configured: {0}")]
    NotConfigured(&'static str),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Request(e.without_url())
    }
}

#[async_trait]
pub trait ResponseProvider: Send + Sync {
    /// Plain conversational completion.
    async fn converse(&self, text: &str) -> Result<Completion, ProviderError>;

    /// Revise `text` following `instruction`.
    async fn revise_with_instruction(
        &self,
        instruction: &str,
        text: &str,
    ) -> Result<Completion, ProviderError>;

    /// Generate images for a prompt.
    async fn generate_images(&self, prompt: &str) -> Result<ImageSet, ProviderError>;
}
