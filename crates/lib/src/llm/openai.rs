//! OpenAI-compatible client: /v1/chat/completions, /v1/edits and /v1/images/generations.

use crate::config::ProviderConfig;
use crate::llm::{Completion, ImageSet, ProviderError, ResponseProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client for an OpenAI-compatible provider. Each call is bounded by the configured timeout.
#[derive(Clone)]
pub struct OpenAiClient {
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    edit_model: String,
    image_count: u32,
    image_size: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    /// Build from provider config. `api_key` is passed separately so env overrides apply.
    pub fn new(config: &ProviderConfig, api_key: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("provider: client builder failed ({}), using defaults", e);
                reqwest::Client::new()
            });
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            chat_model: config.chat_model.clone(),
            edit_model: config.edit_model.clone(),
            image_count: config.image_count.max(1),
            image_size: config.image_size.clone(),
            client,
        }
    }

    /// POST `body` as JSON to `{base_url}/{path}` and decode the response.
    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ProviderError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(ProviderError::NotConfigured("provider api key"))?;
        let url = format!("{}/{}", self.base_url, path);
        let res = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }
        Ok(res.json().await?)
    }

    fn chat_request(&self, text: &str) -> ChatRequest {
        ChatRequest {
            model: self.chat_model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: text.to_string(),
            }],
            stop: stop_sequence(text).map(str::to_string),
        }
    }
}

/// Stop sequence for prompts that use a delimiter convention; `###` wins over `"""`.
fn stop_sequence(text: &str) -> Option<&'static str> {
    if text.contains("###") {
        Some("###")
    } else if text.contains("\"\"\"") {
        Some("\"\"\"")
    } else {
        None
    }
}

#[async_trait]
impl ResponseProvider for OpenAiClient {
    async fn converse(&self, text: &str) -> Result<Completion, ProviderError> {
        log::debug!("provider: chat completion ({} chars)", text.len());
        let res: ChoicesResponse = self
            .post("v1/chat/completions", &self.chat_request(text))
            .await?;
        Ok(res.into_completion())
    }

    async fn revise_with_instruction(
        &self,
        instruction: &str,
        text: &str,
    ) -> Result<Completion, ProviderError> {
        let body = EditRequest {
            model: self.edit_model.clone(),
            input: text.to_string(),
            instruction: instruction.to_string(),
        };
        let res: ChoicesResponse = self.post("v1/edits", &body).await?;
        Ok(res.into_completion())
    }

    async fn generate_images(&self, prompt: &str) -> Result<ImageSet, ProviderError> {
        let body = ImageRequest {
            prompt: prompt.to_string(),
            n: self.image_count,
            size: self.image_size.clone(),
        };
        let res: ImageResponse = self.post("v1/images/generations", &body).await?;
        Ok(ImageSet {
            urls: res
                .data
                .into_iter()
                .filter_map(|d| d.url)
                .filter(|u| !u.is_empty())
                .collect(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<String>,
}

#[derive(Debug, Serialize)]
struct EditRequest {
    model: String,
    input: String,
    instruction: String,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    prompt: String,
    n: u32,
    size: String,
}

/// Chat completions carry `message.content`; edits carry `text`.
#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoicesResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

impl ChoicesResponse {
    fn into_completion(self) -> Completion {
        Completion {
            choices: self
                .choices
                .into_iter()
                .filter_map(|c| c.message.map(|m| m.content).or(c.text))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}
