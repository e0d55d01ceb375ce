//! OpenAI chat-completions text generator.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use streamdigest_shared::{OpenAiConfig, Result, ServiceError, api_key};

use crate::http;
use crate::traits::{TextGenerator, TextRequest};

const SERVICE: &str = "openai";

/// Transport timeout; the orchestrator applies its own per-call timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    n: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Text generator backed by the OpenAI chat-completions API.
#[derive(Debug, Clone)]
pub struct OpenAiTextGenerator {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiTextGenerator {
    /// Create a generator from config, reading the key from the named env var.
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        let key = api_key(&config.api_key_env, "OpenAI")?;
        Self::with_api_key(&config.base_url, &config.model, key)
    }

    pub fn with_api_key(
        base_url: &str,
        model: &str,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            client: http::build_client(HTTP_TIMEOUT)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    fn service(&self) -> &str {
        SERVICE
    }

    #[instrument(skip_all, fields(model = %self.model, temperature = request.temperature))]
    async fn generate(&self, request: &TextRequest) -> std::result::Result<String, ServiceError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            n: 1,
        };

        let response = http::send(
            SERVICE,
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(&self.api_key)
                .json(&body),
        )
        .await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| http::invalid_output(SERVICE, format!("unreadable response: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| http::invalid_output(SERVICE, "response contained no text"))?;

        debug!(chars = text.chars().count(), "completion received");
        Ok(text)
    }
}
