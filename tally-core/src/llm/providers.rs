// Chat-completion backends for inference batches.
//
// Anthropic's Messages API and OpenAI-style chat completions take the same
// request shape; they differ in endpoint, auth header, and reply layout.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmSection;
use crate::error::{LlmError, TallyError};
use crate::fetch::github::http_client;

use super::{LlmProvider, Price, TokenUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Wire dialect of a chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    /// OpenAI and any endpoint speaking its chat-completions protocol.
    OpenAi,
}

impl Dialect {
    pub fn parse(provider: &str) -> Option<Self> {
        match provider {
            "anthropic" => Some(Self::Anthropic),
            "openai" | "custom" => Some(Self::OpenAi),
            _ => None,
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAi => "https://api.openai.com",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Anthropic => "/v1/messages",
            Self::OpenAi => "/v1/chat/completions",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

/// One configured model behind a chat endpoint.
pub struct ChatProvider {
    client: Client,
    dialect: Dialect,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
    price: Price,
}

impl std::fmt::Debug for ChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatProvider")
            .field("dialect", &self.dialect)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ChatProvider {
    /// Build from `[llm]`, with the key already resolved.
    pub fn from_section(section: &LlmSection, api_key: String) -> crate::error::Result<Self> {
        let dialect = Dialect::parse(&section.provider).ok_or_else(|| {
            TallyError::Llm(LlmError::Config(format!(
                "Unknown provider: {}. Use: anthropic, openai, custom",
                section.provider
            )))
        })?;
        let base = section
            .base_url
            .as_deref()
            .unwrap_or(dialect.default_base_url())
            .trim_end_matches('/');

        let defaults = Price::for_model(&section.model);
        let price = Price::new(
            section.price_per_1k_input.unwrap_or(defaults.input_per_1k),
            section.price_per_1k_output.unwrap_or(defaults.output_per_1k),
        );

        let client = http_client(Duration::from_secs(section.timeout_secs.max(1)))
            .map_err(|e| TallyError::Llm(LlmError::Config(e.to_string())))?;

        Ok(Self {
            client,
            dialect,
            endpoint: format!("{base}{}", dialect.path()),
            api_key,
            model: section.model.clone(),
            max_tokens: section.max_tokens,
            temperature: section.temperature,
            price,
        })
    }

    fn request<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f64,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Either reply layout: Anthropic fills `content`, OpenAI fills `choices`.
#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Vec<TextBlock>,
    #[serde(default)]
    choices: Vec<Choice>,
    usage: ReplyUsage,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: TextMessage,
}

#[derive(Debug, Deserialize)]
struct TextMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReplyUsage {
    #[serde(alias = "prompt_tokens")]
    input_tokens: u64,
    #[serde(alias = "completion_tokens")]
    output_tokens: u64,
}

impl ChatReply {
    fn into_parts(self) -> (String, TokenUsage) {
        let text = if self.content.is_empty() {
            self.choices
                .into_iter()
                .filter_map(|c| c.message.content)
                .collect::<String>()
        } else {
            self.content.into_iter().map(|b| b.text).collect()
        };
        let usage = TokenUsage {
            input_tokens: self.usage.input_tokens,
            output_tokens: self.usage.output_tokens,
        };
        (text, usage)
    }
}

#[async_trait::async_trait]
impl LlmProvider for ChatProvider {
    fn name(&self) -> &str {
        self.dialect.label()
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> crate::error::Result<(String, TokenUsage)> {
        debug!(
            provider = self.dialect.label(),
            model = %self.model,
            chars = prompt.len(),
            "Sending inference prompt"
        );

        let mut req = self.client.post(&self.endpoint).json(&self.request(prompt));
        req = match self.dialect {
            Dialect::Anthropic => req
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            Dialect::OpenAi => req.bearer_auth(&self.api_key),
        };

        let resp = req
            .send()
            .await
            .map_err(|e| TallyError::Llm(LlmError::Network(e.to_string())))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(TallyError::Llm(LlmError::ApiError { status, body }));
        }

        let reply: ChatReply = resp
            .json()
            .await
            .map_err(|e| TallyError::Llm(LlmError::Parse(e.to_string())))?;
        Ok(reply.into_parts())
    }

    fn cost(&self, usage: &TokenUsage) -> f64 {
        self.price.cost(usage)
    }
}

/// The configured provider, reading its key from `api_key_env`.
pub fn provider_from_config(section: &LlmSection) -> crate::error::Result<Box<dyn LlmProvider>> {
    let api_key = std::env::var(&section.api_key_env).map_err(|_| {
        TallyError::Llm(LlmError::Config(format!(
            "{} is not set",
            section.api_key_env
        )))
    })?;
    Ok(Box::new(ChatProvider::from_section(section, api_key)?))
}
