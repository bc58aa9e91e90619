//! OpenAI-compatible chat-completions backend (LM Studio, llama.cpp server, vLLM)
//!
//! The state blob is the prefix text itself. Resuming sends the prefix as the
//! system message and everything fed after it as the user message, letting the
//! server's own prompt cache keep the processed prefix hot.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    split_pieces, GenerationBackend, GenerationSession, PrefixState, Step, TokenBuffer, WarmState,
};
use crate::error::{CagError, Result};

/// Connection settings for an OpenAI-compatible server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
    /// Send the prefix once at warm time so the server caches it
    pub prime_on_warm: bool,
}

impl Default for OpenAiCompatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".to_string(),
            api_key: "lm-studio".to_string(),
            model: "qwen/qwen3-1.7b".to_string(),
            timeout: Duration::from_secs(120),
            temperature: 0.3,
            prime_on_warm: true,
        }
    }
}

impl OpenAiCompatConfig {
    /// Read `LM_STUDIO_*` variables, falling back to the defaults
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let defaults = Self::default();

        let timeout = match std::env::var("LM_STUDIO_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                CagError::ConfigError(format!("LM_STUDIO_TIMEOUT_SECS is not a number: {raw}"))
            })?),
            Err(_) => defaults.timeout,
        };

        Ok(Self {
            base_url: std::env::var("LM_STUDIO_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("LM_STUDIO_API_KEY").unwrap_or(defaults.api_key),
            model: std::env::var("LM_STUDIO_MODEL").unwrap_or(defaults.model),
            timeout,
            ..defaults
        })
    }
}

/// Backend talking to `/chat/completions`
#[derive(Debug, Clone)]
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
    name: String,
}

impl OpenAiCompatBackend {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CagError::Backend(format!("failed to build HTTP client: {e}")))?;

        info!(
            "Using OpenAI-compatible backend at {} (model {})",
            config.base_url, config.model
        );

        Ok(Self {
            name: format!("openai:{}", config.model),
            client,
            config,
        })
    }

    pub fn config(&self) -> &OpenAiCompatConfig {
        &self.config
    }
}

#[async_trait]
impl GenerationBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    /// Rough model-token estimate: four characters per token
    fn count_tokens(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }

    async fn warm(&self, prefix: &str) -> Result<WarmState> {
        if self.config.prime_on_warm {
            let request = ChatRequest::new(&self.config, prefix, "Acknowledge.", 1);
            send_chat(&self.client, &self.config, &request).await?;
            debug!("Primed server prompt cache with {} chars", prefix.len());
        }

        Ok(WarmState {
            state: PrefixState::new(prefix.as_bytes().to_vec()),
            origin_length: split_pieces(prefix).len(),
        })
    }

    fn restore(&self, state: &PrefixState) -> Result<Box<dyn GenerationSession>> {
        let prefix = std::str::from_utf8(state.as_bytes())
            .map_err(|e| CagError::Backend(format!("prefix state is not UTF-8: {e}")))?;

        Ok(Box::new(OpenAiSession {
            client: self.client.clone(),
            config: self.config.clone(),
            buffer: TokenBuffer::from_text(prefix),
            pending: None,
        }))
    }
}

struct Completion {
    pieces: VecDeque<String>,
    hit_length_limit: bool,
}

struct OpenAiSession {
    client: reqwest::Client,
    config: OpenAiCompatConfig,
    buffer: TokenBuffer,
    pending: Option<Completion>,
}

#[async_trait]
impl GenerationSession for OpenAiSession {
    fn len(&self) -> usize {
        self.buffer.len()
    }

    fn truncate(&mut self, len: usize) {
        self.buffer.truncate(len);
        self.pending = None;
    }

    fn feed(&mut self, text: &str) -> Result<()> {
        self.buffer.push_text(text);
        self.pending = None;
        Ok(())
    }

    async fn next(&mut self, remaining: usize) -> Result<Step> {
        if self.pending.is_none() {
            let prefix = self.buffer.prefix_text();
            let prompt = self.buffer.prompt_text();
            let request = ChatRequest::new(&self.config, &prefix, prompt.trim(), remaining.max(1));
            let response = send_chat(&self.client, &self.config, &request).await?;

            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| CagError::Backend("response contained no choices".to_string()))?;
            let content = choice.message.content.unwrap_or_default();

            self.pending = Some(Completion {
                pieces: split_pieces(&content).into_iter().map(str::to_string).collect(),
                hit_length_limit: choice.finish_reason.as_deref() == Some("length"),
            });
        }

        let Some(completion) = self.pending.as_mut() else {
            return Ok(Step::End);
        };
        match completion.pieces.pop_front() {
            Some(piece) => {
                self.buffer.push_token(piece.clone());
                Ok(Step::Token(piece))
            }
            None if completion.hit_length_limit => Ok(Step::Exhausted),
            None => Ok(Step::End),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: usize,
    stream: bool,
}

impl<'a> ChatRequest<'a> {
    fn new(config: &'a OpenAiCompatConfig, system: &'a str, user: &'a str, max_tokens: usize) -> Self {
        Self {
            model: &config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: config.temperature,
            max_tokens,
            stream: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

async fn send_chat(
    client: &reqwest::Client,
    config: &OpenAiCompatConfig,
    request: &ChatRequest<'_>,
) -> Result<ChatResponse> {
    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {}", config.api_key))
        .header("Content-Type", "application/json")
        .json(request)
        .send()
        .await
        .map_err(|e| map_transport_error(e, config.timeout))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!("Chat completion failed with {}: {}", status, body);
        return Err(CagError::Backend(format!("server returned {status}: {body}")));
    }

    response
        .json::<ChatResponse>()
        .await
        .map_err(|e| map_transport_error(e, config.timeout))
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> CagError {
    if e.is_timeout() {
        CagError::GenerationTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        CagError::Backend(e.to_string())
    }
}
