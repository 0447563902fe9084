//! Client for OpenAI-compatible chat completion endpoints.
//!
//! Used by the heading classifier and the image describer. Requests carry a
//! per-request timeout, are retried a bounded number of times with linear
//! backoff, and share a semaphore capping in-flight calls to the service.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64_STANDARD;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use kbforge_shared::{KbForgeError, Result, ServiceConfig};

/// User-Agent string for collaborator requests.
const USER_AGENT: &str = concat!("kbforge/", env!("CARGO_PKG_VERSION"));

/// Delay unit between attempts; attempt `n` waits `n` units.
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One part of a multi-part user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Inline image as a base64 `data:` URL.
    pub fn image(mime: &str, bytes: &[u8]) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: format!("data:{mime};base64,{}", B64_STANDARD.encode(bytes)),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Outcome of a single failed attempt.
enum AttemptError {
    Retryable(String),
    Fatal(String),
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

/// Chat completions client bound to one service and model.
#[derive(Debug, Clone)]
pub struct ChatClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    max_retries: u32,
    backoff: Duration,
    permits: Arc<Semaphore>,
}

impl ChatClient {
    /// Build a client from a `[llm]`/`[vision]` config section.
    ///
    /// Fails if the base URL is invalid or the API key env var is unset.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let base = config.parsed_base_url()?;
        let api_key = config.api_key()?;
        Self::new(
            base.as_str(),
            Some(api_key),
            &config.model,
            config.timeout(),
            config.max_retries,
            config.max_concurrent_requests,
        )
    }

    /// Build a client against an explicit base URL.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
        max_retries: u32,
        max_concurrent_requests: u32,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| KbForgeError::Collaborator(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model: model.to_string(),
            max_retries,
            backoff: DEFAULT_BACKOFF,
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1) as usize)),
        })
    }

    /// Override the backoff unit between attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a system prompt plus user parts and return the reply text.
    #[instrument(skip_all, fields(model = %self.model))]
    pub async fn complete(&self, system: &str, user: Vec<ContentPart>) -> Result<String> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: MessageContent::Text(system.to_string()),
        }];
        if !user.is_empty() {
            messages.push(ChatMessage {
                role: "user",
                content: MessageContent::Parts(user),
            });
        }
        let request = ChatRequest {
            model: &self.model,
            messages,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| KbForgeError::Collaborator("request limiter closed".into()))?;

        let attempts = self.max_retries + 1;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.backoff * (attempt - 1)).await;
            }
            match self.send_once(&request).await {
                Ok(text) => {
                    debug!(attempt, reply_len = text.len(), "completion received");
                    return Ok(text);
                }
                Err(AttemptError::Fatal(msg)) => {
                    return Err(KbForgeError::Collaborator(format!("{}: {msg}", self.endpoint)));
                }
                Err(AttemptError::Retryable(msg)) => {
                    warn!(attempt, attempts, error = %msg, "completion attempt failed");
                    last_error = msg;
                }
            }
        }

        Err(KbForgeError::Collaborator(format!(
            "{}: giving up after {attempts} attempts: {last_error}",
            self.endpoint
        )))
    }

    async fn send_once(&self, request: &ChatRequest<'_>) -> std::result::Result<String, AttemptError> {
        let mut builder = self.http.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!("HTTP {status}: {}", truncate(&body, 200));
            return Err(if is_retryable(status) {
                AttemptError::Retryable(msg)
            } else {
                AttemptError::Fatal(msg)
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::Retryable(format!("malformed completion body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AttemptError::Retryable("completion has no content".into()))
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
