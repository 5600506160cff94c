//! Streaming client for the local inference server.
//!
//! Each call posts one request, waits (bounded by the configured timeout) for
//! the response headers, then reads the body as a stream of token deltas. The
//! deltas are handed to an optional callback in arrival order and accumulated
//! into the final answer.

use crate::config::RequestConfig;
use crate::message::{Message, Role};
use crate::stream::{token_stream, StreamKind, TokenStream};
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("callosum/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("API request failed with status {status}: {}", .message.as_deref().unwrap_or("no details"))]
    Http { status: u16, message: Option<String> },
    #[error("server error: {0}")]
    Server(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("request was cancelled")]
    Cancelled,
}

impl InferenceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InferenceError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, InferenceError::Timeout(_))
    }
}

/// Per-call knobs: a token callback and an optional caller-owned
/// cancellation token.
#[derive(Default)]
pub struct CallOptions<'a> {
    on_token: Option<Box<dyn FnMut(&str) + Send + 'a>>,
    cancel: Option<CancellationToken>,
}

impl<'a> CallOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per delta, in arrival order.
    pub fn on_token(mut self, callback: impl FnMut(&str) + Send + 'a) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    /// Use `token` instead of the client's own cancellation slot.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Serialize)]
struct ModelOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: ModelOptions,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: ModelOptions,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

struct InFlight {
    id: u64,
    token: CancellationToken,
}

/// Client for `/api/generate`, `/api/chat` and `/api/tags`.
///
/// Calls made without a caller-supplied token share one cancellation slot:
/// the most recent such call is the one [`InferenceClient::cancel`] aborts.
/// Callers that need independent concurrent calls should pass their own
/// token through [`CallOptions::cancel_token`].
pub struct InferenceClient {
    http: Client,
    in_flight: Mutex<Option<InFlight>>,
    next_call: AtomicU64,
}

impl InferenceClient {
    pub fn new() -> Result<Self, InferenceError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_http(http))
    }

    pub fn with_http(http: Client) -> Self {
        Self {
            http,
            in_flight: Mutex::new(None),
            next_call: AtomicU64::new(0),
        }
    }

    /// Single-turn completion.
    pub async fn generate(
        &self,
        prompt: &str,
        config: &RequestConfig,
        options: CallOptions<'_>,
    ) -> Result<String, InferenceError> {
        let request = generate_request(prompt, config)?;
        self.run(StreamKind::Generate, &request, config, options)
            .await
    }

    /// Multi-turn completion over `messages`, sent in the given order.
    pub async fn chat(
        &self,
        messages: &[Message],
        config: &RequestConfig,
        options: CallOptions<'_>,
    ) -> Result<String, InferenceError> {
        let request = chat_request(messages, config)?;
        self.run(StreamKind::Chat, &request, config, options).await
    }

    /// Open a generate call and return its deltas as a lazy stream.
    /// `cancel` only covers the wait for headers; drop the stream to stop
    /// reading the body.
    pub async fn stream_generate(
        &self,
        prompt: &str,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, InferenceError> {
        let request = generate_request(prompt, config)?;
        self.open(StreamKind::Generate, &request, config, cancel)
            .await
    }

    /// Chat counterpart of [`InferenceClient::stream_generate`].
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, InferenceError> {
        let request = chat_request(messages, config)?;
        self.open(StreamKind::Chat, &request, config, cancel).await
    }

    /// Abort the call holding the client's cancellation slot, if any.
    pub fn cancel(&self) -> bool {
        match self.slot().take() {
            Some(in_flight) => {
                debug!(call = in_flight.id, "cancelling in-flight request");
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the server answers on its model listing endpoint. Never fails.
    pub async fn check_connection(&self, config: &RequestConfig) -> bool {
        match self.get_tags(config).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(endpoint = %config.endpoint, error = %e, "connection check failed");
                false
            }
        }
    }

    /// Names of the models the server has available.
    pub async fn list_models(&self, config: &RequestConfig) -> Result<Vec<String>, InferenceError> {
        let response = self.get_tags(config).await?;
        if !response.status().is_success() {
            return Err(http_error(response).await);
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|model| model.name).collect())
    }

    async fn get_tags(&self, config: &RequestConfig) -> Result<Response, InferenceError> {
        let url = format!("{}/api/tags", config.endpoint);
        match tokio::time::timeout(config.timeout, self.http.get(&url).send()).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(InferenceError::Timeout(timeout_ms(config))),
        }
    }

    async fn run<T: Serialize>(
        &self,
        kind: StreamKind,
        request: &T,
        config: &RequestConfig,
        options: CallOptions<'_>,
    ) -> Result<String, InferenceError> {
        let CallOptions { on_token, cancel } = options;
        let (token, claimed) = match cancel {
            Some(token) => (token, None),
            None => {
                let token = CancellationToken::new();
                let id = self.claim(token.clone());
                (token, Some(id))
            }
        };

        let result = match self.open(kind, request, config, &token).await {
            Ok(tokens) => collect_tokens(tokens, on_token, &token).await,
            Err(e) => Err(e),
        };

        if let Some(id) = claimed {
            self.release(id);
        }

        match &result {
            Ok(text) => info!(path = kind.path(), chars = text.len(), "completion finished"),
            Err(InferenceError::Cancelled) => info!(path = kind.path(), "completion cancelled"),
            Err(e) => warn!(path = kind.path(), error = %e, "completion failed"),
        }
        result
    }

    async fn open<T: Serialize>(
        &self,
        kind: StreamKind,
        request: &T,
        config: &RequestConfig,
        cancel: &CancellationToken,
    ) -> Result<TokenStream, InferenceError> {
        let url = format!("{}{}", config.endpoint, kind.path());
        debug!(%url, model = %config.model, "opening completion stream");

        let send = self.http.post(&url).json(request).send();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            sent = tokio::time::timeout(config.timeout, send) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(InferenceError::Timeout(timeout_ms(config))),
            },
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(tokio::select! {
                biased;
                _ = cancel.cancelled() => InferenceError::Cancelled,
                read = tokio::time::timeout(config.timeout, http_error(response)) => {
                    read.unwrap_or(InferenceError::Http { status, message: None })
                }
            });
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(InferenceError::from));
        Ok(token_stream(body, kind))
    }

    fn slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn claim(&self, token: CancellationToken) -> u64 {
        let id = self.next_call.fetch_add(1, Ordering::Relaxed);
        *self.slot() = Some(InFlight { id, token });
        id
    }

    fn release(&self, id: u64) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
    }
}

fn generate_request<'a>(
    prompt: &'a str,
    config: &'a RequestConfig,
) -> Result<GenerateRequest<'a>, InferenceError> {
    if prompt.trim().is_empty() {
        return Err(InferenceError::Validation("prompt must not be empty".into()));
    }
    Ok(GenerateRequest {
        model: &config.model,
        prompt,
        stream: true,
        options: model_options(config),
    })
}

fn chat_request<'a>(
    messages: &'a [Message],
    config: &'a RequestConfig,
) -> Result<ChatRequest<'a>, InferenceError> {
    let Some(last) = messages.last() else {
        return Err(InferenceError::Validation("messages must not be empty".into()));
    };
    if last.role != Role::User {
        debug!(role = %last.role, "conversation does not end with a user message");
    }
    Ok(ChatRequest {
        model: &config.model,
        messages,
        stream: true,
        options: model_options(config),
    })
}

fn model_options(config: &RequestConfig) -> ModelOptions {
    ModelOptions {
        temperature: config.temperature,
        num_predict: config.max_tokens,
    }
}

fn timeout_ms(config: &RequestConfig) -> u64 {
    config.timeout.as_millis() as u64
}

async fn http_error(response: Response) -> InferenceError {
    let status = response.status().as_u16();
    let message = response
        .json::<ErrorBody>()
        .await
        .ok()
        .and_then(|body| body.error);
    InferenceError::Http { status, message }
}

/// Drain `tokens`, feeding the callback and the accumulator. Cancellation is
/// checked before every chunk, so nothing is applied once it fires and the
/// partial text is dropped.
async fn collect_tokens(
    mut tokens: TokenStream,
    mut on_token: Option<Box<dyn FnMut(&str) + Send + '_>>,
    cancel: &CancellationToken,
) -> Result<String, InferenceError> {
    let mut full = String::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InferenceError::Cancelled),
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(token)) => {
                if let Some(callback) = on_token.as_mut() {
                    callback(&token);
                }
                full.push_str(&token);
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(full),
        }
    }
}
