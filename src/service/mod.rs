//! LLM chat-completion services.
//!
//! One implementation talks to any OpenAI-compatible endpoint through
//! OpenRouter; the mock drives loop and session tests without network.
//! Stream consumption is modeled as explicit outcome variants rather than
//! exceptions: a reader sees `Chunk`s, then exactly one `EndOfStream` or
//! `StreamError`.

pub mod mock;
pub mod openrouter;

pub use mock::{MockAiService, MockResponse, MockToolCall};
pub use openrouter::{AiServiceConfig, OpenRouterService};

use crate::config::GenerationParams;
use crate::types::{AiStreamChunk, Message};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error, Clone)]
pub enum AiServiceError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rate limit exceeded, retry after {retry_after_ms:?}ms")]
    RateLimit { retry_after_ms: Option<u64> },
    #[error("connection error: {0}")]
    Connection(String),
    #[error("service error ({status:?}): {message}")]
    Service { status: Option<u16>, message: String },
    #[error("unexpected response shape: {0}")]
    Schema(String),
    #[error("cancelled")]
    Cancelled,
}

impl AiServiceError {
    /// Rate limits and transient network failures are safe to retry; auth
    /// and shape errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Connection(_))
    }

    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimit {
                retry_after_ms: Some(ms),
            } => Some(std::time::Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// One streaming chat-completion request.
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    pub messages: Vec<Message>,
    /// Model-facing tool definitions (`{type:"function", function:{...}}`).
    pub tools: Vec<serde_json::Value>,
    /// Per-call parameter overrides merged over the service's base params.
    pub overrides: Option<GenerationParams>,
    pub response_format: Option<serde_json::Value>,
}

/// What a stream reader receives next.
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Chunk(AiStreamChunk),
    EndOfStream,
    StreamError(AiServiceError),
}

/// A live completion stream. The producer side runs on its own task,
/// feeding parsed chunks through a channel; `close()` cancels the producer
/// and the underlying HTTP stream.
pub struct AiStream {
    rx: mpsc::UnboundedReceiver<StreamOutcome>,
    cancel: CancellationToken,
}

impl AiStream {
    pub fn new(rx: mpsc::UnboundedReceiver<StreamOutcome>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Build a stream that replays fixed outcomes (used by mocks and tests).
    pub fn from_outcomes(outcomes: Vec<StreamOutcome>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        for outcome in outcomes {
            let _ = tx.send(outcome);
        }
        Self {
            rx,
            cancel: CancellationToken::new(),
        }
    }

    /// Next outcome, or `None` once the producer is gone.
    pub async fn next(&mut self) -> Option<StreamOutcome> {
        self.rx.recv().await
    }

    /// Cancel the producer; the underlying event source closes.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Non-streaming completion result: the raw provider JSON plus the parsed
/// assistant message.
#[derive(Debug, Clone)]
pub struct CompletedMessage {
    pub raw: serde_json::Value,
    pub message: Message,
}

/// The seam between the AI loop and any completion backend.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// The model this service is bound to.
    fn model(&self) -> &str;

    /// Open a streaming completion.
    async fn stream(&self, request: StreamRequest) -> Result<AiStream, AiServiceError>;

    /// Non-streaming completion.
    async fn complete(&self, request: StreamRequest) -> Result<CompletedMessage, AiServiceError>;
}
