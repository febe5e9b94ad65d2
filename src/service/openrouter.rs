//! OpenRouter chat-completions client.
//!
//! One implementation covers every OpenAI-compatible provider reachable
//! through OpenRouter. Streaming responses arrive as SSE `data:` lines
//! terminated by `data: [DONE]`; the read loop runs on its own task and
//! feeds parsed chunks back through a channel. The client tolerates chunks
//! without choices (usage-only), fragmented `delta.tool_calls`, and treats
//! mid-stream in-body error objects as fatal.

use super::{
    AiServiceError, AiStream, ChatService, CompletedMessage, StreamOutcome, StreamRequest,
};
use crate::config::{GenerationParams, RetryPolicy};
use crate::types::{AiStreamChunk, FinishReason, Message, ToolCall, ToolCallFragment};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest_eventsource::EventSource;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[derive(Debug, Clone)]
pub struct AiServiceConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub site_url: Option<String>,
    pub app_name: Option<String>,
    pub params: GenerationParams,
    /// Backoff for transient failures on the non-streaming path.
    pub retry: RetryPolicy,
    /// Applied to non-streaming completions.
    pub timeout: Duration,
}

impl AiServiceConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            site_url: None,
            app_name: None,
            params: GenerationParams::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

pub struct OpenRouterService {
    config: AiServiceConfig,
    client: reqwest::Client,
}

impl OpenRouterService {
    pub fn new(config: AiServiceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn request_builder(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.config.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.config.api_key));
        if let Some(site_url) = &self.config.site_url {
            builder = builder.header("HTTP-Referer", site_url.as_str());
        }
        if let Some(app_name) = &self.config.app_name {
            builder = builder.header("X-Title", app_name.as_str());
        }
        builder.json(body)
    }

    fn build_payload(&self, request: &StreamRequest, stream: bool) -> serde_json::Value {
        let params = match &request.overrides {
            Some(overrides) => self.config.params.merged_with(overrides),
            None => self.config.params.clone(),
        };

        let messages: Vec<serde_json::Value> =
            request.messages.iter().map(message_to_wire).collect();

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temperature) = params.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        match params.max_reasoning_tokens {
            Some(0) => body["reasoning"] = serde_json::json!({"exclude": true}),
            Some(n) => body["reasoning"] = serde_json::json!({"max_reasoning_tokens": n}),
            None => {}
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools);
        }
        if let Some(response_format) = &request.response_format {
            body["response_format"] = response_format.clone();
        }
        body
    }
}

#[async_trait]
impl ChatService for OpenRouterService {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn stream(&self, request: StreamRequest) -> Result<AiStream, AiServiceError> {
        let body = self.build_payload(&request, true);
        debug!(model = %self.config.model, "opening completion stream");

        let builder = self.request_builder(&body);
        let mut es =
            EventSource::new(builder).map_err(|e| AiServiceError::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let producer_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = producer_cancel.cancelled() => {
                        es.close();
                        let _ = tx.send(StreamOutcome::StreamError(AiServiceError::Cancelled));
                        break;
                    }
                    event = es.next() => {
                        match event {
                            None => {
                                let _ = tx.send(StreamOutcome::EndOfStream);
                                break;
                            }
                            Some(Ok(reqwest_eventsource::Event::Open)) => {}
                            Some(Ok(reqwest_eventsource::Event::Message(msg))) => {
                                if msg.data == "[DONE]" {
                                    let _ = tx.send(StreamOutcome::EndOfStream);
                                    es.close();
                                    break;
                                }
                                match parse_stream_data(&msg.data) {
                                    Ok(Some(chunk)) => {
                                        if tx.send(StreamOutcome::Chunk(chunk)).is_err() {
                                            es.close();
                                            break;
                                        }
                                    }
                                    Ok(None) => {} // keep-alive or usage-only chunk
                                    Err(err) => {
                                        warn!(error = %err, "fatal mid-stream error");
                                        let _ = tx.send(StreamOutcome::StreamError(err));
                                        es.close();
                                        break;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                let _ = tx.send(StreamOutcome::StreamError(map_sse_error(err)));
                                es.close();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(AiStream::new(rx, cancel))
    }

    async fn complete(&self, request: StreamRequest) -> Result<CompletedMessage, AiServiceError> {
        let body = self.build_payload(&request, false);

        let mut attempt: u32 = 0;
        loop {
            let result = self.complete_once(&body).await;
            match result {
                Ok(message) => return Ok(message),
                Err(err) if err.is_retryable() && attempt < self.config.retry.max_attempts => {
                    attempt += 1;
                    // A server-supplied Retry-After wins over our backoff.
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| self.config.retry.backoff(attempt));
                    warn!(
                        attempt,
                        max = self.config.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient completion error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl OpenRouterService {
    async fn complete_once(
        &self,
        body: &serde_json::Value,
    ) -> Result<CompletedMessage, AiServiceError> {
        let response = self
            .request_builder(body)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| AiServiceError::Connection(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AiServiceError::Connection(e.to_string()))?;

        if !status.is_success() {
            let message = extract_error_message(&text);
            return Err(match status.as_u16() {
                401 => AiServiceError::Auth(message),
                429 => AiServiceError::RateLimit {
                    retry_after_ms: None,
                },
                code if code >= 500 => AiServiceError::Service {
                    status: Some(code),
                    message,
                },
                code => AiServiceError::Service {
                    status: Some(code),
                    message,
                },
            });
        }

        let raw: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| AiServiceError::Schema(e.to_string()))?;

        // Some providers return 200 with an in-body error object.
        if let Some(error) = raw.get("error") {
            return Err(AiServiceError::Service {
                status: error.get("code").and_then(|c| c.as_u64()).map(|c| c as u16),
                message: error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown provider error")
                    .to_string(),
            });
        }

        let wire_message = raw
            .pointer("/choices/0/message")
            .ok_or_else(|| AiServiceError::Schema("response has no choices[0].message".into()))?;
        let message = wire_message_to_message(wire_message)?;
        Ok(CompletedMessage { raw, message })
    }
}

// ---------------------------------------------------------------------------
// Wire conversion
// ---------------------------------------------------------------------------

/// Convert an internal message to the chat-completions wire shape. Tool-call
/// arguments travel as JSON-encoded strings on the wire.
fn message_to_wire(message: &Message) -> serde_json::Value {
    match message {
        Message::System { content } => serde_json::json!({"role": "system", "content": content}),
        Message::User { content } => serde_json::json!({"role": "user", "content": content}),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut obj = serde_json::json!({"role": "assistant"});
            if let Some(content) = content {
                obj["content"] = serde_json::json!(content);
            }
            if !tool_calls.is_empty() {
                let calls: Vec<serde_json::Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            },
                        })
                    })
                    .collect();
                obj["tool_calls"] = serde_json::json!(calls);
            }
            obj
        }
        Message::Tool {
            tool_call_id,
            name,
            content,
        } => serde_json::json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "name": name,
            "content": content,
        }),
    }
}

fn wire_message_to_message(wire: &serde_json::Value) -> Result<Message, AiServiceError> {
    let content = wire
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    let tool_calls = match wire.get("tool_calls").and_then(|tc| tc.as_array()) {
        Some(calls) => calls
            .iter()
            .map(|call| {
                let id = call
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AiServiceError::Schema("tool call without id".into()))?;
                let name = call
                    .pointer("/function/name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| AiServiceError::Schema("tool call without name".into()))?;
                let arguments = call
                    .pointer("/function/arguments")
                    .and_then(|v| v.as_str())
                    .map(|raw| {
                        serde_json::from_str(raw).unwrap_or(serde_json::Value::String(raw.into()))
                    })
                    .unwrap_or(serde_json::json!({}));
                Ok(ToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments,
                })
            })
            .collect::<Result<Vec<_>, AiServiceError>>()?,
        None => Vec::new(),
    };
    Ok(Message::Assistant {
        content,
        tool_calls,
    })
}

fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.pointer("/error/message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }
    let mut message = body.to_string();
    if message.len() > 500 {
        message.truncate(497);
        message.push_str("...");
    }
    message
}

fn map_sse_error(err: reqwest_eventsource::Error) -> AiServiceError {
    use reqwest_eventsource::Error;
    match err {
        Error::InvalidStatusCode(status, _) => match status.as_u16() {
            401 => AiServiceError::Auth("authentication failed".into()),
            429 => AiServiceError::RateLimit {
                retry_after_ms: None,
            },
            code => AiServiceError::Service {
                status: Some(code),
                message: format!("provider returned HTTP {code}"),
            },
        },
        Error::Transport(e) => AiServiceError::Connection(e.to_string()),
        Error::StreamEnded => AiServiceError::Connection("stream ended unexpectedly".into()),
        other => AiServiceError::Schema(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Stream chunk parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<serde_json::Value>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse one SSE data payload. `Ok(None)` means a chunk with nothing to
/// forward (keep-alive, usage-only). A mid-stream error object is fatal.
fn parse_stream_data(data: &str) -> Result<Option<AiStreamChunk>, AiServiceError> {
    let wire: WireChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream chunk");
            return Ok(None);
        }
    };

    if let Some(error) = wire.error {
        return Err(AiServiceError::Service {
            status: error
                .code
                .as_ref()
                .and_then(|c| c.as_u64())
                .map(|c| c as u16),
            message: error.message.unwrap_or_else(|| "mid-stream error".into()),
        });
    }

    let Some(choice) = wire.choices.into_iter().next() else {
        return Ok(None);
    };

    let delta_tool_calls = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallFragment {
            index: tc.index,
            id: tc.id,
            kind: tc.kind,
            name: tc.function.as_ref().and_then(|f| f.name.clone()),
            arguments: tc.function.as_ref().and_then(|f| f.arguments.clone()),
        })
        .collect();

    Ok(Some(AiStreamChunk {
        delta_content: choice.delta.content,
        delta_reasoning: choice.delta.reasoning.or(choice.delta.reasoning_content),
        delta_tool_calls,
        finish_reason: choice.finish_reason.as_deref().map(FinishReason::from_wire),
    }))
}
