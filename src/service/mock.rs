//! Mock chat service for tests. No network.

use super::{
    AiServiceError, AiStream, ChatService, CompletedMessage, StreamOutcome, StreamRequest,
};
use crate::types::{AiStreamChunk, FinishReason, Message, ToolCall, ToolCallFragment};
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MockToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One scripted model response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Plain text streamed as word-sized deltas, then `finish_reason=stop`.
    Text(String),
    /// Tool calls streamed as fragmented deltas, then
    /// `finish_reason=tool_calls`.
    ToolCalls(Vec<MockToolCall>),
    /// Verbatim outcomes, for fragment-level and error-path tests.
    Outcomes(Vec<StreamOutcome>),
    /// A stream that emits one delta and then stays open until cancelled.
    Hang,
    /// Fail the request before any stream opens.
    Fail(AiServiceError),
}

/// Scripted service. Pops one response per call and records every request
/// for assertions.
pub struct MockAiService {
    model: String,
    responses: Mutex<Vec<MockResponse>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl MockAiService {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            model: "mock/model".to_string(),
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Convenience: always answer with the same text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![MockResponse::Text(text.into())])
    }

    /// Requests seen so far, in call order.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn pop_response(&self) -> MockResponse {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            MockResponse::Text("(no more mock responses)".into())
        } else {
            responses.remove(0)
        }
    }
}

fn content_chunk(text: &str) -> StreamOutcome {
    StreamOutcome::Chunk(AiStreamChunk {
        delta_content: Some(text.to_string()),
        ..Default::default()
    })
}

fn finish_chunk(reason: FinishReason) -> StreamOutcome {
    StreamOutcome::Chunk(AiStreamChunk {
        finish_reason: Some(reason),
        ..Default::default()
    })
}

fn tool_call_outcomes(calls: &[MockToolCall]) -> Vec<StreamOutcome> {
    let mut outcomes = Vec::new();
    for (index, call) in calls.iter().enumerate() {
        // Scalars first, then the argument string split in two, the way
        // real providers fragment deltas.
        outcomes.push(StreamOutcome::Chunk(AiStreamChunk {
            delta_tool_calls: vec![ToolCallFragment {
                index: index as u32,
                id: Some(format!("mock-call-{index}")),
                kind: Some("function".into()),
                name: Some(call.name.clone()),
                arguments: None,
            }],
            ..Default::default()
        }));
        let args = call.arguments.to_string();
        let mid = args.len() / 2;
        for part in [&args[..mid], &args[mid..]] {
            if !part.is_empty() {
                outcomes.push(StreamOutcome::Chunk(AiStreamChunk {
                    delta_tool_calls: vec![ToolCallFragment {
                        index: index as u32,
                        arguments: Some(part.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }));
            }
        }
    }
    outcomes.push(finish_chunk(FinishReason::ToolCalls));
    outcomes.push(StreamOutcome::EndOfStream);
    outcomes
}

#[async_trait]
impl ChatService for MockAiService {
    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: StreamRequest) -> Result<AiStream, AiServiceError> {
        self.requests.lock().unwrap().push(request);

        match self.pop_response() {
            MockResponse::Text(text) => {
                let mut outcomes: Vec<StreamOutcome> = Vec::new();
                for word in split_inclusive_words(&text) {
                    outcomes.push(content_chunk(&word));
                }
                outcomes.push(finish_chunk(FinishReason::Stop));
                outcomes.push(StreamOutcome::EndOfStream);
                Ok(AiStream::from_outcomes(outcomes))
            }
            MockResponse::ToolCalls(calls) => Ok(AiStream::from_outcomes(tool_call_outcomes(&calls))),
            MockResponse::Outcomes(outcomes) => Ok(AiStream::from_outcomes(outcomes)),
            MockResponse::Hang => {
                let (tx, rx) = mpsc::unbounded_channel();
                let cancel = CancellationToken::new();
                let producer_cancel = cancel.clone();
                tokio::spawn(async move {
                    let _ = tx.send(content_chunk("partial"));
                    producer_cancel.cancelled().await;
                    let _ = tx.send(StreamOutcome::StreamError(AiServiceError::Cancelled));
                });
                Ok(AiStream::new(rx, cancel))
            }
            MockResponse::Fail(err) => Err(err),
        }
    }

    async fn complete(&self, request: StreamRequest) -> Result<CompletedMessage, AiServiceError> {
        self.requests.lock().unwrap().push(request);
        match self.pop_response() {
            MockResponse::Text(text) => Ok(CompletedMessage {
                raw: serde_json::json!({"choices": [{"message": {"role": "assistant", "content": text}}]}),
                message: Message::assistant(text),
            }),
            MockResponse::ToolCalls(calls) => {
                let tool_calls: Vec<ToolCall> = calls
                    .iter()
                    .enumerate()
                    .map(|(i, call)| ToolCall {
                        id: format!("mock-call-{i}"),
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    })
                    .collect();
                Ok(CompletedMessage {
                    raw: serde_json::json!({}),
                    message: Message::Assistant {
                        content: None,
                        tool_calls,
                    },
                })
            }
            MockResponse::Fail(err) => Err(err),
            _ => Err(AiServiceError::Schema(
                "mock response kind not supported for complete()".into(),
            )),
        }
    }
}

fn split_inclusive_words(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let mut words = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
