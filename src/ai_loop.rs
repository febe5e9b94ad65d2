//! The per-agent AI loop: a streaming state machine that drives one agent
//! turn by turn.
//!
//! States: `NotStarted → WaitForInput → AssembleStream → ProcessToolResult →
//! WaitForInput … → Shutdown`. Input arrives on two queues (user messages
//! and tool results) consumed whichever-first; streaming interleaves chunk
//! forwarding, tool-call accumulation, a cooperative pause gate, and a
//! shutdown token. Errors never escape a turn: they become synthetic
//! assistant or tool messages the conversation can observe.

use crate::accumulator::ToolCallAccumulator;
use crate::capabilities::capabilities_for;
use crate::config::GenerationParams;
use crate::context::AgentContext;
use crate::service::{AiServiceError, ChatService, StreamOutcome, StreamRequest};
use crate::tools::{ToolContext, ToolRegistry};
use crate::types::{
    notify, ChannelResponse, FinishReason, Message, NotificationSender, ToolCall,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    WaitForInput,
    AssembleStream,
    ProcessToolResult,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("loop input channel closed")]
    ChannelClosed,
}

/// Configuration for one agent's loop.
#[derive(Debug, Clone)]
pub struct AiLoopConfig {
    pub agent_id: String,
    /// Hard ceiling on internal iterations per session.
    pub max_iterations: usize,
    /// Wall-clock budget for reading one completion stream.
    pub stream_timeout: Duration,
    pub overrides: Option<GenerationParams>,
    /// Structured-output directive; dropped for models that cannot combine
    /// it with tools.
    pub response_format: Option<serde_json::Value>,
    pub strict_tools: bool,
}

impl AiLoopConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            max_iterations: 1000,
            stream_timeout: Duration::from_secs(60),
            overrides: None,
            response_format: None,
            strict_tools: false,
        }
    }
}

/// Final outcome of one completed turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub finish_reason: FinishReason,
    pub response: String,
    /// The response parsed as a JSON object, when it is one.
    pub structured: Option<serde_json::Value>,
    pub tool_calls_count: usize,
    pub channel: ChannelResponse,
}

impl TurnResult {
    fn from_content(finish_reason: FinishReason, content: String, tool_calls: usize) -> Self {
        let structured = serde_json::from_str::<serde_json::Value>(&content)
            .ok()
            .filter(|v| v.is_object());
        let channel = ChannelResponse::from_response(&content);
        Self {
            finish_reason,
            response: content,
            structured,
            tool_calls_count: tool_calls,
            channel,
        }
    }
}

/// Cloneable external control surface for a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    user_tx: mpsc::UnboundedSender<Option<String>>,
    pause: Arc<watch::Sender<bool>>,
    shutdown: CancellationToken,
}

impl LoopHandle {
    /// Queue a user message. `None` is the shutdown sentinel.
    pub fn send_user_message(&self, message: impl Into<String>) -> Result<(), LoopError> {
        self.user_tx
            .send(Some(message.into()))
            .map_err(|_| LoopError::ChannelClosed)
    }

    pub fn pause(&self) {
        let _ = self.pause.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause.send(false);
    }

    /// Cooperative shutdown: the current stream closes and the loop reaches
    /// `Shutdown` at the next safe point.
    pub fn shutdown(&self) {
        let _ = self.user_tx.send(None);
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

enum StreamStep {
    ToolCalls,
    Completed(TurnResult),
    Shutdown,
}

pub struct AiLoop {
    config: AiLoopConfig,
    service: Arc<dyn ChatService>,
    registry: Arc<ToolRegistry>,
    notifications: NotificationSender,
    tool_context: ToolContext,

    state: LoopState,
    iteration_count: usize,
    turn_tool_calls: usize,

    user_rx: mpsc::UnboundedReceiver<Option<String>>,
    tool_tx: mpsc::UnboundedSender<Option<Message>>,
    tool_rx: mpsc::UnboundedReceiver<Option<Message>>,
    pause_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
    handle: LoopHandle,
}

impl AiLoop {
    pub fn new(
        config: AiLoopConfig,
        service: Arc<dyn ChatService>,
        registry: Arc<ToolRegistry>,
        notifications: NotificationSender,
    ) -> Self {
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let (tool_tx, tool_rx) = mpsc::unbounded_channel();
        let (pause_tx, pause_rx) = watch::channel(false);
        let shutdown = CancellationToken::new();
        let handle = LoopHandle {
            user_tx,
            pause: Arc::new(pause_tx),
            shutdown: shutdown.clone(),
        };
        let tool_context = ToolContext::for_agent(config.agent_id.clone());
        Self {
            config,
            service,
            registry,
            notifications,
            tool_context,
            state: LoopState::NotStarted,
            iteration_count: 0,
            turn_tool_calls: 0,
            user_rx,
            tool_tx,
            tool_rx,
            pause_rx,
            shutdown,
            handle,
        }
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn iteration_count(&self) -> usize {
        self.iteration_count
    }

    pub fn model(&self) -> &str {
        self.service.model()
    }

    /// Inject the per-session tool context (session ops for sleep/wake).
    pub fn set_tool_context(&mut self, tool_context: ToolContext) {
        self.tool_context = tool_context;
    }

    /// Queue a prompt and run the state machine until the turn completes.
    pub async fn process_message(
        &mut self,
        ctx: &mut AgentContext,
        prompt: impl Into<String>,
    ) -> Result<TurnResult, LoopError> {
        self.handle.send_user_message(prompt)?;
        self.run_until_turn_complete(ctx).await
    }

    /// The state machine. Returns when a turn has completed and both input
    /// queues are empty, or when shutdown is reached.
    pub async fn run_until_turn_complete(
        &mut self,
        ctx: &mut AgentContext,
    ) -> Result<TurnResult, LoopError> {
        if self.state == LoopState::NotStarted {
            self.state = LoopState::WaitForInput;
        }
        let mut finished_turn: Option<TurnResult> = None;

        loop {
            self.iteration_count += 1;
            if self.iteration_count > self.config.max_iterations {
                warn!(
                    agent_id = %self.config.agent_id,
                    max = self.config.max_iterations,
                    "iteration safety cap reached, shutting loop down"
                );
                self.notify_error("iteration limit reached");
                self.state = LoopState::Shutdown;
            }

            self.wait_if_paused().await;

            match self.state {
                LoopState::NotStarted => self.state = LoopState::WaitForInput,

                LoopState::WaitForInput => {
                    if self.consume_ready_input(ctx)? {
                        continue;
                    }
                    // Queues are empty; a finished turn is the caller's
                    // result.
                    if let Some(result) = finished_turn.take() {
                        return Ok(result);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            self.state = LoopState::Shutdown;
                        }
                        item = self.user_rx.recv() => {
                            match item.ok_or(LoopError::ChannelClosed)? {
                                Some(text) => self.accept_user_message(ctx, text),
                                None => self.state = LoopState::Shutdown,
                            }
                        }
                        item = self.tool_rx.recv() => {
                            match item.ok_or(LoopError::ChannelClosed)? {
                                Some(message) => self.accept_tool_result(ctx, message),
                                None => self.state = LoopState::Shutdown,
                            }
                        }
                    }
                }

                LoopState::AssembleStream => match self.assemble_stream(ctx).await {
                    StreamStep::ToolCalls => self.state = LoopState::ProcessToolResult,
                    StreamStep::Completed(result) => {
                        finished_turn = Some(result);
                        self.state = LoopState::WaitForInput;
                    }
                    StreamStep::Shutdown => self.state = LoopState::Shutdown,
                },

                LoopState::ProcessToolResult => {
                    // Results were queued inline during tool execution;
                    // drain them into context in queue order.
                    loop {
                        match self.tool_rx.try_recv() {
                            Ok(Some(message)) => self.append_tool_result(ctx, message),
                            Ok(None) => {
                                self.state = LoopState::Shutdown;
                                break;
                            }
                            Err(mpsc::error::TryRecvError::Empty) => break,
                            Err(mpsc::error::TryRecvError::Disconnected) => {
                                return Err(LoopError::ChannelClosed)
                            }
                        }
                    }
                    if self.state == LoopState::ProcessToolResult {
                        self.state = LoopState::AssembleStream;
                    }
                }

                LoopState::Shutdown => {
                    debug!(agent_id = %self.config.agent_id, "loop shutdown");
                    notify(
                        &self.notifications,
                        "ai_loop.session_ended",
                        serde_json::json!({
                            "agent_id": self.config.agent_id,
                            "reason": "stopped",
                        }),
                    );
                    return Ok(finished_turn.unwrap_or_else(|| {
                        TurnResult::from_content(FinishReason::Cancelled, String::new(), 0)
                    }));
                }
            }
        }
    }

    // -- Input handling --

    /// Non-blocking drain of one ready input. Returns true when something
    /// was consumed (state may have advanced).
    fn consume_ready_input(&mut self, ctx: &mut AgentContext) -> Result<bool, LoopError> {
        match self.user_rx.try_recv() {
            Ok(Some(text)) => {
                self.accept_user_message(ctx, text);
                return Ok(true);
            }
            Ok(None) => {
                self.state = LoopState::Shutdown;
                return Ok(true);
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(LoopError::ChannelClosed),
        }
        match self.tool_rx.try_recv() {
            Ok(Some(message)) => {
                self.accept_tool_result(ctx, message);
                return Ok(true);
            }
            Ok(None) => {
                self.state = LoopState::Shutdown;
                return Ok(true);
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => return Err(LoopError::ChannelClosed),
        }
        Ok(false)
    }

    fn accept_user_message(&mut self, ctx: &mut AgentContext, text: String) {
        self.turn_tool_calls = 0;
        ctx.add_message(Message::user(text.clone()));
        notify(
            &self.notifications,
            "ai_loop.message.user_processed",
            serde_json::json!({"agent_id": self.config.agent_id, "message": text}),
        );
        self.state = LoopState::AssembleStream;
    }

    fn accept_tool_result(&mut self, ctx: &mut AgentContext, message: Message) {
        if !matches!(message, Message::Tool { .. }) {
            // Wrong shape for this queue; discard rather than poison the
            // conversation.
            self.notify_error(&format!(
                "invalid item on tool result queue: expected tool message, got role '{}'",
                message.role()
            ));
            return;
        }
        self.append_tool_result(ctx, message);
        self.state = LoopState::AssembleStream;
    }

    fn append_tool_result(&mut self, ctx: &mut AgentContext, message: Message) {
        notify(
            &self.notifications,
            "ai_loop.tool_call.result_processed",
            serde_json::json!({
                "agent_id": self.config.agent_id,
                "result": serde_json::to_value(&message).unwrap_or_default(),
            }),
        );
        ctx.add_message(message);
    }

    // -- Streaming --

    async fn assemble_stream(&mut self, ctx: &mut AgentContext) -> StreamStep {
        let request = self.build_request(ctx);
        let mut stream = match self.service.stream(request).await {
            Ok(stream) => stream,
            Err(err) => return self.fail_turn(ctx, &err.to_string()),
        };

        let deadline = tokio::time::Instant::now() + self.config.stream_timeout;
        let mut content = String::new();
        let mut accumulator = ToolCallAccumulator::new();
        let mut finish: Option<FinishReason> = None;
        let mut last_nonempty: Option<String> = None;
        let mut stream_error: Option<String> = None;

        loop {
            self.wait_if_paused().await;
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    stream.close();
                    finish = Some(FinishReason::Cancelled);
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    stream.close();
                    stream_error = Some(format!(
                        "AI service timeout: no completion within {:?}",
                        self.config.stream_timeout
                    ));
                    break;
                }
                outcome = stream.next() => outcome,
            };

            match outcome {
                None | Some(StreamOutcome::EndOfStream) => break,
                Some(StreamOutcome::Chunk(chunk)) => {
                    if let Some(delta) = chunk.delta_content {
                        if !delta.is_empty() {
                            content.push_str(&delta);
                            if !delta.trim().is_empty() {
                                last_nonempty = Some(delta.clone());
                            }
                            notify(
                                &self.notifications,
                                "ai_loop.message.ai_chunk_received",
                                serde_json::json!({
                                    "agent_id": self.config.agent_id,
                                    "chunk": delta,
                                    "is_final_chunk": false,
                                }),
                            );
                        }
                    }
                    if !chunk.delta_tool_calls.is_empty() {
                        if let Err(err) = accumulator.add_all(&chunk.delta_tool_calls) {
                            stream.close();
                            self.notify_error(&err.to_string());
                            // A malformed stream ends the turn; partial
                            // fragments are untrustworthy.
                            return self.fail_turn_with_content(ctx, content, &err.to_string());
                        }
                    }
                    if let Some(reason) = chunk.finish_reason {
                        finish = Some(reason);
                    }
                }
                Some(StreamOutcome::StreamError(AiServiceError::Cancelled)) => {
                    finish = Some(FinishReason::Cancelled);
                    break;
                }
                Some(StreamOutcome::StreamError(err)) => {
                    stream_error = Some(err.to_string());
                    break;
                }
            }
        }

        if let Some(last) = last_nonempty {
            notify(
                &self.notifications,
                "ai_loop.message.ai_chunk_received",
                serde_json::json!({
                    "agent_id": self.config.agent_id,
                    "chunk": last,
                    "is_final_chunk": true,
                }),
            );
        }

        if finish == Some(FinishReason::Cancelled) || self.shutdown.is_cancelled() {
            // In-flight tool fragments are dropped on cancellation.
            return StreamStep::Shutdown;
        }
        if let Some(error) = stream_error {
            return self.fail_turn(ctx, &error);
        }

        if finish == Some(FinishReason::ToolCalls) {
            self.execute_tool_calls(ctx, content, accumulator).await;
            return StreamStep::ToolCalls;
        }

        // Natural end of turn: stop, length, or a stream that just ended.
        let finish = finish.unwrap_or(FinishReason::Stop);
        if !content.is_empty() {
            ctx.add_message(Message::assistant(content.clone()));
        }
        StreamStep::Completed(TurnResult::from_content(
            finish,
            content,
            self.turn_tool_calls,
        ))
    }

    fn build_request(&self, ctx: &AgentContext) -> StreamRequest {
        let tools = self.registry.openrouter_definitions(self.config.strict_tools);
        let mut response_format = self.config.response_format.clone();
        if response_format.is_some() && !tools.is_empty() {
            let caps = capabilities_for(self.service.model());
            if caps.quirks.no_tools_with_structured_output {
                info!(
                    model = self.service.model(),
                    "omitting response_format: model cannot combine structured output with tools"
                );
                response_format = None;
            }
        }
        StreamRequest {
            messages: ctx.history(None),
            tools,
            overrides: self.config.overrides.clone(),
            response_format,
        }
    }

    /// Execute accumulated tool calls inline, in call order. The assistant
    /// message is appended before any tool result it induced; per-call
    /// failures become synthetic error results.
    async fn execute_tool_calls(
        &mut self,
        ctx: &mut AgentContext,
        content: String,
        accumulator: ToolCallAccumulator,
    ) {
        let raw_calls = accumulator.completed();

        let tool_calls: Vec<ToolCall> = raw_calls
            .iter()
            .map(|raw| ToolCall {
                id: raw.id.clone(),
                name: raw.name.clone(),
                arguments: raw
                    .parse_arguments()
                    .unwrap_or_else(|_| serde_json::Value::String(raw.arguments.clone())),
            })
            .collect();

        ctx.add_message(Message::Assistant {
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls: tool_calls.clone(),
        });

        notify(
            &self.notifications,
            "ai_loop.tool_call.identified",
            serde_json::json!({
                "agent_id": self.config.agent_id,
                "tool_calls": serde_json::to_value(&tool_calls).unwrap_or_default(),
            }),
        );

        for raw in &raw_calls {
            self.turn_tool_calls += 1;
            let result = match raw.parse_arguments() {
                Ok(arguments) => {
                    self.registry
                        .dispatch(&raw.name, arguments, &self.tool_context)
                        .await
                }
                Err(err) => serde_json::json!({
                    "error": format!("invalid arguments for tool {}: {err}", raw.name),
                    "kind": "invalid-arguments",
                    "arguments": raw.arguments,
                }),
            };
            let content = stringify_result(&result);
            let _ = self
                .tool_tx
                .send(Some(Message::tool_result(&raw.id, &raw.name, content)));
        }
    }

    // -- Error turns --

    /// Stream-level failure: notify, append a synthetic assistant message,
    /// and end the turn so the loop returns to `WaitForInput`.
    fn fail_turn(&mut self, ctx: &mut AgentContext, error: &str) -> StreamStep {
        self.notify_error(error);
        let text = format!("An error occurred while processing the AI response: {error}");
        ctx.add_message(Message::assistant(text.clone()));
        StreamStep::Completed(TurnResult::from_content(
            FinishReason::Error,
            text,
            self.turn_tool_calls,
        ))
    }

    fn fail_turn_with_content(
        &mut self,
        ctx: &mut AgentContext,
        content: String,
        error: &str,
    ) -> StreamStep {
        if !content.is_empty() {
            ctx.add_message(Message::assistant(content));
        }
        self.fail_turn(ctx, error)
    }

    fn notify_error(&self, error: &str) {
        notify(
            &self.notifications,
            "ai_loop.error",
            serde_json::json!({"agent_id": self.config.agent_id, "error": error}),
        );
    }

    async fn wait_if_paused(&mut self) {
        if !*self.pause_rx.borrow() {
            return;
        }
        let mut rx = self.pause_rx.clone();
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = rx.wait_for(|paused| !paused) => {}
        }
    }
}

/// Stringify a structured tool result for the message history. Bare strings
/// stay bare; everything else is compact JSON.
fn stringify_result(result: &serde_json::Value) -> String {
    match result {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stringify_keeps_bare_strings() {
        assert_eq!(stringify_result(&serde_json::json!("plain")), "plain");
        assert_eq!(
            stringify_result(&serde_json::json!({"ok": true})),
            r#"{"ok":true}"#
        );
    }

    #[test]
    fn turn_result_parses_structured_objects() {
        let result =
            TurnResult::from_content(FinishReason::Stop, r#"{"final": "done"}"#.into(), 0);
        assert!(result.structured.is_some());

        let result = TurnResult::from_content(FinishReason::Stop, "42".into(), 0);
        assert!(result.structured.is_none(), "bare scalars are not structured");
    }
}
