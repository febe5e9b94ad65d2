//! AIWhisperer: a multi-agent orchestration runtime.
//!
//! Hosts a fleet of AI agents, each driven by its own streaming
//! conversation loop against an OpenAI-compatible endpoint. Agents exchange
//! work through an in-process mailbox, sleep and wake on events, and invoke
//! workspace-scoped tools. External surfaces (WebSocket, MCP, CLI) are thin
//! adapters over the notification channel and the session manager API.

pub mod accumulator;
pub mod ai_loop;
pub mod capabilities;
pub mod config;
pub mod context;
pub mod continuation;
pub mod loop_manager;
pub mod mailbox;
pub mod path_guard;
pub mod persistence;
pub mod service;
pub mod session;
pub mod sync_bridge;
pub mod tools;
pub mod types;
pub mod workspace;

pub use accumulator::{AccumulatorError, RawToolCall, ToolCallAccumulator};
pub use ai_loop::{AiLoop, AiLoopConfig, LoopHandle, LoopState, TurnResult};
pub use capabilities::{capabilities_for, ModelCapabilities, Quirks};
pub use config::{Config, ConfigError, GenerationParams, RetryPolicy};
pub use context::{AgentContext, ContextStore};
pub use continuation::{ContinuationState, ContinuationStatus, ContinuationStrategy};
pub use loop_manager::{AgentAiConfig, AiLoopManager};
pub use mailbox::{Mail, MailPriority, MailStatus, Mailbox};
pub use path_guard::PathGuard;
pub use persistence::StatePersistence;
pub use service::{
    AiServiceConfig, AiServiceError, AiStream, ChatService, MockAiService, OpenRouterService,
    StreamOutcome, StreamRequest,
};
pub use session::{
    AgentDefinition, AgentState, AsyncSessionManager, SessionError, SessionManagerOptions,
};
pub use sync_bridge::{BridgeStatus, SyncExecutor, TaskRequest, TaskResponse};
pub use tools::{Tool, ToolContext, ToolDeps, ToolError, ToolRegistry};
pub use types::*;
