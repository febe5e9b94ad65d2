//! Per-agent conversation context.
//!
//! Each agent owns an ordered message list, an explicit system-prompt slot,
//! and free-form metadata. The system prompt is never stored inside the
//! message list; `history()` prepends it on the way out so it can never be
//! duplicated.

use crate::types::Message;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const SERIALIZATION_VERSION: &str = "1.0";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid context file: {0}")]
    Invalid(String),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextSnapshot {
    version: String,
    context: ContextBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextBody {
    agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_prompt: Option<String>,
    messages: Vec<Message>,
    #[serde(default)]
    metadata: HashMap<String, serde_json::Value>,
}

/// Conversation state for one agent.
#[derive(Debug, Clone)]
pub struct AgentContext {
    agent_id: String,
    system_prompt: Option<String>,
    messages: Vec<Message>,
    metadata: HashMap<String, serde_json::Value>,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, system_prompt: Option<String>) -> Self {
        let agent_id = agent_id.into();
        let mut metadata = HashMap::new();
        metadata.insert("agent_id".to_string(), serde_json::json!(agent_id));
        if let Some(prompt) = &system_prompt {
            metadata.insert("system_prompt".to_string(), serde_json::json!(prompt));
        }
        Self {
            agent_id,
            system_prompt,
            messages: Vec::new(),
            metadata,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.metadata
            .insert("system_prompt".to_string(), serde_json::json!(prompt));
        self.system_prompt = Some(prompt);
    }

    /// Append a message. Bare strings coerce to user messages via
    /// `impl Into<Message>`.
    pub fn add_message(&mut self, message: impl Into<Message>) {
        self.messages.push(message.into());
    }

    /// The full history, with the system prompt prepended as the first
    /// message. With `limit`, only the most recent `limit` stored messages
    /// are returned (the system prompt does not count against it).
    pub fn history(&self, limit: Option<usize>) -> Vec<Message> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            out.push(Message::system(prompt.clone()));
        }
        let start = match limit {
            Some(n) => self.messages.len().saturating_sub(n),
            None => 0,
        };
        out.extend(self.messages[start..].iter().cloned());
        out
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    // -- Persistence --

    pub fn to_json(&self) -> Result<String, ContextError> {
        let snapshot = ContextSnapshot {
            version: SERIALIZATION_VERSION.to_string(),
            context: ContextBody {
                agent_id: self.agent_id.clone(),
                system_prompt: self.system_prompt.clone(),
                messages: self.messages.clone(),
                metadata: self.metadata.clone(),
            },
        };
        Ok(serde_json::to_string_pretty(&snapshot)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ContextError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let map = value
            .as_object()
            .ok_or_else(|| ContextError::Invalid("expected a JSON object".into()))?;
        if !map.contains_key("version") {
            return Err(ContextError::Invalid("missing 'version' field".into()));
        }
        if !map.contains_key("context") {
            return Err(ContextError::Invalid("missing 'context' field".into()));
        }
        let snapshot: ContextSnapshot = serde_json::from_value(value)?;
        Ok(Self {
            agent_id: snapshot.context.agent_id,
            system_prompt: snapshot.context.system_prompt,
            messages: snapshot.context.messages,
            metadata: snapshot.context.metadata,
        })
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ContextError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?).map_err(|source| ContextError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ContextError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }
}

/// Keyed collection of agent contexts. Messages are agent-scoped; nothing
/// leaks between agents.
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: HashMap<String, AgentContext>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&mut self, agent_id: &str, system_prompt: Option<String>) -> &mut AgentContext {
        self.contexts
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentContext::new(agent_id, system_prompt))
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentContext> {
        self.contexts.get(agent_id)
    }

    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut AgentContext> {
        self.contexts.get_mut(agent_id)
    }

    /// Clear one agent's messages, or every agent's when `agent_id` is None.
    pub fn clear(&mut self, agent_id: Option<&str>) {
        match agent_id {
            Some(id) => {
                if let Some(ctx) = self.contexts.get_mut(id) {
                    ctx.clear();
                }
            }
            None => {
                for ctx in self.contexts.values_mut() {
                    ctx.clear();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_prepends_system_prompt() {
        let mut ctx = AgentContext::new("planner", Some("You plan things.".into()));
        ctx.add_message("hello");
        let history = ctx.history(None);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role(), "system");
        assert_eq!(history[0].content(), Some("You plan things."));
        assert_eq!(history[1].role(), "user");
    }

    #[test]
    fn system_prompt_is_never_duplicated() {
        let mut ctx = AgentContext::new("planner", Some("prompt".into()));
        ctx.add_message("one");
        ctx.add_message(Message::assistant("two"));
        let history = ctx.history(None);
        let system_count = history.iter().filter(|m| m.role() == "system").count();
        assert_eq!(system_count, 1);
    }

    #[test]
    fn history_limit_keeps_recent_messages() {
        let mut ctx = AgentContext::new("a", Some("p".into()));
        for i in 0..5 {
            ctx.add_message(format!("m{i}"));
        }
        let history = ctx.history(Some(2));
        assert_eq!(history.len(), 3); // system + 2
        assert_eq!(history[1].content(), Some("m3"));
        assert_eq!(history[2].content(), Some("m4"));
    }

    #[test]
    fn json_round_trip() {
        let mut ctx = AgentContext::new("tester", Some("Test things.".into()));
        ctx.add_message("run the tests");
        ctx.add_message(Message::assistant("on it"));
        ctx.set_metadata("task", serde_json::json!("unit-tests"));

        let restored = AgentContext::from_json(&ctx.to_json().unwrap()).unwrap();
        assert_eq!(restored.agent_id(), "tester");
        assert_eq!(restored.system_prompt(), Some("Test things."));
        assert_eq!(restored.message_count(), 2);
        assert_eq!(restored.metadata("task"), Some(&serde_json::json!("unit-tests")));
    }

    #[test]
    fn load_rejects_missing_version() {
        let err = AgentContext::from_json(r#"{"context": {"agent_id": "a", "messages": []}}"#)
            .unwrap_err();
        assert!(matches!(err, ContextError::Invalid(_)));
    }

    #[test]
    fn load_rejects_missing_context() {
        let err = AgentContext::from_json(r#"{"version": "1.0"}"#).unwrap_err();
        assert!(matches!(err, ContextError::Invalid(_)));
    }

    #[test]
    fn store_scopes_messages_per_agent() {
        let mut store = ContextStore::new();
        store.ensure("a", Some("pa".into())).add_message("for a");
        store.ensure("b", Some("pb".into())).add_message("for b");

        assert_eq!(store.get("a").unwrap().message_count(), 1);
        assert_eq!(store.get("a").unwrap().messages()[0].content(), Some("for a"));
        store.clear(Some("a"));
        assert_eq!(store.get("a").unwrap().message_count(), 0);
        assert_eq!(store.get("b").unwrap().message_count(), 1);
        store.clear(None);
        assert_eq!(store.get("b").unwrap().message_count(), 0);
    }
}
