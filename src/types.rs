use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A single entry in an agent's conversation history, in the shape the
/// chat-completions wire protocol expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum Message {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> &str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Text content, if this message carries any.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::System { content } | Self::User { content } | Self::Tool { content, .. } => {
                Some(content)
            }
            Self::Assistant { content, .. } => content.as_deref(),
        }
    }
}

impl From<&str> for Message {
    /// Bare strings coerce to user messages.
    fn from(text: &str) -> Self {
        Message::user(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::user(text)
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A complete tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One sparse fragment of a streamed tool call. Fragments are tagged by
/// `index`; `arguments` is a substring of the JSON-encoded argument string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// ---------------------------------------------------------------------------
// Streaming chunks
// ---------------------------------------------------------------------------

/// Why a completion stream (or a turn) ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "tool_calls" => Self::ToolCalls,
            "length" => Self::Length,
            "error" => Self::Error,
            _ => Self::Stop,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::ToolCalls => write!(f, "tool_calls"),
            Self::Length => write!(f, "length"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One parsed chunk of a streaming chat completion.
#[derive(Debug, Clone, Default)]
pub struct AiStreamChunk {
    pub delta_content: Option<String>,
    pub delta_tool_calls: Vec<ToolCallFragment>,
    pub delta_reasoning: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

// ---------------------------------------------------------------------------
// Channel responses
// ---------------------------------------------------------------------------

/// Structured final result of a turn, normalized from whatever the model
/// produced. A flat string lands in `final`; a dict with the three channel
/// keys passes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelResponse {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub commentary: String,
    #[serde(rename = "final", default)]
    pub final_response: String,
}

impl ChannelResponse {
    pub fn from_response(text: &str) -> Self {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
            if let Some(map) = value.as_object() {
                if map.contains_key("analysis")
                    && map.contains_key("commentary")
                    && map.contains_key("final")
                {
                    return Self {
                        analysis: string_field(map, "analysis"),
                        commentary: string_field(map, "commentary"),
                        final_response: string_field(map, "final"),
                    };
                }
                if let Some(response) = map.get("response").and_then(|v| v.as_str()) {
                    return Self {
                        final_response: response.to_string(),
                        ..Default::default()
                    };
                }
            }
        }
        Self {
            final_response: text.to_string(),
            ..Default::default()
        }
    }
}

fn string_field(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    match map.get(key) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Method/params envelope delivered through an injected transport. The core
/// never assumes what sits on the other end of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: serde_json::Value,
}

pub type NotificationSender = mpsc::UnboundedSender<Notification>;

/// Send a notification, ignoring delivery failure. A dropped receiver must
/// never break an agent loop.
pub fn notify(tx: &NotificationSender, method: &str, params: serde_json::Value) {
    let _ = tx.send(Notification {
        method: method.to_string(),
        params,
    });
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Direct,
    Mail,
    Continuation,
    WakeEvent,
    TimerWake,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Mail => write!(f, "mail"),
            Self::Continuation => write!(f, "continuation"),
            Self::WakeEvent => write!(f, "wake_event"),
            Self::TimerWake => write!(f, "timer_wake"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<String>,
    #[serde(default)]
    pub continuation: bool,
}

/// A unit of work queued for an agent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub prompt: String,
    #[serde(default)]
    pub context: TaskContext,
}

impl Task {
    pub fn direct(prompt: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            kind: TaskKind::Direct,
            prompt: prompt.into(),
            context: TaskContext::default(),
        }
    }

    pub fn continuation(parent_task: impl Into<String>) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            kind: TaskKind::Continuation,
            prompt: "Continue with the current task".to_string(),
            context: TaskContext {
                parent_task: Some(parent_task.into()),
                continuation: true,
                ..Default::default()
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roles_serialize_to_wire_names() {
        let msg = Message::tool_result("call-1", "read_file", "hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call-1");
        assert_eq!(json["name"], "read_file");
    }

    #[test]
    fn bare_string_coerces_to_user_message() {
        let msg: Message = "hello".into();
        assert_eq!(msg.role(), "user");
        assert_eq!(msg.content(), Some("hello"));
    }

    #[test]
    fn assistant_without_tool_calls_omits_field() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn channel_response_passthrough() {
        let text = r#"{"analysis": "a", "commentary": "c", "final": "f"}"#;
        let channel = ChannelResponse::from_response(text);
        assert_eq!(channel.analysis, "a");
        assert_eq!(channel.final_response, "f");
    }

    #[test]
    fn channel_response_flat_string_lands_in_final() {
        let channel = ChannelResponse::from_response("plain answer");
        assert_eq!(channel.final_response, "plain answer");
        assert!(channel.analysis.is_empty());
    }

    #[test]
    fn channel_response_from_response_key() {
        let channel = ChannelResponse::from_response(r#"{"response": "done"}"#);
        assert_eq!(channel.final_response, "done");
    }

    #[test]
    fn finish_reason_from_wire() {
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("unknown"), FinishReason::Stop);
    }
}
