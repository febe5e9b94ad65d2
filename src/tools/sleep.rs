//! Sleep/wake tools, wired to the session manager through the injected
//! `SessionOps` interface.

use super::{validate_required, Tool, ToolContext, ToolError};
use async_trait::async_trait;
use std::collections::HashSet;

pub struct AgentSleepTool;

impl AgentSleepTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentSleepTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AgentSleepTool {
    fn name(&self) -> &str {
        "agent_sleep"
    }

    fn description(&self) -> &str {
        "Put yourself to sleep. Wake on a timer, on configured wake events, or both."
    }

    fn category(&self) -> &str {
        "session"
    }

    fn tags(&self) -> Vec<String> {
        vec!["lifecycle".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "duration_seconds": {
                    "type": "integer",
                    "description": "Seconds to sleep; omit for indefinite sleep"
                },
                "wake_events": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Event tags that wake you early (e.g. mail_received, high_priority_mail)"
                }
            },
            "required": []
        })
    }

    fn prompt_instructions(&self) -> String {
        "agent_sleep: sleep to save work when idle. Include 'mail_received' in \
         wake_events if you must react to incoming mail."
            .to_string()
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let session = ctx.session.as_ref().ok_or_else(|| {
            ToolError::Execution("no session manager available in this context".into())
        })?;

        let duration = arguments["duration_seconds"].as_u64();
        let wake_events: Option<HashSet<String>> = arguments["wake_events"].as_array().map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        });

        session
            .sleep_agent(&ctx.agent_id, duration, wake_events.clone())
            .await
            .map_err(ToolError::Execution)?;

        Ok(serde_json::json!({
            "sleeping": true,
            "duration_seconds": duration,
            "wake_events": wake_events.map(|set| set.into_iter().collect::<Vec<_>>()),
        }))
    }
}

pub struct AgentWakeTool;

impl AgentWakeTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AgentWakeTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AgentWakeTool {
    fn name(&self) -> &str {
        "agent_wake"
    }

    fn description(&self) -> &str {
        "Wake a sleeping agent by id."
    }

    fn category(&self) -> &str {
        "session"
    }

    fn tags(&self) -> Vec<String> {
        vec!["lifecycle".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "Agent to wake"
                },
                "reason": {
                    "type": "string",
                    "description": "Why the agent is being woken"
                }
            },
            "required": ["agent_id"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let session = ctx.session.as_ref().ok_or_else(|| {
            ToolError::Execution("no session manager available in this context".into())
        })?;

        let agent_id = arguments["agent_id"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("'agent_id' must be a string".into()))?;
        let reason = arguments["reason"].as_str().unwrap_or("manual");

        session
            .wake_agent(agent_id, reason)
            .await
            .map_err(ToolError::Execution)?;

        Ok(serde_json::json!({"woken": agent_id, "reason": reason}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingOps {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl super::super::SessionOps for RecordingOps {
        async fn sleep_agent(
            &self,
            agent_id: &str,
            duration_secs: Option<u64>,
            _wake_events: Option<HashSet<String>>,
        ) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("sleep:{agent_id}:{duration_secs:?}"));
            Ok(())
        }

        async fn wake_agent(&self, agent_id: &str, reason: &str) -> Result<(), String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("wake:{agent_id}:{reason}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn sleep_routes_through_session_ops() {
        let ops = Arc::new(RecordingOps::default());
        let ctx = ToolContext::for_agent("debbie").with_session(ops.clone());
        let tool = AgentSleepTool::new();
        let result = tool
            .execute(
                serde_json::json!({"duration_seconds": 30, "wake_events": ["mail_received"]}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result["sleeping"], true);
        assert_eq!(ops.calls.lock().unwrap()[0], "sleep:debbie:Some(30)");
    }

    #[tokio::test]
    async fn wake_requires_agent_id() {
        let ops = Arc::new(RecordingOps::default());
        let ctx = ToolContext::for_agent("claude").with_session(ops);
        let tool = AgentWakeTool::new();
        let err = tool.execute(serde_json::json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");
    }

    #[tokio::test]
    async fn missing_session_is_execution_error() {
        let tool = AgentSleepTool::new();
        let err = tool
            .execute(serde_json::json!({}), &ToolContext::for_agent("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool-execution");
    }
}
