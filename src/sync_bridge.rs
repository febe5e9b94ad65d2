//! Synchronous request/response on top of the mailbox.
//!
//! This is how agent A "calls" agent B without leaving its own loop: a
//! high-priority request mail carries a correlation id, the caller polls its
//! inbox for the matching `Re: Task Request` reply, and a timeout cleans up
//! the outstanding-request record. The server side interprets
//! `execute tool: <name>` requests against the tool registry.

use crate::mailbox::{Mail, MailPriority, Mailbox};
use crate::tools::{ToolContext, ToolRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed request body: {0}")]
    MalformedRequest(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub request_id: String,
    pub task: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub timeout_secs: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    Completed,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub request_id: String,
    pub status: BridgeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SyncExecutor {
    mailbox: Arc<Mailbox>,
    pending: Mutex<HashMap<String, TaskRequest>>,
}

impl SyncExecutor {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self {
            mailbox,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a task request to another agent. Returns the correlation id the
    /// caller passes to `wait_for_response`.
    pub fn send_request(
        &self,
        from_agent: &str,
        to_agent: &str,
        task: &str,
        parameters: serde_json::Value,
        timeout: Duration,
    ) -> String {
        let request = TaskRequest {
            request_id: format!("req_{}", Uuid::new_v4()),
            task: task.to_string(),
            parameters,
            timeout_secs: timeout.as_secs_f64(),
        };
        let request_id = request.request_id.clone();

        let body = serde_json::to_string(&request).expect("request serializes");
        let mail = Mail::new(from_agent, to_agent, format!("Task Request: {task}"), body)
            .with_priority(MailPriority::High);
        self.mailbox.send(mail);
        info!(request_id = %request_id, from_agent, to_agent, task, "sent task request");

        self.pending.lock().unwrap().insert(request_id.clone(), request);
        request_id
    }

    /// Poll the caller's inbox for the reply matching `request_id`. On
    /// timeout the outstanding-request record is removed and a `timeout`
    /// response returned.
    pub async fn wait_for_response(
        &self,
        agent_name: &str,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> TaskResponse {
        let configured = {
            let pending = self.pending.lock().unwrap();
            match pending.get(request_id) {
                Some(request) => Duration::from_secs_f64(request.timeout_secs),
                None => {
                    return TaskResponse {
                        request_id: request_id.to_string(),
                        status: BridgeStatus::Error,
                        result: None,
                        error: Some("unknown request id".into()),
                    }
                }
            }
        };
        let timeout = timeout.unwrap_or(configured);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            for mail in self.mailbox.check(agent_name) {
                if !mail.subject.starts_with("Re: Task Request") {
                    continue;
                }
                let Ok(response) = serde_json::from_str::<TaskResponse>(&mail.body) else {
                    warn!(subject = %mail.subject, "unparseable task response body");
                    continue;
                };
                if response.request_id == request_id {
                    self.pending.lock().unwrap().remove(request_id);
                    return response;
                }
            }

            if tokio::time::Instant::now() >= deadline {
                self.pending.lock().unwrap().remove(request_id);
                return TaskResponse {
                    request_id: request_id.to_string(),
                    status: BridgeStatus::Timeout,
                    result: None,
                    error: Some(format!("request timed out after {timeout:?}")),
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Server side: execute a request received via mailbox and reply with
    /// the serialized outcome. The reply is linked to the request mail so
    /// the exchange reads as one thread.
    pub async fn execute_task_request(
        &self,
        agent_name: &str,
        request_mail: &Mail,
        registry: &ToolRegistry,
        ctx: &ToolContext,
    ) -> Result<(), BridgeError> {
        let request: TaskRequest = serde_json::from_str(&request_mail.body)
            .map_err(|e| BridgeError::MalformedRequest(e.to_string()))?;
        debug!(agent_name, task = %request.task, "executing task request");

        let (status, result, error) = match request.task.strip_prefix("execute tool:") {
            Some(tool_name) => {
                let result = registry
                    .dispatch(tool_name.trim(), request.parameters.clone(), ctx)
                    .await;
                if result.get("error").is_some() {
                    let message = result["error"].as_str().unwrap_or("tool failed").to_string();
                    (BridgeStatus::Error, Some(result), Some(message))
                } else {
                    (BridgeStatus::Completed, Some(result), None)
                }
            }
            None => (
                BridgeStatus::Completed,
                Some(serde_json::json!(format!(
                    "Task '{}' acknowledged but not implemented",
                    request.task
                ))),
                None,
            ),
        };

        let response = TaskResponse {
            request_id: request.request_id.clone(),
            status,
            result,
            error,
        };
        let reply = Mail::new(
            agent_name,
            request_mail.from_agent.clone(),
            format!("Re: Task Request: {}", request.task),
            serde_json::to_string(&response).expect("response serializes"),
        )
        .with_priority(MailPriority::High);
        self.mailbox.reply(&request_mail.message_id, reply);
        info!(request_id = %request.request_id, "sent task response");
        Ok(())
    }
}
