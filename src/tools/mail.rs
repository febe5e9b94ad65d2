//! Mailbox tools — the sanctioned way for agents to talk to each other.

use super::{validate_required, Tool, ToolContext, ToolError};
use crate::mailbox::{Mail, MailPriority, Mailbox};
use async_trait::async_trait;
use std::sync::Arc;

fn parse_priority(value: Option<&str>) -> Result<MailPriority, ToolError> {
    match value {
        None | Some("normal") => Ok(MailPriority::Normal),
        Some("low") => Ok(MailPriority::Low),
        Some("high") => Ok(MailPriority::High),
        Some("urgent") => Ok(MailPriority::Urgent),
        Some(other) => Err(ToolError::InvalidArguments(format!(
            "unknown priority '{other}' (expected low|normal|high|urgent)"
        ))),
    }
}

fn mail_to_value(mail: &Mail) -> serde_json::Value {
    serde_json::json!({
        "message_id": mail.message_id,
        "from": mail.from_agent,
        "subject": mail.subject,
        "body": mail.body,
        "priority": mail.priority,
        "timestamp": mail.timestamp.to_rfc3339(),
        "reply_to": mail.reply_to,
    })
}

// ---------------------------------------------------------------------------

pub struct SendMailTool {
    mailbox: Arc<Mailbox>,
}

impl SendMailTool {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for SendMailTool {
    fn name(&self) -> &str {
        "send_mail"
    }

    fn description(&self) -> &str {
        "Send a mail message to another agent, or to the user by leaving 'to' empty."
    }

    fn category(&self) -> &str {
        "communication"
    }

    fn tags(&self) -> Vec<String> {
        vec!["mailbox".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": {
                    "type": "string",
                    "description": "Recipient agent id (empty string for the user)"
                },
                "subject": {"type": "string"},
                "body": {"type": "string"},
                "priority": {
                    "type": "string",
                    "enum": ["low", "normal", "high", "urgent"],
                    "description": "Delivery priority (default normal)"
                }
            },
            "required": ["to", "subject", "body"]
        })
    }

    fn prompt_instructions(&self) -> String {
        "send_mail: address other agents by id; an empty 'to' reaches the user. \
         Use priority 'high' or 'urgent' only when the recipient should wake for it."
            .to_string()
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let to = arguments["to"].as_str().unwrap_or_default();
        let subject = arguments["subject"].as_str().unwrap_or_default();
        let body = arguments["body"].as_str().unwrap_or_default();
        let priority = parse_priority(arguments["priority"].as_str())?;

        let mail =
            Mail::new(ctx.agent_id.clone(), to, subject, body).with_priority(priority);
        let message_id = self.mailbox.send(mail);
        Ok(serde_json::json!({
            "message_id": message_id,
            "delivered_to": if to.is_empty() { "user" } else { to },
        }))
    }
}

// ---------------------------------------------------------------------------

/// Default page size for mailbox checks.
const DEFAULT_MAIL_LIMIT: usize = 10;

pub struct CheckMailTool {
    mailbox: Arc<Mailbox>,
}

impl CheckMailTool {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for CheckMailTool {
    fn name(&self) -> &str {
        "check_mail"
    }

    fn description(&self) -> &str {
        "Check your mailbox. By default returns unread messages (marking them read); set unread_only to false to also see read mail. Results are capped by limit."
    }

    fn category(&self) -> &str {
        "communication"
    }

    fn tags(&self) -> Vec<String> {
        vec!["mailbox".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "unread_only": {
                    "type": "boolean",
                    "description": "Only return unread messages (default true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of messages to return (default 10)"
                }
            },
            "required": []
        })
    }

    fn prompt_instructions(&self) -> String {
        "check_mail: call with no arguments to drain unread mail. If the result is \
         truncated, call again with unread_only=false and a larger limit to page \
         through the rest."
            .to_string()
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let unread_only = arguments["unread_only"].as_bool().unwrap_or(true);
        let limit = arguments["limit"]
            .as_u64()
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAIL_LIMIT);

        let all = if unread_only {
            self.mailbox.check(&ctx.agent_id)
        } else {
            self.mailbox.get_all(&ctx.agent_id, true, false)
        };
        let total_count = all.len();
        let messages: Vec<serde_json::Value> =
            all.iter().take(limit).map(mail_to_value).collect();

        Ok(serde_json::json!({
            "count": messages.len(),
            "total_count": total_count,
            "truncated": total_count > messages.len(),
            "messages": messages,
        }))
    }
}

// ---------------------------------------------------------------------------

pub struct ReplyMailTool {
    mailbox: Arc<Mailbox>,
}

impl ReplyMailTool {
    pub fn new(mailbox: Arc<Mailbox>) -> Self {
        Self { mailbox }
    }
}

#[async_trait]
impl Tool for ReplyMailTool {
    fn name(&self) -> &str {
        "reply_mail"
    }

    fn description(&self) -> &str {
        "Reply to a mail message by id. The reply is routed back to the original sender."
    }

    fn category(&self) -> &str {
        "communication"
    }

    fn tags(&self) -> Vec<String> {
        vec!["mailbox".into()]
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message_id": {
                    "type": "string",
                    "description": "Id of the message being replied to"
                },
                "to": {
                    "type": "string",
                    "description": "Recipient (the original sender)"
                },
                "subject": {"type": "string"},
                "body": {"type": "string"}
            },
            "required": ["message_id", "to", "subject", "body"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        validate_required(&self.parameters_schema(), &arguments)?;
        let original = arguments["message_id"].as_str().unwrap_or_default();
        let to = arguments["to"].as_str().unwrap_or_default();
        let subject = arguments["subject"].as_str().unwrap_or_default();
        let body = arguments["body"].as_str().unwrap_or_default();

        let reply = Mail::new(ctx.agent_id.clone(), to, subject, body);
        let message_id = self.mailbox.reply(original, reply);
        Ok(serde_json::json!({"message_id": message_id}))
    }
}
