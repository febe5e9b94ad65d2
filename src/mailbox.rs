//! The only sanctioned inter-agent channel.
//!
//! Every agent (and the user, addressed by the empty string) has an inbox.
//! Delivery is FIFO per recipient; reading flips unread→read atomically and
//! keeps the unread counter exact. Threads are reconstructed by following
//! `reply_to` in both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum MailPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for MailPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MailStatus {
    Unread,
    Read,
    Replied,
    Archived,
}

/// A mail message. Empty `from_agent`/`to_agent` means the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    pub message_id: String,
    pub from_agent: String,
    pub to_agent: String,
    pub subject: String,
    pub body: String,
    pub priority: MailPriority,
    pub timestamp: DateTime<Utc>,
    pub status: MailStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Mail {
    pub fn new(
        from_agent: impl Into<String>,
        to_agent: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            from_agent: from_agent.into(),
            to_agent: to_agent.into(),
            subject: subject.into(),
            body: body.into(),
            priority: MailPriority::Normal,
            timestamp: Utc::now(),
            status: MailStatus::Unread,
            reply_to: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: MailPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Handler invoked when new mail lands in a recipient's inbox.
pub type MailHandler = Box<dyn Fn(&Mail) + Send + Sync>;

#[derive(Default)]
struct MailboxInner {
    inboxes: HashMap<String, Vec<Mail>>,
    unread_counts: HashMap<String, usize>,
    archive: Vec<Mail>,
    handlers: HashMap<String, MailHandler>,
}

/// Centralized mailbox shared by all agents and the user. Internally locked;
/// callers hold an `Arc<Mailbox>`.
#[derive(Default)]
pub struct Mailbox {
    inner: Mutex<MailboxInner>,
}

fn recipient_key(name: &str) -> String {
    if name.is_empty() {
        "user".to_string()
    } else {
        name.to_string()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a mail to its recipient's inbox. Returns the message id.
    pub fn send(&self, mail: Mail) -> String {
        let message_id = mail.message_id.clone();
        let recipient = recipient_key(&mail.to_agent);
        let handler_mail = mail.clone();

        let mut inner = self.inner.lock().unwrap();
        if mail.status == MailStatus::Unread {
            *inner.unread_counts.entry(recipient.clone()).or_default() += 1;
        }
        info!(
            from = %display_name(&mail.from_agent),
            to = %recipient,
            subject = %mail.subject,
            "mail sent"
        );
        inner.inboxes.entry(recipient.clone()).or_default().push(mail);

        if let Some(handler) = inner.handlers.get(&recipient) {
            handler(&handler_mail);
        }
        message_id
    }

    /// Return unread mail for a recipient, atomically marking it read and
    /// zeroing the unread counter.
    pub fn check(&self, agent_name: &str) -> Vec<Mail> {
        let recipient = recipient_key(agent_name);
        let mut inner = self.inner.lock().unwrap();
        let mut unread = Vec::new();
        if let Some(inbox) = inner.inboxes.get_mut(&recipient) {
            for mail in inbox.iter_mut() {
                if mail.status == MailStatus::Unread {
                    mail.status = MailStatus::Read;
                    unread.push(mail.clone());
                }
            }
        }
        inner.unread_counts.insert(recipient, 0);
        unread
    }

    /// All mail for a recipient, optionally filtering read/archived entries.
    pub fn get_all(&self, agent_name: &str, include_read: bool, include_archived: bool) -> Vec<Mail> {
        let recipient = recipient_key(agent_name);
        let inner = self.inner.lock().unwrap();
        inner
            .inboxes
            .get(&recipient)
            .map(|inbox| {
                inbox
                    .iter()
                    .filter(|mail| match mail.status {
                        MailStatus::Archived => include_archived,
                        MailStatus::Read => include_read,
                        _ => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn unread_count(&self, agent_name: &str) -> usize {
        let recipient = recipient_key(agent_name);
        let inner = self.inner.lock().unwrap();
        inner.unread_counts.get(&recipient).copied().unwrap_or(0)
    }

    pub fn has_unread(&self, agent_name: &str) -> bool {
        self.unread_count(agent_name) > 0
    }

    /// Reply to a mail: sets the original's status to replied, links the
    /// reply via `reply_to`, and delivers it. Returns the reply's id.
    pub fn reply(&self, original_message_id: &str, mut reply: Mail) -> String {
        reply.reply_to = Some(original_message_id.to_string());
        {
            let mut inner = self.inner.lock().unwrap();
            for inbox in inner.inboxes.values_mut() {
                if let Some(mail) = inbox
                    .iter_mut()
                    .find(|m| m.message_id == original_message_id)
                {
                    mail.status = MailStatus::Replied;
                    break;
                }
            }
        }
        self.send(reply)
    }

    /// Archive a mail by id. Returns false if the id is unknown.
    pub fn archive(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let mut archived = None;
        for inbox in inner.inboxes.values_mut() {
            if let Some(mail) = inbox.iter_mut().find(|m| m.message_id == message_id) {
                mail.status = MailStatus::Archived;
                archived = Some(mail.clone());
                break;
            }
        }
        match archived {
            Some(mail) => {
                inner.archive.push(mail);
                true
            }
            None => false,
        }
    }

    /// Register a notification handler invoked on every delivery to the
    /// recipient. Replaces any previous handler.
    pub fn on_new_mail(&self, agent_name: &str, handler: MailHandler) {
        let recipient = recipient_key(agent_name);
        self.inner.lock().unwrap().handlers.insert(recipient, handler);
    }

    /// All messages in the conversation thread containing `message_id`,
    /// closed under `reply_to` and its reverse, in timestamp order.
    pub fn thread(&self, message_id: &str) -> Vec<Mail> {
        let inner = self.inner.lock().unwrap();
        let all: Vec<&Mail> = inner.inboxes.values().flatten().collect();

        let mut thread: Vec<Mail> = Vec::new();
        let mut visited: Vec<String> = Vec::new();
        let mut frontier = vec![message_id.to_string()];

        while let Some(id) = frontier.pop() {
            if visited.contains(&id) {
                continue;
            }
            visited.push(id.clone());

            if let Some(mail) = all.iter().find(|m| m.message_id == id) {
                thread.push((*mail).clone());
                if let Some(parent) = &mail.reply_to {
                    frontier.push(parent.clone());
                }
            }
            for mail in &all {
                if mail.reply_to.as_deref() == Some(id.as_str()) {
                    frontier.push(mail.message_id.clone());
                }
            }
        }

        thread.sort_by_key(|m| m.timestamp);
        thread
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "user"
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn check_marks_read_and_resets_counter() {
        let mailbox = Mailbox::new();
        mailbox.send(Mail::new("alice", "bob", "hi", "body"));
        mailbox.send(Mail::new("alice", "bob", "again", "body"));
        assert_eq!(mailbox.unread_count("bob"), 2);

        let unread = mailbox.check("bob");
        assert_eq!(unread.len(), 2);
        assert!(unread.iter().all(|m| m.status == MailStatus::Read));
        assert_eq!(mailbox.unread_count("bob"), 0);
        assert!(mailbox.check("bob").is_empty());
    }

    #[test]
    fn unread_count_tracks_only_unread() {
        let mailbox = Mailbox::new();
        let id = mailbox.send(Mail::new("alice", "bob", "one", ""));
        mailbox.send(Mail::new("alice", "bob", "two", ""));
        mailbox.check("bob");
        mailbox.send(Mail::new("alice", "bob", "three", ""));
        assert_eq!(mailbox.unread_count("bob"), 1);
        assert!(mailbox.archive(&id));
        assert_eq!(mailbox.unread_count("bob"), 1);
    }

    #[test]
    fn empty_recipient_routes_to_user() {
        let mailbox = Mailbox::new();
        mailbox.send(Mail::new("alice", "", "to the user", ""));
        assert_eq!(mailbox.unread_count(""), 1);
        let mail = mailbox.check("");
        assert_eq!(mail[0].subject, "to the user");
    }

    #[test]
    fn reply_marks_original_replied_and_links_thread() {
        let mailbox = Mailbox::new();
        let ping = mailbox.send(Mail::new("a", "b", "ping", "ack?"));
        mailbox.check("b");
        let ack = mailbox.reply(&ping, Mail::new("b", "a", "Re: ping", "ack"));

        let original = mailbox
            .get_all("b", true, false)
            .into_iter()
            .find(|m| m.message_id == ping)
            .unwrap();
        assert_eq!(original.status, MailStatus::Replied);

        let thread = mailbox.thread(&ping);
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].message_id, ping);
        assert_eq!(thread[1].message_id, ack);

        // Thread lookup from either end yields the same conversation.
        let from_reply = mailbox.thread(&ack);
        assert_eq!(from_reply.len(), 2);
        assert_eq!(from_reply[0].message_id, ping);
    }

    #[test]
    fn get_all_filters_read_and_archived() {
        let mailbox = Mailbox::new();
        let id = mailbox.send(Mail::new("a", "b", "one", ""));
        mailbox.send(Mail::new("a", "b", "two", ""));
        mailbox.check("b");
        mailbox.archive(&id);

        assert_eq!(mailbox.get_all("b", true, true).len(), 2);
        assert_eq!(mailbox.get_all("b", true, false).len(), 1);
        assert_eq!(mailbox.get_all("b", false, false).len(), 0);
    }

    #[test]
    fn archive_unknown_id_is_false() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.archive("nope"));
    }

    #[test]
    fn notification_handler_fires_on_delivery() {
        let mailbox = Mailbox::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        mailbox.on_new_mail(
            "bob",
            Box::new(move |_mail| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        mailbox.send(Mail::new("alice", "bob", "hi", ""));
        mailbox.send(Mail::new("alice", "carol", "hi", ""));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_is_fifo_per_recipient() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            mailbox.send(Mail::new("a", "b", format!("m{i}"), ""));
        }
        let mail = mailbox.check("b");
        let subjects: Vec<_> = mail.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, ["m0", "m1", "m2", "m3", "m4"]);
        // Timestamps are non-decreasing with delivery order.
        assert!(mail.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
