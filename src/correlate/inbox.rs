//! Freeform inbound messages.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::store::ContactId;

/// An inbound SMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundMessage {
    /// Sender phone number
    pub from: String,
    /// Our number that received it
    pub to: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Inbound message not attributed to any send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboxEntry {
    pub message: InboundMessage,
    /// Set when the sender is a known contact
    pub contact_id: Option<ContactId>,
}

/// Receives inbound messages that matched no recent send.
#[async_trait]
pub trait Inbox: Send + Sync {
    async fn deliver(&self, entry: InboxEntry) -> anyhow::Result<()>;
}

/// Logs inbox entries.
#[derive(Debug, Default)]
pub struct LogInbox;

#[async_trait]
impl Inbox for LogInbox {
    async fn deliver(&self, entry: InboxEntry) -> anyhow::Result<()> {
        info!(
            from = %entry.message.from,
            contact_id = ?entry.contact_id,
            received_at = %entry.message.received_at,
            "unattributed inbound message"
        );
        Ok(())
    }
}

/// Keeps inbox entries in memory.
#[derive(Debug, Default)]
pub struct MemoryInbox {
    entries: Mutex<Vec<InboxEntry>>,
}

impl MemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<InboxEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Inbox for MemoryInbox {
    async fn deliver(&self, entry: InboxEntry) -> anyhow::Result<()> {
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }
}
