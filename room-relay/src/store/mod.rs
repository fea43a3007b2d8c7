//! Message persistence consumed by the relay.
//!
//! The relay only appends messages and reads back a bounded tail per room.
//! [`MemoryStore`] keeps everything in process; [`JsonlStore`] adds an
//! append-only file underneath the same index.

mod jsonl;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::StoreError, identity::Identity, protocol::MessageView};

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

/// Display name used when a message's sender can no longer be resolved.
pub const UNKNOWN_SENDER: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub room: String,
    pub sender_id: String,
    /// Resolved display name; `None` once the sender is gone.
    pub sender: Option<String>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn to_view(&self) -> MessageView {
        MessageView {
            id: self.id,
            content: self.content.clone(),
            sender: self
                .sender
                .clone()
                .unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
            created_at: self.created_at,
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists `content` for `room` and returns the stored record.
    async fn append_message(
        &self,
        room: &str,
        sender: &Identity,
        content: &str,
    ) -> Result<StoredMessage, StoreError>;

    /// Returns up to `limit` of the newest messages in `room`, oldest first.
    async fn fetch_recent_messages(
        &self,
        room: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;
}
