use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{MessageStore, StoredMessage};
use crate::{error::StoreError, identity::Identity};

/// In-process message store.
///
/// Messages are kept per room in append order. Sender names are resolved
/// through a user directory at read time, so dropping a user from the
/// directory makes their history render with the unknown-sender sentinel.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<String, Vec<StoredMessage>>,
    users: HashMap<String, String>,
}

impl Inner {
    fn resolve(&self, message: &StoredMessage) -> StoredMessage {
        StoredMessage {
            sender: self.users.get(&message.sender_id).cloned(),
            ..message.clone()
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes `user_id` from the directory. Returns whether it was known.
    pub fn forget_user(&self, user_id: &str) -> bool {
        self.inner.lock().users.remove(user_id).is_some()
    }

    pub fn message_count(&self, room: &str) -> usize {
        self.inner.lock().rooms.get(room).map_or(0, Vec::len)
    }

    pub(crate) fn compose(room: &str, sender: &Identity, content: &str) -> StoredMessage {
        StoredMessage {
            id: Uuid::new_v4(),
            room: room.to_string(),
            sender_id: sender.user_id.clone(),
            sender: Some(sender.username.clone()),
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Adds an already-built record, refreshing the directory from its sender name.
    pub(crate) fn insert(&self, message: StoredMessage) -> StoredMessage {
        let mut inner = self.inner.lock();
        if let Some(name) = &message.sender {
            inner.users.insert(message.sender_id.clone(), name.clone());
        }
        let resolved = inner.resolve(&message);
        inner
            .rooms
            .entry(message.room.clone())
            .or_default()
            .push(message);
        resolved
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append_message(
        &self,
        room: &str,
        sender: &Identity,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        Ok(self.insert(Self::compose(room, sender, content)))
    }

    async fn fetch_recent_messages(
        &self,
        room: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock();
        let Some(messages) = inner.rooms.get(room) else {
            return Ok(Vec::new());
        };

        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..]
            .iter()
            .map(|message| inner.resolve(message))
            .collect())
    }
}
