use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::info;

use super::{MemoryStore, MessageStore, StoredMessage};
use crate::{error::StoreError, identity::Identity};

/// Append-only JSON lines file with an in-memory index.
///
/// Each accepted message is written as one line before it becomes visible to
/// readers. Opening the store replays the file into the index.
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<File>,
    index: MemoryStore,
}

impl JsonlStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let index = MemoryStore::new();
        let replayed = match fs::read_to_string(&path).await {
            Ok(contents) => replay(&index, &contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), replayed, "message log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn replay(index: &MemoryStore, contents: &str) -> Result<usize, StoreError> {
    let mut count = 0;
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message: StoredMessage =
            serde_json::from_str(line).map_err(|err| StoreError::Corrupt {
                line: number + 1,
                reason: err.to_string(),
            })?;
        index.insert(message);
        count += 1;
    }
    Ok(count)
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn append_message(
        &self,
        room: &str,
        sender: &Identity,
        content: &str,
    ) -> Result<StoredMessage, StoreError> {
        let message = MemoryStore::compose(room, sender, content);
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        // The file lock also orders index inserts, so replay matches what readers saw.
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(self.index.insert(message))
    }

    async fn fetch_recent_messages(
        &self,
        room: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.index.fetch_recent_messages(room, limit).await
    }
}
