use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Longest line accepted from a peer, newline excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Events a connection sends to the relay.
///
/// String fields that are missing, null or not strings read as empty, so a
/// sloppy client lands on the relay's validation path instead of tearing down
/// the connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientToServer {
    Authenticate {
        #[serde(default, deserialize_with = "lenient_string")]
        token: String,
    },
    JoinRoom {
        #[serde(default, deserialize_with = "lenient_string")]
        room: String,
    },
    LeaveRoom {
        #[serde(default, deserialize_with = "lenient_string")]
        room: String,
    },
    SendMessage {
        #[serde(default, deserialize_with = "lenient_string")]
        room: String,
        #[serde(default, deserialize_with = "lenient_string")]
        content: String,
    },
    TypingStart {
        #[serde(default, deserialize_with = "lenient_string")]
        room: String,
    },
    TypingStop {
        #[serde(default, deserialize_with = "lenient_string")]
        room: String,
    },
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        _ => Ok(String::new()),
    }
}

/// One line read from a client.
#[derive(Debug)]
pub enum Inbound {
    Event(ClientToServer),
    /// Valid JSON that names no known event.
    Unrecognized(serde_json::Error),
}

impl ClientToServer {
    /// Wire name of the event, used for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientToServer::Authenticate { .. } => "authenticate",
            ClientToServer::JoinRoom { .. } => "join-room",
            ClientToServer::LeaveRoom { .. } => "leave-room",
            ClientToServer::SendMessage { .. } => "send-message",
            ClientToServer::TypingStart { .. } => "typing-start",
            ClientToServer::TypingStop { .. } => "typing-stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerToClient {
    Authenticated { username: String },
    AuthError { message: String },
    PreviousMessages { room: String, messages: Vec<MessageView> },
    NewMessage { room: String, message: MessageView },
    UserJoined { username: String },
    UserLeft { username: String },
    LeftRoom { room: String },
    UserTyping { username: String },
    UserStoppedTyping { username: String },
    Error { message: String },
}

/// Display-safe shape of a stored message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub content: String,
    pub sender: String,
    pub created_at: DateTime<Utc>,
}

/// Reads the next event from a trusted peer. Lines are not length-capped,
/// since a history reply can be large; use [`read_inbound`] for clients.
pub async fn read_event<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line_bounded(reader, usize::MAX).await? {
        Some(line) => serde_json::from_str(&line).map(Some).map_err(to_io_error),
        None => Ok(None),
    }
}

/// Reads the next client line. Only text that is not JSON at all is an error;
/// JSON that fails to decode as an event comes back as [`Inbound::Unrecognized`].
pub async fn read_inbound<R>(reader: &mut R) -> io::Result<Option<Inbound>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(line) = read_line_bounded(reader, MAX_LINE_BYTES).await? else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(&line).map_err(to_io_error)?;
    Ok(Some(match serde_json::from_value(value) {
        Ok(event) => Inbound::Event(event),
        Err(err) => Inbound::Unrecognized(err),
    }))
}

async fn read_line_bounded<R>(reader: &mut R, max: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    // One JSON document per line; netcat and friends can speak it directly.
    let limit = (max as u64).saturating_add(1);
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = (&mut *reader).take(limit).read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if bytes > max && !line.ends_with('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line exceeds {max} bytes"),
            ));
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
}

pub async fn write_event<W, T>(writer: &mut W, event: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(event).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
