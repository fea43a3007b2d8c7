//! Protocol operations.
//!
//! Each operation takes the caller's [`Session`] by mutable reference, so the
//! events of one connection are handled strictly one after another while
//! different connections run concurrently. Room-scoped operations check
//! authentication before anything else and silently ignore events that name a
//! room other than the one the session is in.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info, warn};

use crate::{
    error::{RelayError, StoreError},
    identity::TokenVerifier,
    protocol::{ClientToServer, ServerToClient},
    registry::{Member, RoomRegistry},
    session::{ConnectionId, Outbox, Session},
    store::{MessageStore, StoredMessage},
};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// What happened to an accepted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Dropped without a reply: empty room or content, or a stale room name.
    Ignored,
}

pub struct Relay {
    verifier: Arc<dyn TokenVerifier>,
    store: Arc<dyn MessageStore>,
    registry: RoomRegistry,
    history_limit: usize,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(verifier: Arc<dyn TokenVerifier>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            verifier,
            store,
            registry: RoomRegistry::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Creates the unauthenticated session for a new connection.
    pub fn open_session(&self, outbox: Outbox) -> Session {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Session::new(id, outbox)
    }

    /// Routes one inbound event. A refusal is also replied to the caller.
    pub async fn dispatch(
        &self,
        session: &mut Session,
        event: ClientToServer,
    ) -> Result<Outcome, RelayError> {
        let kind = event.kind();
        let result = match event {
            ClientToServer::Authenticate { token } => self.authenticate(session, &token).await,
            ClientToServer::JoinRoom { room } => self.join(session, &room).await,
            ClientToServer::LeaveRoom { room } => self.leave(session, &room).await,
            ClientToServer::SendMessage { room, content } => {
                self.send(session, &room, &content).await
            }
            ClientToServer::TypingStart { room } => self.typing_start(session, &room).await,
            ClientToServer::TypingStop { room } => self.typing_stop(session, &room).await,
        };

        match &result {
            Ok(Outcome::Applied) => {}
            Ok(Outcome::Ignored) => debug!(conn = %session.id(), event = kind, "event ignored"),
            Err(err @ RelayError::Store { .. }) => {
                warn!(conn = %session.id(), event = kind, error = %err, "event failed");
                session.reply(err.to_reply());
            }
            Err(err) => {
                debug!(conn = %session.id(), event = kind, error = %err, "event rejected");
                session.reply(err.to_reply());
            }
        }
        result
    }

    pub async fn authenticate(
        &self,
        session: &mut Session,
        token: &str,
    ) -> Result<Outcome, RelayError> {
        let verified = self.verifier.verify(token).await?;
        if let Some(identity) = session.identity() {
            session.reply(ServerToClient::Authenticated {
                username: identity.username.clone(),
            });
            return Ok(Outcome::Ignored);
        }

        let identity = session.authenticate(verified);
        info!(conn = %session.id(), user = %identity.username, "session authenticated");
        session.reply(ServerToClient::Authenticated {
            username: identity.username,
        });
        Ok(Outcome::Applied)
    }

    pub async fn join(&self, session: &mut Session, room: &str) -> Result<Outcome, RelayError> {
        let identity = session.require_identity()?.clone();
        if room.trim().is_empty() {
            return Ok(Outcome::Ignored);
        }

        let member = Member::new(
            session.id(),
            identity.username.clone(),
            session.outbox().clone(),
        );
        let store = &self.store;
        let limit = self.history_limit;
        let room_name = room.to_string();
        let joined = self
            .registry
            .join(room, member, || async move {
                let history = store.fetch_recent_messages(&room_name, limit).await?;
                Ok::<_, StoreError>(ServerToClient::PreviousMessages {
                    room: room_name,
                    messages: history.iter().map(StoredMessage::to_view).collect(),
                })
            })
            .await;

        let previous = match joined {
            Ok(previous) => previous,
            Err(err) => {
                // A different room was already released before the fetch ran.
                if self.registry.room_of(session.id()).is_none() {
                    if let Some(previous) = session.exit() {
                        info!(conn = %session.id(), user = %identity.username, room = %previous, "left room");
                    }
                }
                return Err(RelayError::store("load room history", err));
            }
        };
        if let Some(previous) = previous {
            session.exit();
            info!(conn = %session.id(), user = %identity.username, room = %previous, "left room");
        }

        session.enter(room)?;
        info!(conn = %session.id(), user = %identity.username, room, "joined room");
        Ok(Outcome::Applied)
    }

    pub async fn leave(&self, session: &mut Session, room: &str) -> Result<Outcome, RelayError> {
        session.require_identity()?;
        if !session.is_current_room(room) {
            return Ok(Outcome::Ignored);
        }

        self.registry.leave(room, session.id()).await;
        session.exit();
        info!(conn = %session.id(), room, "left room");
        session.reply(ServerToClient::LeftRoom {
            room: room.to_string(),
        });
        Ok(Outcome::Applied)
    }

    pub async fn send(
        &self,
        session: &mut Session,
        room: &str,
        content: &str,
    ) -> Result<Outcome, RelayError> {
        let identity = session.require_identity()?.clone();
        let content = content.trim();
        if content.is_empty() || !session.is_current_room(room) {
            return Ok(Outcome::Ignored);
        }

        let store = &self.store;
        let room_name = room.to_string();
        let delivered = self
            .registry
            .publish(room, || async move {
                let stored = store.append_message(&room_name, &identity, content).await?;
                let mut message = stored.to_view();
                if stored.sender.is_none() {
                    message.sender = identity.username;
                }
                Ok::<_, StoreError>(ServerToClient::NewMessage {
                    room: room_name,
                    message,
                })
            })
            .await
            .map_err(|err| RelayError::store("send message", err))?;

        debug!(conn = %session.id(), room, delivered, "message relayed");
        Ok(Outcome::Applied)
    }

    pub async fn typing_start(
        &self,
        session: &mut Session,
        room: &str,
    ) -> Result<Outcome, RelayError> {
        self.typing(session, room, true).await
    }

    pub async fn typing_stop(
        &self,
        session: &mut Session,
        room: &str,
    ) -> Result<Outcome, RelayError> {
        self.typing(session, room, false).await
    }

    async fn typing(
        &self,
        session: &mut Session,
        room: &str,
        started: bool,
    ) -> Result<Outcome, RelayError> {
        let username = session.require_identity()?.username.clone();
        if !session.is_current_room(room) {
            return Ok(Outcome::Ignored);
        }

        let event = if started {
            ServerToClient::UserTyping { username }
        } else {
            ServerToClient::UserStoppedTyping { username }
        };
        self.registry
            .broadcast(room, Some(session.id()), event)
            .await;
        Ok(Outcome::Applied)
    }

    /// Tears down a closed connection. Never fails.
    pub async fn disconnect(&self, session: Session) {
        match self.registry.remove_everywhere(session.id()).await {
            Some((room, member)) => {
                info!(conn = %session.id(), user = %member.username, room = %room, "disconnected from room");
            }
            None => debug!(conn = %session.id(), "disconnected"),
        }
    }
}
