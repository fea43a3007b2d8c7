//! Per-connection state.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::{
    select,
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
    },
};
use tracing::debug;

use crate::{error::RelayError, identity::Identity, protocol::ServerToClient};

/// Events a connection may have queued before it counts as not reading.
pub const OUTBOX_CAPACITY: usize = 128;

#[derive(Debug, Default)]
struct Overflow {
    tripped: AtomicBool,
    notify: Notify,
}

/// Sending half of a connection's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerToClient>,
    overflow: Arc<Overflow>,
}

/// Receiving half, drained by the connection's writer.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<ServerToClient>,
    overflow: Arc<Overflow>,
}

/// Creates a connection queue holding at most `capacity` events.
pub fn outbox(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity);
    let overflow = Arc::new(Overflow::default());
    (
        Outbox {
            tx,
            overflow: Arc::clone(&overflow),
        },
        Inbox { rx, overflow },
    )
}

impl Outbox {
    /// Queues `event` without waiting. A full queue marks the connection as
    /// overflowed, which ends its inbox; the event is dropped.
    pub fn push(&self, event: ServerToClient) -> Result<(), TrySendError<ServerToClient>> {
        let result = self.tx.try_send(event);
        if let Err(TrySendError::Full(_)) = &result {
            self.overflow.tripped.store(true, Ordering::Release);
            self.overflow.notify.notify_one();
        }
        result
    }
}

impl Inbox {
    /// Next queued event. `None` once every outbox is gone or the queue overflowed.
    pub async fn recv(&mut self) -> Option<ServerToClient> {
        if self.overflowed() {
            return None;
        }
        select! {
            biased;
            _ = self.overflow.notify.notified() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> Option<ServerToClient> {
        if self.overflowed() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.tripped.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A room can only be held by an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated {
        identity: Identity,
        room: Option<String>,
    },
}

/// One live connection: its address, its outbound queue, and where it stands.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    outbox: Outbox,
    state: SessionState,
}

impl Session {
    pub fn new(id: ConnectionId, outbox: Outbox) -> Self {
        Self {
            id,
            outbox,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated { .. })
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            SessionState::Authenticated { identity, .. } => Some(identity),
            SessionState::Unauthenticated => None,
        }
    }

    pub fn current_room(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { room, .. } => room.as_deref(),
            SessionState::Unauthenticated => None,
        }
    }

    pub fn is_current_room(&self, room: &str) -> bool {
        !room.is_empty() && self.current_room() == Some(room)
    }

    pub fn require_identity(&self) -> Result<&Identity, RelayError> {
        self.identity().ok_or(RelayError::AuthRequired)
    }

    /// Enters the authenticated state. An identity already in place is kept.
    pub fn authenticate(&mut self, identity: Identity) -> Identity {
        match &self.state {
            SessionState::Authenticated {
                identity: existing, ..
            } => existing.clone(),
            SessionState::Unauthenticated => {
                self.state = SessionState::Authenticated {
                    identity: identity.clone(),
                    room: None,
                };
                identity
            }
        }
    }

    pub(crate) fn enter(&mut self, name: &str) -> Result<(), RelayError> {
        match &mut self.state {
            SessionState::Authenticated { room, .. } => {
                *room = Some(name.to_string());
                Ok(())
            }
            SessionState::Unauthenticated => Err(RelayError::AuthRequired),
        }
    }

    pub(crate) fn exit(&mut self) -> Option<String> {
        match &mut self.state {
            SessionState::Authenticated { room, .. } => room.take(),
            SessionState::Unauthenticated => None,
        }
    }

    /// Queues an event for this connection only.
    pub fn reply(&self, event: ServerToClient) {
        if let Err(err) = self.outbox.push(event) {
            debug!(conn = %self.id, %err, "dropping reply");
        }
    }
}
