#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header, encode};
use room_relay::{
    identity::{Claims, JwtVerifier},
    protocol::ServerToClient,
    relay::Relay,
    session::{Inbox, OUTBOX_CAPACITY, Session, outbox},
    store::{MemoryStore, MessageStore},
};

pub const SECRET: &[u8] = b"integration-test-secret";

/// Mints a token the way the credential service does.
pub fn mint_token(user_id: &str, username: &str) -> String {
    let claims = Claims {
        user_id: user_id.to_string(),
        username: username.to_string(),
        exp: (Utc::now().timestamp() + 3600) as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET),
    )
    .expect("encode token")
}

pub fn token_for(username: &str) -> String {
    mint_token(&format!("id-{username}"), username)
}

/// One in-process connection: its session plus the receiving end of its outbox.
pub struct Peer {
    pub session: Session,
    pub rx: Inbox,
}

impl Peer {
    pub fn drain(&mut self) -> Vec<ServerToClient> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn relay_with_store(store: Arc<dyn MessageStore>) -> Arc<Relay> {
    Arc::new(Relay::new(Arc::new(JwtVerifier::new(SECRET)), store))
}

pub fn memory_relay() -> (Arc<Relay>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (relay_with_store(store.clone()), store)
}

pub fn connect(relay: &Relay) -> Peer {
    connect_with_capacity(relay, OUTBOX_CAPACITY)
}

pub fn connect_with_capacity(relay: &Relay, capacity: usize) -> Peer {
    let (tx, rx) = outbox(capacity);
    Peer {
        session: relay.open_session(tx),
        rx,
    }
}

/// Connects and authenticates, discarding the `authenticated` reply.
pub async fn login(relay: &Relay, username: &str) -> Peer {
    let mut peer = connect(relay);
    relay
        .authenticate(&mut peer.session, &token_for(username))
        .await
        .expect("authenticate");
    peer.drain();
    peer
}

/// Logs in and joins `room`, discarding the replies.
pub async fn joined(relay: &Relay, username: &str, room: &str) -> Peer {
    let mut peer = login(relay, username).await;
    relay
        .join(&mut peer.session, room)
        .await
        .expect("join room");
    peer.drain();
    peer
}
