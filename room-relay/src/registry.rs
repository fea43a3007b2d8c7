//! Room membership and fan-out.
//!
//! Each room is a member map behind its own async mutex. Every membership
//! change and every broadcast for a room happens while that mutex is held, so
//! the order in which tasks acquire it is the order every member observes.
//! A side index maps each connection to the one room it occupies.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::{Mutex as RoomLock, OwnedMutexGuard};
use tracing::debug;

use crate::{
    protocol::ServerToClient,
    session::{ConnectionId, Outbox},
};

/// A connection as seen by the rooms it joins.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: ConnectionId,
    pub username: String,
    outbox: Outbox,
}

impl Member {
    pub fn new(id: ConnectionId, username: impl Into<String>, outbox: Outbox) -> Self {
        Self {
            id,
            username: username.into(),
            outbox,
        }
    }

    fn deliver(&self, event: ServerToClient) -> bool {
        if let Err(err) = self.outbox.push(event) {
            debug!(conn = %self.id, %err, "skipping delivery");
            return false;
        }
        true
    }
}

type Members = BTreeMap<ConnectionId, Member>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Arc<RoomLock<Members>>>>,
    locations: Mutex<HashMap<ConnectionId, String>>,
}

struct RoomGuard<'a> {
    registry: &'a RoomRegistry,
    name: String,
    members: OwnedMutexGuard<Members>,
}

impl RoomGuard<'_> {
    /// Returns true when the member was not already present.
    fn admit(&mut self, member: Member) -> bool {
        let id = member.id;
        let fresh = self.members.insert(id, member).is_none();
        self.registry.locations.lock().insert(id, self.name.clone());
        fresh
    }

    fn evict(&mut self, id: ConnectionId) -> Option<Member> {
        let member = self.members.remove(&id)?;
        let mut locations = self.registry.locations.lock();
        if locations.get(&id) == Some(&self.name) {
            locations.remove(&id);
        }
        Some(member)
    }

    fn members_except(&self, excluded: Option<ConnectionId>) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(move |member| Some(member.id) != excluded)
    }

    fn broadcast(&self, excluded: Option<ConnectionId>, event: &ServerToClient) -> usize {
        self.members_except(excluded)
            .filter(|member| member.deliver(event.clone()))
            .count()
    }

    fn release(self) {
        let RoomGuard {
            registry,
            name,
            members,
        } = self;
        drop(members);
        registry.prune(&name);
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `member` into `room`.
    ///
    /// A different room the member occupied is left first, with the usual
    /// `user-left` notice. `welcome` runs under the new room's lock before the
    /// member is admitted; its event is queued to the member ahead of anything
    /// the room broadcasts afterwards. If it fails, the member is not admitted.
    /// Returns the room that was left, if any.
    pub async fn join<F, Fut, E>(
        &self,
        room: &str,
        member: Member,
        welcome: F,
    ) -> Result<Option<String>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ServerToClient, E>>,
    {
        let id = member.id;
        let previous = self.room_of(id).filter(|current| current != room);
        if let Some(previous) = &previous {
            self.leave(previous, id).await;
        }

        let mut guard = self.lock(room).await;
        let greeting = match welcome().await {
            Ok(event) => event,
            Err(err) => {
                guard.release();
                return Err(err);
            }
        };

        member.deliver(greeting);
        let notice = ServerToClient::UserJoined {
            username: member.username.clone(),
        };
        if guard.admit(member) {
            guard.broadcast(Some(id), &notice);
        }
        guard.release();

        Ok(previous)
    }

    /// Removes `id` from `room` and tells the remaining members.
    pub async fn leave(&self, room: &str, id: ConnectionId) -> Option<Member> {
        let mut guard = self.lock_existing(room).await?;
        let member = guard.evict(id);
        if let Some(member) = &member {
            guard.broadcast(
                None,
                &ServerToClient::UserLeft {
                    username: member.username.clone(),
                },
            );
        }
        guard.release();
        member
    }

    /// Drops `id` from whatever room holds it. Safe to call when it holds none.
    pub async fn remove_everywhere(&self, id: ConnectionId) -> Option<(String, Member)> {
        let room = self.room_of(id)?;
        let member = self.leave(&room, id).await?;
        Some((room, member))
    }

    /// Snapshot of the members of `room` other than `excluded`.
    pub async fn members_except(&self, room: &str, excluded: ConnectionId) -> Vec<ConnectionId> {
        let Some(guard) = self.lock_existing(room).await else {
            return Vec::new();
        };
        let ids = guard
            .members_except(Some(excluded))
            .map(|member| member.id)
            .collect();
        guard.release();
        ids
    }

    /// Queues `event` for every member of `room` except `excluded`.
    /// Returns how many members it reached.
    pub async fn broadcast(
        &self,
        room: &str,
        excluded: Option<ConnectionId>,
        event: ServerToClient,
    ) -> usize {
        let Some(guard) = self.lock_existing(room).await else {
            return 0;
        };
        let delivered = guard.broadcast(excluded, &event);
        guard.release();
        delivered
    }

    /// Runs `produce` under the room lock and fans its event out to every
    /// member, the producer's own connection included. Nothing is sent when
    /// `produce` fails.
    pub async fn publish<F, Fut, E>(&self, room: &str, produce: F) -> Result<usize, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ServerToClient, E>>,
    {
        let guard = self.lock(room).await;
        let event = match produce().await {
            Ok(event) => event,
            Err(err) => {
                guard.release();
                return Err(err);
            }
        };
        let delivered = guard.broadcast(None, &event);
        guard.release();
        Ok(delivered)
    }

    pub fn room_of(&self, id: ConnectionId) -> Option<String> {
        self.locations.lock().get(&id).cloned()
    }

    pub async fn member_count(&self, room: &str) -> usize {
        let Some(guard) = self.lock_existing(room).await else {
            return 0;
        };
        let count = guard.members.len();
        guard.release();
        count
    }

    /// Number of rooms currently tracked, empty ones still in use included.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    async fn lock(&self, room: &str) -> RoomGuard<'_> {
        let cell = Arc::clone(self.rooms.lock().entry(room.to_string()).or_default());
        self.guard(room, cell).await
    }

    async fn lock_existing(&self, room: &str) -> Option<RoomGuard<'_>> {
        let cell = self.rooms.lock().get(room).cloned()?;
        Some(self.guard(room, cell).await)
    }

    async fn guard(&self, room: &str, cell: Arc<RoomLock<Members>>) -> RoomGuard<'_> {
        RoomGuard {
            registry: self,
            name: room.to_string(),
            members: cell.lock_owned().await,
        }
    }

    /// Forgets an empty room nobody else is holding or waiting on.
    fn prune(&self, room: &str) {
        let mut rooms = self.rooms.lock();
        let idle = rooms.get(room).is_some_and(|cell| {
            Arc::strong_count(cell) == 1 && cell.try_lock().is_ok_and(|members| members.is_empty())
        });
        if idle {
            rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;
    use crate::session::{Inbox, OUTBOX_CAPACITY, outbox};

    fn member(id: u64, name: &str) -> (Member, Inbox) {
        let (tx, rx) = outbox(OUTBOX_CAPACITY);
        (Member::new(ConnectionId::new(id), name, tx), rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerToClient> {
        let mut events = Vec::new();
        while let Some(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn join_quietly(registry: &RoomRegistry, room: &str, member: Member) -> Option<String> {
        let room_name = room.to_string();
        registry
            .join(room, member, || async move {
                Ok::<_, Infallible>(ServerToClient::PreviousMessages {
                    room: room_name,
                    messages: Vec::new(),
                })
            })
            .await
            .expect("infallible welcome")
    }

    #[tokio::test]
    async fn join_welcomes_member_and_notifies_others() {
        let registry = RoomRegistry::new();
        let (alice, mut alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");

        join_quietly(&registry, "rust", alice).await;
        join_quietly(&registry, "rust", bob).await;

        assert_eq!(
            drain(&mut alice_rx),
            vec![
                ServerToClient::PreviousMessages {
                    room: "rust".into(),
                    messages: vec![]
                },
                ServerToClient::UserJoined {
                    username: "bob".into()
                },
            ]
        );
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(registry.member_count("rust").await, 2);
    }

    #[tokio::test]
    async fn joining_second_room_leaves_the_first() {
        let registry = RoomRegistry::new();
        let (alice, _alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");
        let alice_id = alice.id;

        join_quietly(&registry, "a", bob).await;
        join_quietly(&registry, "a", alice.clone()).await;
        drain(&mut bob_rx);

        let previous = join_quietly(&registry, "b", alice).await;
        assert_eq!(previous.as_deref(), Some("a"));
        assert_eq!(registry.room_of(alice_id).as_deref(), Some("b"));
        assert!(
            !registry
                .members_except("a", ConnectionId::new(99))
                .await
                .contains(&alice_id)
        );
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerToClient::UserLeft {
                username: "alice".into()
            }]
        );
    }

    #[tokio::test]
    async fn failed_welcome_does_not_admit() {
        let registry = RoomRegistry::new();
        let (alice, mut alice_rx) = member(1, "alice");

        let result = registry
            .join("rust", alice, || async { Err::<ServerToClient, _>("boom") })
            .await;

        assert_eq!(result, Err("boom"));
        assert_eq!(registry.room_of(ConnectionId::new(1)), None);
        assert_eq!(registry.member_count("rust").await, 0);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn rejoining_same_room_does_not_renotify() {
        let registry = RoomRegistry::new();
        let (alice, _alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");

        join_quietly(&registry, "rust", bob).await;
        join_quietly(&registry, "rust", alice.clone()).await;
        drain(&mut bob_rx);

        let previous = join_quietly(&registry, "rust", alice).await;
        assert_eq!(previous, None);
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(registry.member_count("rust").await, 2);
    }

    #[tokio::test]
    async fn members_except_excludes_only_the_given_connection() {
        let registry = RoomRegistry::new();
        for (id, name) in [(1, "a"), (2, "b"), (3, "c")] {
            let (m, _rx) = member(id, name);
            join_quietly(&registry, "rust", m).await;
        }

        let others = registry.members_except("rust", ConnectionId::new(2)).await;
        assert_eq!(others, vec![ConnectionId::new(1), ConnectionId::new(3)]);
        assert!(registry.members_except("nowhere", ConnectionId::new(1)).await.is_empty());
    }

    #[tokio::test]
    async fn leave_and_remove_everywhere_are_idempotent() {
        let registry = RoomRegistry::new();
        let (alice, _rx) = member(1, "alice");
        let id = alice.id;
        join_quietly(&registry, "rust", alice).await;

        let (room, removed) = registry.remove_everywhere(id).await.expect("was a member");
        assert_eq!(room, "rust");
        assert_eq!(removed.username, "alice");

        assert!(registry.remove_everywhere(id).await.is_none());
        assert!(registry.leave("rust", id).await.is_none());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn publish_reaches_everyone_and_failure_sends_nothing() {
        let registry = RoomRegistry::new();
        let (alice, mut alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");
        join_quietly(&registry, "rust", alice).await;
        join_quietly(&registry, "rust", bob).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let failed = registry
            .publish("rust", || async { Err::<ServerToClient, _>("store down") })
            .await;
        assert_eq!(failed, Err("store down"));
        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());

        let event = ServerToClient::UserTyping {
            username: "x".into(),
        };
        let sent = event.clone();
        let delivered = registry
            .publish("rust", || async move { Ok::<_, Infallible>(sent) })
            .await
            .expect("infallible");
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut alice_rx), vec![event.clone()]);
        assert_eq!(drain(&mut bob_rx), vec![event]);
    }

    #[tokio::test]
    async fn broadcast_skips_closed_outboxes() {
        let registry = RoomRegistry::new();
        let (alice, alice_rx) = member(1, "alice");
        let (bob, mut bob_rx) = member(2, "bob");
        join_quietly(&registry, "rust", alice).await;
        join_quietly(&registry, "rust", bob).await;
        drop(alice_rx);
        drain(&mut bob_rx);

        let delivered = registry
            .broadcast(
                "rust",
                None,
                ServerToClient::UserTyping {
                    username: "carol".into(),
                },
            )
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(registry.broadcast("empty", None, ServerToClient::UserTyping { username: "x".into() }).await, 0);
    }
}
