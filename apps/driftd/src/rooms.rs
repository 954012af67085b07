//! Room membership and fan-out.
//!
//! A room is one live map instance. The registry maps room id to an
//! `Arc<Room>`; the outer map lock is held only long enough to fetch
//! or insert that `Arc`, and each room guards its own member table, so
//! traffic in unrelated rooms never serializes.
//!
//! Members are non-owning handles: the connection task owns the real
//! `Client`, a `Member` carries just the identity bits other tasks
//! need plus the write channel. Broadcast snapshots the member set
//! under the room lock and delivers after releasing it; delivery is
//! best-effort per member (a full or closed channel skips that member
//! and never fails the broadcast).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

pub type ClientId = u64;

#[derive(Debug, Clone)]
pub struct Member {
    pub client_id: ClientId,
    pub uuid: String,
    pub name: String,
    pub rank: i32,
    pub hidden: bool,
    pub muted: Arc<std::sync::atomic::AtomicBool>,
    pub write_tx: mpsc::Sender<Bytes>,
    pub disconnect_tx: watch::Sender<bool>,
}

impl Member {
    /// Queue one frame, best-effort.
    pub fn send(&self, payload: Bytes) {
        if self.write_tx.try_send(payload).is_err() {
            debug!(client_id = self.client_id, "dropping frame for slow or gone client");
        }
    }
}

#[derive(Debug, Default)]
pub struct Room {
    members: Mutex<HashMap<ClientId, Member>>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<i32, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn room(&self, map_id: i32) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        rooms.entry(map_id).or_default().clone()
    }

    async fn room_if_exists(&self, map_id: i32) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(&map_id).cloned()
    }

    pub async fn join(&self, map_id: i32, member: Member) {
        let room = self.room(map_id).await;
        let mut members = room.members.lock().await;
        members.insert(member.client_id, member);
    }

    pub async fn leave(&self, map_id: i32, client_id: ClientId) {
        let Some(room) = self.room_if_exists(map_id).await else {
            return;
        };
        let now_empty = {
            let mut members = room.members.lock().await;
            members.remove(&client_id);
            members.is_empty()
        };
        if now_empty {
            let mut rooms = self.rooms.lock().await;
            // Re-check under the outer lock: someone may have joined since.
            if let Some(r) = rooms.get(&map_id) {
                if r.members.lock().await.is_empty() {
                    rooms.remove(&map_id);
                }
            }
        }
    }

    /// Send `payload` to every member of `map_id` except `exclude`.
    ///
    /// `exclude: None` reaches everyone, sender included (used for
    /// state echoes). Per-member delivery order matches the order of
    /// `broadcast`/direct-send calls; no ordering holds across members.
    pub async fn broadcast(&self, map_id: i32, exclude: Option<ClientId>, payload: Vec<u8>) {
        let Some(room) = self.room_if_exists(map_id).await else {
            return;
        };
        let targets: Vec<Member> = {
            let members = room.members.lock().await;
            members
                .values()
                .filter(|m| Some(m.client_id) != exclude)
                .cloned()
                .collect()
        };
        let payload = Bytes::from(payload);
        for m in targets {
            m.send(payload.clone());
        }
    }

    /// Snapshot of the current members of a room.
    pub async fn members(&self, map_id: i32) -> Vec<Member> {
        match self.room_if_exists(map_id).await {
            Some(room) => room.members.lock().await.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Update the stored handle for a member in place (name set,
    /// hidden toggle). No-op if the client is not in the room.
    pub async fn update_member(&self, map_id: i32, client_id: ClientId, f: impl FnOnce(&mut Member)) {
        let Some(room) = self.room_if_exists(map_id).await else {
            return;
        };
        let mut members = room.members.lock().await;
        if let Some(m) = members.get_mut(&client_id) {
            f(m);
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }
}

#[cfg(test)]
pub(crate) fn test_member(client_id: ClientId, uuid: &str) -> (Member, mpsc::Receiver<Bytes>) {
    let (write_tx, write_rx) = mpsc::channel(32);
    let (disconnect_tx, _) = watch::channel(false);
    (
        Member {
            client_id,
            uuid: uuid.to_string(),
            name: String::new(),
            rank: 0,
            hidden: false,
            muted: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            write_tx,
            disconnect_tx,
        },
        write_rx,
    )
}
