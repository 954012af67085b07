//! Per-connection client state.
//!
//! A `Client` is owned by exactly one connection task; nothing else
//! ever takes a reference to it. Everything another task may need
//! (identity, write channel) is mirrored into the non-owning
//! `rooms::Member` handle at join time.
//!
//! The switch/var/picture/minigame caches are sparse: an absent entry
//! means "never observed on this connection", which is distinct from
//! zero. All of them die with the connection.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rooms::ClientId;

/// One displayed picture, keyed by its client-chosen id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Picture {
    pub name: String,
    pub x: i64,
    pub y: i64,
    pub map_x: i64,
    pub map_y: i64,
    pub pan_x: i64,
    pub pan_y: i64,
    pub magnify: i64,
    pub top_trans: i64,
    pub bottom_trans: i64,
    pub red: i64,
    pub green: i64,
    pub blue: i64,
    pub saturation: i64,
    pub effect_mode: i64,
    pub effect_power: i64,
    pub use_transparent_color: bool,
    pub fixed_to_map: bool,
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub uuid: String,
    /// Empty until the session `name` command runs; settable once.
    pub name: String,
    pub rank: i32,
    pub badge: String,
    pub muted: Arc<AtomicBool>,
    pub hidden: bool,

    pub map_id: Option<i32>,
    pub x: u32,
    pub y: u32,
    pub facing: u8,
    pub speed: u8,
    pub sprite_name: String,
    pub sprite_index: i32,
    pub system_name: String,
    /// Where the client came from, as reported by `ploc`: a 4-digit
    /// map id plus a comma-joined location name list.
    pub prev_map_id: String,
    pub prev_locations: String,
    /// Repeating screen flash: r, g, b, power, frames. All zero when
    /// no repeating flash is active.
    pub flash: [i64; 5],

    pub pictures: HashMap<i32, Picture>,
    pub switch_cache: HashMap<i32, bool>,
    pub var_cache: HashMap<i32, i64>,
    pub minigame_best: HashMap<String, i64>,

    /// Set when the current room has coordinate-gated triggers, so
    /// plain movement runs a coords-class condition check.
    pub sync_coords: bool,

    write_tx: mpsc::Sender<Bytes>,
}

impl Client {
    pub fn new(id: ClientId, uuid: String, rank: i32, badge: String, muted: bool, write_tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            uuid,
            name: String::new(),
            rank,
            badge,
            muted: Arc::new(AtomicBool::new(muted)),
            hidden: false,
            map_id: None,
            x: 0,
            y: 0,
            facing: 0,
            speed: 0,
            sprite_name: String::new(),
            sprite_index: 0,
            system_name: String::new(),
            prev_map_id: String::new(),
            prev_locations: String::new(),
            flash: [0; 5],
            pictures: HashMap::new(),
            switch_cache: HashMap::new(),
            var_cache: HashMap::new(),
            minigame_best: HashMap::new(),
            sync_coords: false,
            write_tx,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Queue a frame to this client only, best-effort.
    pub fn send(&self, payload: Vec<u8>) {
        if self.write_tx.try_send(Bytes::from(payload)).is_err() {
            debug!(client_id = self.id, "dropping direct frame for slow or gone client");
        }
    }

    pub fn write_tx(&self) -> mpsc::Sender<Bytes> {
        self.write_tx.clone()
    }
}

#[cfg(test)]
pub(crate) fn test_client(id: ClientId, uuid: &str) -> (Client, mpsc::Receiver<Bytes>) {
    let (tx, rx) = mpsc::channel(64);
    (
        Client::new(id, uuid.to_string(), 0, String::new(), false, tx),
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_start_empty_not_zeroed() {
        let (c, _rx) = test_client(1, "u-1");
        assert_eq!(c.switch_cache.get(&5), None);
        assert_eq!(c.var_cache.get(&5), None);
        assert!(c.pictures.is_empty());
    }

    #[tokio::test]
    async fn direct_send_reaches_only_this_client() {
        let (c, mut rx) = test_client(1, "u-1");
        c.send(b"hi".to_vec());
        assert_eq!(&rx.recv().await.unwrap()[..], b"hi");
    }
}
