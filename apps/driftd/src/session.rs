//! Cross-room identity and social commands.
//!
//! The directory tracks every identified client regardless of room,
//! using the same non-owning handle type the rooms do. Global and
//! party chat fan out through it; the admin surface uses it to kick.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::debug;

use driftproto::{build_msg, expect_len, CmdError, Part};

use crate::assets::is_ok_name;
use crate::client::Client;
use crate::rooms::{ClientId, Member, RoomRegistry};
use crate::store::{EventLocationRec, PlayerStore};

pub const MAX_NAME_LEN: usize = 12;
pub const MAX_CHAT_LEN: usize = 150;

/// Map the host deployment assigns when a player has no incomplete
/// event location.
const HOST_DEFAULT_EVENT_MAP: i32 = 179;

#[derive(Debug, Default)]
pub struct Directory {
    clients: Mutex<HashMap<ClientId, Member>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, member: Member) {
        self.clients.lock().await.insert(member.client_id, member);
    }

    pub async fn remove(&self, client_id: ClientId) {
        self.clients.lock().await.remove(&client_id);
    }

    pub async fn get(&self, client_id: ClientId) -> Option<Member> {
        self.clients.lock().await.get(&client_id).cloned()
    }

    pub async fn by_uuid(&self, uuid: &str) -> Option<Member> {
        self.clients
            .lock()
            .await
            .values()
            .find(|m| m.uuid == uuid)
            .cloned()
    }

    pub async fn update(&self, client_id: ClientId, f: impl FnOnce(&mut Member)) {
        if let Some(m) = self.clients.lock().await.get_mut(&client_id) {
            f(m);
        }
    }

    /// Best-effort fan-out to every identified client.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        let targets: Vec<Member> = self.clients.lock().await.values().cloned().collect();
        let payload = Bytes::from(payload);
        for m in targets {
            m.send(payload.clone());
        }
    }

    /// Signal the connection task for this player to drop the link.
    pub async fn kick(&self, uuid: &str) -> bool {
        match self.by_uuid(uuid).await {
            Some(m) => m.disconnect_tx.send(true).is_ok(),
            None => false,
        }
    }
}

/// `name <name>`: claim a display name, once per connection.
pub async fn handle_name(
    store: &Mutex<PlayerStore>,
    rooms: &RoomRegistry,
    directory: &Directory,
    client: &mut Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    if !client.name.is_empty() {
        return Err(CmdError::Rejected("name already set").into());
    }
    let name = fields[1];
    if name.len() > MAX_NAME_LEN || !is_ok_name(name) {
        return Err(CmdError::BadName { field: "name" }.into());
    }

    client.name = name.to_string();
    store.lock().await.set_name(&client.uuid, name)?;
    directory
        .update(client.id, |m| m.name = client.name.clone())
        .await;
    if let Some(map_id) = client.map_id {
        rooms
            .update_member(map_id, client.id, |m| m.name = client.name.clone())
            .await;
        rooms
            .broadcast(
                map_id,
                Some(client.id),
                build_msg(&[
                    Part::Str("name"),
                    Part::Int(client.id as i64),
                    Part::Str(&client.name),
                ]),
            )
            .await;
    }
    Ok(())
}

/// `i`: self-info echo.
pub async fn handle_info(
    store: &Mutex<PlayerStore>,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 1)?;
    let rec = store.lock().await.get_player(&client.uuid)?;
    client.send(build_msg(&[
        Part::Str("i"),
        Part::Str(&client.uuid),
        Part::Str(&client.name),
        Part::Int(i64::from(client.rank)),
        Part::Str(&client.badge),
        Part::Int(i64::from(rec.badge_slot_rows)),
        Part::Int(i64::from(rec.badge_slot_cols)),
    ]));
    Ok(())
}

pub(crate) fn checked_chat_msg(raw: &str) -> Result<&str, CmdError> {
    let msg = raw.trim();
    if msg.is_empty() {
        return Err(CmdError::Rejected("empty chat message"));
    }
    if msg.chars().count() > MAX_CHAT_LEN {
        return Err(CmdError::OutOfRange { field: "msg" });
    }
    Ok(msg)
}

/// `gsay <msg>`: global chat to every identified client. Each message
/// is a presence tuple followed by the chat line with the sender's
/// location context.
pub async fn handle_gsay(
    directory: &Directory,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    if client.name.is_empty() || client.system_name.is_empty() {
        return Err(CmdError::Rejected("global chat before name and appearance set").into());
    }
    let msg = checked_chat_msg(fields[1])?;
    if client.is_muted() {
        debug!(client_id = client.id, "dropping global chat from muted client");
        return Ok(());
    }
    directory
        .broadcast(build_msg(&[
            Part::Str("gp"),
            Part::Str(&client.uuid),
            Part::Str(&client.name),
            Part::Str(&client.system_name),
            Part::Int(i64::from(client.rank)),
            Part::Str(&client.badge),
        ]))
        .await;
    directory
        .broadcast(build_msg(&[
            Part::Str("gsay"),
            Part::Str(&client.uuid),
            Part::Int(client.map_id.map(i64::from).unwrap_or(-1)),
            Part::Str(&client.prev_map_id),
            Part::Str(&client.prev_locations),
            Part::Int(i64::from(client.x)),
            Part::Int(i64::from(client.y)),
            Part::Str(msg),
        ]))
        .await;
    Ok(())
}

/// `psay <msg>`: chat relayed to the sender's party members.
pub async fn handle_psay(
    store: &Mutex<PlayerStore>,
    directory: &Directory,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let msg = checked_chat_msg(fields[1])?;
    if client.is_muted() {
        debug!(client_id = client.id, "dropping party chat from muted client");
        return Ok(());
    }
    let Some(party) = store.lock().await.party_for(&client.uuid) else {
        return Err(CmdError::Rejected("not in a party").into());
    };
    let payload = Bytes::from(build_msg(&[
        Part::Str("psay"),
        Part::Str(&client.uuid),
        Part::Str(&client.name),
        Part::Str(msg),
    ]));
    for uuid in &party.members {
        if let Some(m) = directory.by_uuid(uuid).await {
            m.send(payload.clone());
        }
    }
    Ok(())
}

/// `pt`: party snapshot. The password travels only to the owner.
pub async fn handle_pt(
    store: &Mutex<PlayerStore>,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 1)?;
    let Some(party) = store.lock().await.party_for(&client.uuid) else {
        return Err(CmdError::Rejected("not in a party").into());
    };
    let password = if party.owner_uuid == client.uuid {
        party.password.as_str()
    } else {
        ""
    };
    client.send(build_msg(&[
        Part::Str("pt"),
        Part::Int(i64::from(party.id)),
        Part::Str(&party.name),
        Part::Str(&party.owner_uuid),
        Part::Str(password),
        Part::StrList(&party.members),
    ]));
    Ok(())
}

/// `ep`: current event-period snapshot; `-1` when none is active.
pub async fn handle_ep(
    store: &Mutex<PlayerStore>,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 1)?;
    let period = store.lock().await.event_period();
    match period {
        Some(p) => client.send(build_msg(&[
            Part::Str("ep"),
            Part::Int(i64::from(p.id)),
            Part::Int(p.ends_unix as i64),
        ])),
        None => client.send(build_msg(&[Part::Str("ep"), Part::Int(-1), Part::Int(0)])),
    }
    Ok(())
}

/// `el`: event locations for this player in the current period. On
/// the host deployment a default location is provisioned when none is
/// left incomplete.
pub async fn handle_el(
    store: &Mutex<PlayerStore>,
    host_profile: bool,
    client: &Client,
    fields: &[&str],
) -> anyhow::Result<()> {
    expect_len(fields, 1)?;
    let mut s = store.lock().await;
    let Some(period) = s.event_period() else {
        client.send(build_msg(&[Part::Str("el"), Part::Int(-1)]));
        return Ok(());
    };
    let mut locations = s.event_locations(&client.uuid, period.id);
    if host_profile && locations.iter().all(|l| l.complete) {
        let rec = EventLocationRec {
            period_id: period.id,
            map_id: HOST_DEFAULT_EVENT_MAP,
            title: String::new(),
            complete: false,
        };
        s.add_event_location(&client.uuid, rec.clone())?;
        locations.push(rec);
    }
    drop(s);

    let map_ids: Vec<i64> = locations.iter().map(|l| i64::from(l.map_id)).collect();
    let titles: Vec<String> = locations.iter().map(|l| l.title.clone()).collect();
    let completes: Vec<i64> = locations.iter().map(|l| i64::from(l.complete)).collect();
    client.send(build_msg(&[
        Part::Str("el"),
        Part::Int(i64::from(period.id)),
        Part::IntList(&map_ids),
        Part::StrList(&titles),
        Part::IntList(&completes),
    ]));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;
    use crate::rooms::test_member;
    use crate::store::{PartyRec, PlayerStore};
    use tokio::sync::mpsc;

    fn decode(b: Bytes) -> Vec<String> {
        let s = String::from_utf8(b.to_vec()).unwrap();
        driftproto::split_msg(&s)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn drain(rx: &mut mpsc::Receiver<Bytes>) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Ok(b) = rx.try_recv() {
            out.push(decode(b));
        }
        out
    }

    #[tokio::test]
    async fn name_is_settable_exactly_once() {
        let store = Mutex::new(PlayerStore::in_memory());
        let rooms = RoomRegistry::new();
        let directory = Directory::new();
        let (mut c, _rx) = test_client(1, "u-1");

        handle_name(&store, &rooms, &directory, &mut c, &["name", "Traveler"])
            .await
            .unwrap();
        assert_eq!(c.name, "Traveler");

        let err = handle_name(&store, &rooms, &directory, &mut c, &["name", "Other"])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already set"));
        assert_eq!(c.name, "Traveler");
    }

    #[tokio::test]
    async fn name_must_be_short_alphanumeric() {
        let store = Mutex::new(PlayerStore::in_memory());
        let rooms = RoomRegistry::new();
        let directory = Directory::new();
        let (mut c, _rx) = test_client(1, "u-1");

        assert!(
            handle_name(&store, &rooms, &directory, &mut c, &["name", "has space"])
                .await
                .is_err()
        );
        assert!(
            handle_name(&store, &rooms, &directory, &mut c, &["name", "waytoolongname"])
                .await
                .is_err()
        );
        assert!(c.name.is_empty());
    }

    #[tokio::test]
    async fn global_chat_requires_name_and_appearance() {
        let directory = Directory::new();
        let (mut c, _rx) = test_client(1, "u-1");
        let (m, mut peer_rx) = test_member(2, "u-2");
        directory.insert(m).await;

        let err = handle_gsay(&directory, &c, &["gsay", "hello"]).await.unwrap_err();
        assert!(err.to_string().contains("name"));
        assert!(peer_rx.try_recv().is_err());

        // A name alone is not enough; the appearance gate holds too.
        c.name = "Traveler".to_string();
        assert!(handle_gsay(&directory, &c, &["gsay", "hello"]).await.is_err());

        c.system_name = "classic".to_string();
        c.map_id = Some(7);
        c.prev_map_id = "0042".to_string();
        handle_gsay(&directory, &c, &["gsay", "hello"]).await.unwrap();
        let got = drain(&mut peer_rx);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0][0], "gp");
        assert_eq!(got[0][2], "Traveler");
        assert_eq!(got[1][0], "gsay");
        assert_eq!(got[1][2], "7");
        assert_eq!(got[1][3], "0042");
        assert_eq!(got[1][7], "hello");
    }

    #[tokio::test]
    async fn muted_global_chat_is_a_soft_drop() {
        let directory = Directory::new();
        let (mut c, _rx) = test_client(1, "u-1");
        c.name = "Traveler".to_string();
        c.system_name = "classic".to_string();
        c.muted.store(true, std::sync::atomic::Ordering::Relaxed);
        let (m, mut peer_rx) = test_member(2, "u-2");
        directory.insert(m).await;

        handle_gsay(&directory, &c, &["gsay", "hello"]).await.unwrap();
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn party_chat_stays_in_the_party() {
        let store = Mutex::new(PlayerStore::in_memory());
        store.lock().await.insert_party_for_test(PartyRec {
            id: 1,
            name: "explorers".to_string(),
            owner_uuid: "u-1".to_string(),
            password: "pw".to_string(),
            members: vec!["u-1".to_string(), "u-2".to_string()],
        });
        let directory = Directory::new();
        let (mut c, mut rx1) = test_client(1, "u-1");
        c.name = "Owner".to_string();
        let (m2, mut rx2) = test_member(2, "u-2");
        let (m3, mut rx3) = test_member(3, "u-3");
        let (m1, _) = test_member(1, "u-1");
        // Sender's own directory entry uses its real channel.
        let m1 = Member {
            write_tx: c.write_tx(),
            ..m1
        };
        directory.insert(m1).await;
        directory.insert(m2).await;
        directory.insert(m3).await;

        handle_psay(&store, &directory, &c, &["psay", "this way"])
            .await
            .unwrap();
        assert_eq!(drain(&mut rx1).len(), 1);
        assert_eq!(drain(&mut rx2).len(), 1);
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn party_chat_without_party_is_rejected() {
        let store = Mutex::new(PlayerStore::in_memory());
        let directory = Directory::new();
        let (c, _rx) = test_client(1, "u-1");
        assert!(handle_psay(&store, &directory, &c, &["psay", "anyone?"])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn party_info_hides_password_from_non_owner() {
        let store = Mutex::new(PlayerStore::in_memory());
        store.lock().await.insert_party_for_test(PartyRec {
            id: 1,
            name: "explorers".to_string(),
            owner_uuid: "u-1".to_string(),
            password: "pw".to_string(),
            members: vec!["u-1".to_string(), "u-2".to_string()],
        });
        let (owner, mut orx) = test_client(1, "u-1");
        let (member, mut mrx) = test_client(2, "u-2");

        handle_pt(&store, &owner, &["pt"]).await.unwrap();
        handle_pt(&store, &member, &["pt"]).await.unwrap();

        let o = drain(&mut orx).remove(0);
        let m = drain(&mut mrx).remove(0);
        assert_eq!(o[4], "pw");
        assert_eq!(m[4], "");
    }

    #[tokio::test]
    async fn chat_length_is_bounded() {
        let directory = Directory::new();
        let (mut c, _rx) = test_client(1, "u-1");
        c.name = "Traveler".to_string();
        c.system_name = "classic".to_string();
        let long = "x".repeat(MAX_CHAT_LEN + 1);
        assert!(handle_gsay(&directory, &c, &["gsay", &long]).await.is_err());
        assert!(handle_gsay(&directory, &c, &["gsay", "   "]).await.is_err());
    }
}
