//! Loopback admin listener.
//!
//! Line-delimited JSON, one request per connection. Every request
//! carries a bearer token that must resolve to a player with rank
//! above zero; everything else is access denied before any lookup
//! happens.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::session::Directory;
use crate::store::PlayerStore;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminReq {
    ListPlayers { token: String },
    Ban { token: String, user: String },
    Unban { token: String, user: String },
    Mute { token: String, user: String },
    Unmute { token: String, user: String },
    Rename { token: String, user: String, new_name: String },
}

impl AdminReq {
    fn token(&self) -> &str {
        match self {
            AdminReq::ListPlayers { token }
            | AdminReq::Ban { token, .. }
            | AdminReq::Unban { token, .. }
            | AdminReq::Mute { token, .. }
            | AdminReq::Unmute { token, .. }
            | AdminReq::Rename { token, .. } => token,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlayerSummary {
    pub uuid: String,
    pub name: String,
    pub rank: i32,
    pub banned: bool,
    pub muted: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResp {
    Ok { kicked: bool },
    OkPlayers { players: Vec<PlayerSummary> },
    Err { message: String },
}

fn err(message: impl Into<String>) -> AdminResp {
    AdminResp::Err {
        message: message.into(),
    }
}

pub async fn apply(
    req: AdminReq,
    store: &Mutex<PlayerStore>,
    directory: &Directory,
) -> AdminResp {
    let moderator = {
        let s = store.lock().await;
        s.resolve_token(req.token())
    };
    let Some((mod_uuid, rank)) = moderator else {
        return err("access denied");
    };
    if rank <= 0 {
        return err("access denied");
    }

    match req {
        AdminReq::ListPlayers { .. } => {
            let players = store
                .lock()
                .await
                .list_players()
                .into_iter()
                .map(|p| PlayerSummary {
                    uuid: p.uuid,
                    name: p.name,
                    rank: p.rank,
                    banned: p.banned,
                    muted: p.muted,
                })
                .collect();
            AdminResp::OkPlayers { players }
        }
        AdminReq::Ban { user, .. } => {
            let uuid = {
                let mut s = store.lock().await;
                match s.resolve_user(&user) {
                    Some(uuid) => match s.set_banned(&uuid, true) {
                        Ok(true) => uuid,
                        Ok(false) => return err("unknown player"),
                        Err(e) => return err(e.to_string()),
                    },
                    None => return err("unknown player"),
                }
            };
            let kicked = directory.kick(&uuid).await;
            info!(by = %mod_uuid, uuid = %uuid, kicked, "player banned");
            AdminResp::Ok { kicked }
        }
        AdminReq::Unban { user, .. } => {
            let mut s = store.lock().await;
            match s.resolve_user(&user) {
                Some(uuid) => match s.set_banned(&uuid, false) {
                    Ok(_) => AdminResp::Ok { kicked: false },
                    Err(e) => err(e.to_string()),
                },
                None => err("unknown player"),
            }
        }
        AdminReq::Mute { user, .. } => set_mute(store, directory, &user, true).await,
        AdminReq::Unmute { user, .. } => set_mute(store, directory, &user, false).await,
        AdminReq::Rename { user, new_name, .. } => {
            if !crate::assets::is_ok_name(&new_name) || new_name.len() > crate::session::MAX_NAME_LEN
            {
                return err("bad name");
            }
            let uuid = {
                let mut s = store.lock().await;
                match s.resolve_user(&user) {
                    Some(uuid) => match s.rename(&uuid, &new_name) {
                        Ok(true) => uuid,
                        Ok(false) => return err("unknown player"),
                        Err(e) => return err(e.to_string()),
                    },
                    None => return err("unknown player"),
                }
            };
            if let Some(m) = directory.by_uuid(&uuid).await {
                directory
                    .update(m.client_id, |m| m.name = new_name.clone())
                    .await;
            }
            AdminResp::Ok { kicked: false }
        }
    }
}

async fn set_mute(
    store: &Mutex<PlayerStore>,
    directory: &Directory,
    user: &str,
    muted: bool,
) -> AdminResp {
    let uuid = {
        let mut s = store.lock().await;
        match s.resolve_user(user) {
            Some(uuid) => match s.set_muted(&uuid, muted) {
                Ok(true) => uuid,
                Ok(false) => return err("unknown player"),
                Err(e) => return err(e.to_string()),
            },
            None => return err("unknown player"),
        }
    };
    // Flip the live flag too; the client task reads it on every chat.
    if let Some(m) = directory.by_uuid(&uuid).await {
        m.muted.store(muted, std::sync::atomic::Ordering::Relaxed);
    }
    AdminResp::Ok { kicked: false }
}

pub async fn admin_server_task(
    bind: SocketAddr,
    store: Arc<Mutex<PlayerStore>>,
    directory: Arc<Directory>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind = %bind, "admin server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let store = store.clone();
        let directory = directory.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_admin_conn(stream, &store, &directory).await {
                warn!(peer = %peer, err = %e, "admin request failed");
            }
        });
    }
}

async fn handle_admin_conn(
    stream: TcpStream,
    store: &Mutex<PlayerStore>,
    directory: &Directory,
) -> anyhow::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);

    let mut line = String::new();
    rd.read_line(&mut line).await?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }

    let resp = match serde_json::from_str::<AdminReq>(line) {
        Ok(req) => apply(req, store, directory).await,
        Err(e) => err(format!("bad json: {e}")),
    };
    wr.write_all(serde_json::to_string(&resp)?.as_bytes()).await?;
    wr.write_all(b"\n").await?;
    Ok(())
}
