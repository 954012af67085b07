use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn, Level};

use driftio::{FrameReader, FrameWriter};
use driftproto::split_msg;

mod admin;
mod assets;
mod client;
mod conditions;
mod handlers;
mod rooms;
mod session;
mod store;

/// Game id that turns on the host deployment specials (sprite
/// substring filter, time-trial switch, default event location).
const HOST_GAME_ID: &str = "mistward";

const WRITE_QUEUE_DEPTH: usize = 256;

fn usage_and_exit() -> ! {
    eprintln!(
        "driftd (room server)\n\n\
USAGE:\n  driftd [--bind HOST:PORT]\n\n\
ENV:\n  DRIFTD_BIND                default 0.0.0.0:6300\n  DRIFTD_ADMIN_BIND          optional; default 127.0.0.1:6311 (local admin JSON)\n  DRIFTD_GAME_ID             optional; default drift\n  DRIFTD_STORE_PATH          optional; default players.json (empty = volatile)\n  DRIFTD_ASSETS_PATH         optional; allow-list JSON (absent = allow all)\n  DRIFTD_CONDITIONS_PATH     optional; condition/minigame JSON\n  DRIFTD_EVENT_PERIOD_ID     optional; activates an event period at startup\n  DRIFTD_SPRITE_FILTER       optional; comma list of allowed sprite substrings\n  DRIFTD_SPRITE_FILTER_EXEMPT optional; comma list of exempt map ids\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub admin_bind: SocketAddr,
    pub game_id: String,
    pub host_profile: bool,
    pub store_path: Option<PathBuf>,
    pub assets_path: Option<PathBuf>,
    pub conditions_path: Option<PathBuf>,
    pub event_period_id: Option<i32>,
    pub sprite_filter: Vec<String>,
    pub sprite_filter_exempt: Vec<i32>,
}

#[cfg(test)]
impl Config {
    pub(crate) fn for_test() -> Self {
        Self {
            bind: "127.0.0.1:0".parse().unwrap(),
            admin_bind: "127.0.0.1:0".parse().unwrap(),
            game_id: "drift".to_string(),
            host_profile: false,
            store_path: None,
            assets_path: None,
            conditions_path: None,
            event_period_id: None,
            sprite_filter: Vec::new(),
            sprite_filter_exempt: Vec::new(),
        }
    }
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("DRIFTD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:6300".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let admin_bind: SocketAddr = std::env::var("DRIFTD_ADMIN_BIND")
        .unwrap_or_else(|_| "127.0.0.1:6311".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let game_id = std::env::var("DRIFTD_GAME_ID").unwrap_or_else(|_| "drift".to_string());
    let host_profile = game_id == HOST_GAME_ID;

    let store_path = match std::env::var("DRIFTD_STORE_PATH") {
        Ok(v) if v.is_empty() => None,
        Ok(v) => Some(PathBuf::from(v)),
        Err(_) => Some(PathBuf::from("players.json")),
    };
    let assets_path = std::env::var("DRIFTD_ASSETS_PATH").ok().map(PathBuf::from);
    let conditions_path = std::env::var("DRIFTD_CONDITIONS_PATH").ok().map(PathBuf::from);

    let event_period_id = std::env::var("DRIFTD_EVENT_PERIOD_ID")
        .ok()
        .map(|v| v.parse().unwrap_or_else(|_| usage_and_exit()));

    let sprite_filter: Vec<String> = std::env::var("DRIFTD_SPRITE_FILTER")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let sprite_filter_exempt: Vec<i32> = std::env::var("DRIFTD_SPRITE_FILTER_EXEMPT")
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap_or_else(|_| usage_and_exit()))
        .collect();

    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        admin_bind,
        game_id,
        host_profile,
        store_path,
        assets_path,
        conditions_path,
        event_period_id,
        sprite_filter,
        sprite_filter_exempt,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,driftd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = Arc::new(parse_args());

    let assets = Arc::new(match &cfg.assets_path {
        Some(p) => assets::Assets::load(p)?,
        None => assets::Assets::default(),
    });
    let engine = Arc::new(match &cfg.conditions_path {
        Some(p) => conditions::ConditionEngine::load(p, cfg.host_profile)?,
        None => conditions::ConditionEngine::empty(),
    });
    let store = Arc::new(Mutex::new(match &cfg.store_path {
        Some(p) => store::PlayerStore::load(p.clone()),
        None => store::PlayerStore::in_memory(),
    }));

    if let Some(period_id) = cfg.event_period_id {
        let mut s = store.lock().await;
        if s.event_period().map(|p| p.id) != Some(period_id) {
            s.set_event_period(store::EventPeriodRec {
                id: period_id,
                ends_unix: 0,
            })?;
        }
    }

    let ctx = handlers::Ctx {
        cfg: cfg.clone(),
        rooms: Arc::new(rooms::RoomRegistry::new()),
        directory: Arc::new(session::Directory::new()),
        store: store.clone(),
        assets,
        engine,
        next_client_id: Arc::new(AtomicU64::new(0)),
    };

    tokio::spawn(admin::admin_server_task(
        cfg.admin_bind,
        store,
        ctx.directory.clone(),
    ));

    let listener = TcpListener::bind(cfg.bind).await?;
    info!(
        bind = %cfg.bind,
        admin_bind = %cfg.admin_bind,
        game_id = %cfg.game_id,
        host_profile = cfg.host_profile,
        "room server listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, peer, ctx).await {
                warn!(peer = %peer, err = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_conn(stream: TcpStream, peer: SocketAddr, ctx: handlers::Ctx) -> anyhow::Result<()> {
    let (rd, wr) = stream.into_split();

    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
    tokio::spawn(async move {
        let mut fw = FrameWriter::new(wr);
        while let Some(payload) = write_rx.recv().await {
            if fw.write_frame(&payload).await.is_err() {
                break;
            }
            if fw.flush().await.is_err() {
                break;
            }
        }
    });

    let (disconnect_tx, mut disconnect_rx) = watch::channel(false);
    let mut fr = FrameReader::new(rd);
    let mut client: Option<client::Client> = None;

    let result = loop {
        let frame = tokio::select! {
            res = fr.read_frame() => match res {
                Ok(Some(f)) => f,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            },
            _ = disconnect_rx.changed() => {
                info!(peer = %peer, "connection kicked");
                break Ok(());
            }
        };

        let Ok(text) = std::str::from_utf8(&frame) else {
            warn!(peer = %peer, "dropping non-utf8 frame");
            continue;
        };
        if text.is_empty() {
            continue;
        }
        let fields = split_msg(text);

        match &mut client {
            None => {
                // Nothing but the handshake is valid yet.
                if fields[0] != "ident" {
                    warn!(peer = %peer, cmd = fields[0], "command before ident");
                    continue;
                }
                match handlers::handle_ident(&ctx, &fields, write_tx.clone(), disconnect_tx.clone())
                    .await
                {
                    Ok(Some(c)) => {
                        info!(peer = %peer, client_id = c.id, uuid = %c.uuid, "client identified");
                        client = Some(c);
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => warn!(peer = %peer, err = %e, "ident rejected"),
                }
            }
            Some(c) => {
                if let Err(e) = handlers::handle_frame(&ctx, c, &fields).await {
                    warn!(peer = %peer, client_id = c.id, cmd = fields[0], err = %e, "command failed");
                }
            }
        }
    };

    if let Some(c) = &client {
        handlers::handle_disconnect(&ctx, c).await;
        info!(peer = %peer, client_id = c.id, "client disconnected");
    }
    result
}
