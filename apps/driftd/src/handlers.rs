//! Command dispatch and the room-scoped handlers.
//!
//! Every handler follows the same shape: arity check first, then
//! per-field domain validation, then state mutation and the room
//! broadcast. A failed command drops that frame only; the connection
//! keeps reading. Broadcast frames are `<cmd> <senderId> <args...>`
//! with the original argument text relayed as-is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

use driftproto::{build_msg, expect_len, parse_bool, parse_int, parse_ranged, CmdError, Part};

use crate::assets::Assets;
use crate::client::{Client, Picture};
use crate::conditions::ConditionEngine;
use crate::rooms::{ClientId, Member, RoomRegistry};
use crate::session::{self, Directory};
use crate::store::PlayerStore;
use crate::Config;

#[derive(Clone)]
pub struct Ctx {
    pub cfg: Arc<Config>,
    pub rooms: Arc<RoomRegistry>,
    pub directory: Arc<Directory>,
    pub store: Arc<Mutex<PlayerStore>>,
    pub assets: Arc<Assets>,
    pub engine: Arc<ConditionEngine>,
    pub next_client_id: Arc<AtomicU64>,
}

/// Relay frame: command, sender id, then the original args verbatim.
fn relay_frame(cmd: &str, sender: ClientId, args: &[&str]) -> Vec<u8> {
    let mut parts = Vec::with_capacity(args.len() + 2);
    parts.push(Part::Str(cmd));
    parts.push(Part::Int(sender as i64));
    for a in args {
        parts.push(Part::Str(a));
    }
    build_msg(&parts)
}

/// `ident <uuid>`: the handshake. Returns `None` for a banned player,
/// which the caller treats as a polite refusal.
pub async fn handle_ident(
    ctx: &Ctx,
    fields: &[&str],
    write_tx: mpsc::Sender<Bytes>,
    disconnect_tx: watch::Sender<bool>,
) -> anyhow::Result<Option<Client>> {
    expect_len(fields, 2)?;
    let uuid = fields[1];
    if uuid.is_empty() {
        return Err(CmdError::BadName { field: "uuid" }.into());
    }

    let rec = ctx.store.lock().await.get_player(uuid)?;
    if rec.banned {
        info!(uuid, "refusing banned player");
        return Ok(None);
    }

    let id = ctx.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    // Each connection starts unnamed; the name command claims one.
    let client = Client::new(
        id,
        uuid.to_string(),
        rec.rank,
        rec.badge.clone(),
        rec.muted,
        write_tx.clone(),
    );

    ctx.directory
        .insert(Member {
            client_id: id,
            uuid: uuid.to_string(),
            name: String::new(),
            rank: rec.rank,
            hidden: false,
            muted: client.muted.clone(),
            write_tx,
            disconnect_tx,
        })
        .await;

    client.send(build_msg(&[
        Part::Str("ident"),
        Part::Int(id as i64),
        Part::Str(uuid),
        Part::Int(i64::from(rec.rank)),
    ]));
    Ok(Some(client))
}

/// Cleanup when the connection ends, for any reason.
pub async fn handle_disconnect(ctx: &Ctx, client: &Client) {
    if let Some(map_id) = client.map_id {
        ctx.rooms.leave(map_id, client.id).await;
        if !client.hidden {
            ctx.rooms
                .broadcast(
                    map_id,
                    None,
                    build_msg(&[Part::Str("d"), Part::Int(client.id as i64)]),
                )
                .await;
        }
    }
    ctx.directory.remove(client.id).await;
}

pub async fn handle_frame(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    match fields[0] {
        "jr" => handle_join_room(ctx, client, fields).await,
        "m" => handle_move(ctx, client, fields, false).await,
        "tp" => handle_move(ctx, client, fields, true).await,
        "f" => handle_facing(ctx, client, fields).await,
        "spd" => handle_speed(ctx, client, fields).await,
        "spr" => handle_sprite(ctx, client, fields).await,
        "fl" => handle_flash(ctx, client, fields, false).await,
        "rfl" => handle_flash(ctx, client, fields, true).await,
        "rrfl" => handle_stop_flash(ctx, client, fields).await,
        "h" => handle_hidden(ctx, client, fields).await,
        "sys" => handle_system(ctx, client, fields).await,
        "se" => handle_sound(ctx, client, fields).await,
        "ap" => handle_picture_show(ctx, client, fields).await,
        "p" => handle_picture_move(ctx, client, fields).await,
        "rp" => handle_picture_erase(ctx, client, fields).await,
        "say" => handle_say(ctx, client, fields).await,
        "ss" => handle_switch(ctx, client, fields).await,
        "sv" => handle_var(ctx, client, fields).await,
        "sev" => handle_event(ctx, client, fields).await,
        "ploc" => handle_prev_location(ctx, client, fields).await,
        "name" => session::handle_name(&ctx.store, &ctx.rooms, &ctx.directory, client, fields).await,
        "i" => session::handle_info(&ctx.store, client, fields).await,
        "gsay" => session::handle_gsay(&ctx.directory, client, fields).await,
        "psay" => session::handle_psay(&ctx.store, &ctx.directory, client, fields).await,
        "pt" => session::handle_pt(&ctx.store, client, fields).await,
        "ep" => session::handle_ep(&ctx.store, client, fields).await,
        "el" => session::handle_el(&ctx.store, ctx.cfg.host_profile, client, fields).await,
        _ => Err(CmdError::Rejected("unknown command").into()),
    }
}

fn require_room(client: &Client) -> Result<i32, CmdError> {
    client.map_id.ok_or(CmdError::Rejected("not in a room"))
}

async fn handle_join_room(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = parse_ranged(fields[1], 0, i64::from(i32::MAX), "mapId")? as i32;

    let Some(mut member) = ctx.directory.get(client.id).await else {
        return Err(CmdError::Rejected("not identified").into());
    };

    if let Some(old) = client.map_id.take() {
        ctx.rooms.leave(old, client.id).await;
        if !client.hidden {
            ctx.rooms
                .broadcast(
                    old,
                    None,
                    build_msg(&[Part::Str("d"), Part::Int(client.id as i64)]),
                )
                .await;
        }
    }

    // Tell the newcomer about everyone already present.
    for m in ctx.rooms.members(map_id).await {
        if m.hidden {
            continue;
        }
        client.send(build_msg(&[
            Part::Str("c"),
            Part::Int(m.client_id as i64),
            Part::Str(&m.uuid),
            Part::Str(&m.name),
            Part::Int(i64::from(m.rank)),
        ]));
    }

    member.name = client.name.clone();
    member.hidden = client.hidden;
    ctx.rooms.join(map_id, member).await;
    client.map_id = Some(map_id);
    client.sync_coords = ctx.engine.room_has_coord_triggers(map_id);

    if !client.hidden {
        ctx.rooms
            .broadcast(
                map_id,
                Some(client.id),
                build_msg(&[
                    Part::Str("c"),
                    Part::Int(client.id as i64),
                    Part::Str(&client.uuid),
                    Part::Str(&client.name),
                    Part::Int(i64::from(client.rank)),
                ]),
            )
            .await;
    }
    Ok(())
}

async fn handle_move(
    ctx: &Ctx,
    client: &mut Client,
    fields: &[&str],
    teleport: bool,
) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    let map_id = require_room(client)?;
    let x = parse_ranged(fields[1], 0, i64::from(u32::MAX), "x")? as u32;
    let y = parse_ranged(fields[2], 0, i64::from(u32::MAX), "y")? as u32;

    client.x = x;
    client.y = y;

    if teleport {
        ctx.engine.on_move(client, true, &ctx.store).await?;
    } else if client.sync_coords {
        ctx.engine.on_move(client, false, &ctx.store).await?;
    }

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame(fields[0], client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_facing(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    let facing = parse_ranged(fields[1], 0, 3, "facing")? as u8;
    client.facing = facing;
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("f", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_speed(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    let speed = parse_ranged(fields[1], 0, 10, "speed")? as u8;
    client.speed = speed;
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("spd", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_sprite(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    let map_id = require_room(client)?;
    let name = fields[1];
    let index = parse_ranged(fields[2], 0, i64::from(i32::MAX), "spriteIndex")? as i32;
    if !ctx.assets.is_valid_sprite(name) {
        return Err(CmdError::BadName { field: "sprite" }.into());
    }
    if ctx.cfg.host_profile
        && !ctx.cfg.sprite_filter.is_empty()
        && !ctx.cfg.sprite_filter_exempt.contains(&map_id)
        && !ctx.cfg.sprite_filter.iter().any(|s| name.contains(s.as_str()))
    {
        return Err(CmdError::BadName { field: "sprite" }.into());
    }

    client.sprite_name = name.to_string();
    client.sprite_index = index;
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("spr", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_flash(
    ctx: &Ctx,
    client: &mut Client,
    fields: &[&str],
    repeating: bool,
) -> anyhow::Result<()> {
    expect_len(fields, 6)?;
    let map_id = require_room(client)?;
    let r = parse_ranged(fields[1], 0, 255, "red")?;
    let g = parse_ranged(fields[2], 0, 255, "green")?;
    let b = parse_ranged(fields[3], 0, 255, "blue")?;
    let power = parse_ranged(fields[4], 0, i64::MAX, "power")?;
    let frames = parse_ranged(fields[5], 0, i64::MAX, "frames")?;

    // Only the repeating variant persists; a one-shot flash is pure
    // broadcast.
    if repeating {
        client.flash = [r, g, b, power, frames];
    }
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame(fields[0], client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_stop_flash(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 1)?;
    let map_id = require_room(client)?;
    client.flash = [0; 5];
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("rrfl", client.id, &[]))
        .await;
    Ok(())
}

async fn handle_hidden(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    let hidden = parse_bool(fields[1], "hidden")?;
    client.hidden = hidden;
    ctx.rooms
        .update_member(map_id, client.id, |m| m.hidden = hidden)
        .await;
    ctx.directory.update(client.id, |m| m.hidden = hidden).await;
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("h", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_system(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    let name = fields[1];
    if !ctx.assets.is_valid_system(name) {
        return Err(CmdError::BadName { field: "system" }.into());
    }
    client.system_name = name.to_string();
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("sys", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_sound(ctx: &Ctx, client: &Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 5)?;
    let map_id = require_room(client)?;
    let name = fields[1];
    if !ctx.assets.is_valid_sound(name) {
        return Err(CmdError::BadName { field: "sound" }.into());
    }
    parse_ranged(fields[2], 0, 100, "volume")?;
    parse_ranged(fields[3], 10, 400, "tempo")?;
    parse_ranged(fields[4], 0, 100, "balance")?;
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("se", client.id, &fields[1..]))
        .await;
    Ok(())
}

struct PictureParams {
    x: i64,
    y: i64,
    map_x: i64,
    map_y: i64,
    pan_x: i64,
    pan_y: i64,
    magnify: i64,
    top_trans: i64,
    bottom_trans: i64,
    red: i64,
    green: i64,
    blue: i64,
    saturation: i64,
    effect_mode: i64,
    effect_power: i64,
}

/// The 15-field numeric block shared by show and move, starting at
/// `at`. Only show carries a name; move starts the block right after
/// the picture id.
fn parse_picture_block(fields: &[&str], at: usize) -> Result<PictureParams, CmdError> {
    Ok(PictureParams {
        x: parse_int(fields[at], "x")?,
        y: parse_int(fields[at + 1], "y")?,
        map_x: parse_int(fields[at + 2], "mapX")?,
        map_y: parse_int(fields[at + 3], "mapY")?,
        pan_x: parse_int(fields[at + 4], "panX")?,
        pan_y: parse_int(fields[at + 5], "panY")?,
        magnify: parse_ranged(fields[at + 6], 0, i64::MAX, "magnify")?,
        top_trans: parse_ranged(fields[at + 7], 0, i64::MAX, "topTrans")?,
        bottom_trans: parse_ranged(fields[at + 8], 0, i64::MAX, "bottomTrans")?,
        red: parse_ranged(fields[at + 9], 0, 200, "red")?,
        green: parse_ranged(fields[at + 10], 0, 200, "green")?,
        blue: parse_ranged(fields[at + 11], 0, 200, "blue")?,
        saturation: parse_ranged(fields[at + 12], 0, 200, "saturation")?,
        effect_mode: parse_ranged(fields[at + 13], 0, i64::MAX, "effectMode")?,
        effect_power: parse_int(fields[at + 14], "effectPower")?,
    })
}

fn parse_pic_id(field: &str) -> Result<i32, CmdError> {
    Ok(parse_ranged(field, 1, i64::from(i32::MAX), "picId")? as i32)
}

fn apply_picture_params(pic: &mut Picture, p: PictureParams) {
    pic.x = p.x;
    pic.y = p.y;
    pic.map_x = p.map_x;
    pic.map_y = p.map_y;
    pic.pan_x = p.pan_x;
    pic.pan_y = p.pan_y;
    pic.magnify = p.magnify;
    pic.top_trans = p.top_trans;
    pic.bottom_trans = p.bottom_trans;
    pic.red = p.red;
    pic.green = p.green;
    pic.blue = p.blue;
    pic.saturation = p.saturation;
    pic.effect_mode = p.effect_mode;
    pic.effect_power = p.effect_power;
}

async fn handle_picture_show(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 20)?;
    let map_id = require_room(client)?;
    let pic_id = parse_pic_id(fields[1])?;
    let name = fields[2];
    if !ctx.assets.is_valid_picture(name) {
        return Err(CmdError::BadName { field: "picture" }.into());
    }
    let params = parse_picture_block(fields, 3)?;
    let use_transparent_color = parse_bool(fields[18], "useTransparentColor")?;
    let fixed_to_map = parse_bool(fields[19], "fixedToMap")?;

    // Showing at an occupied id is an atomic replace: observers see
    // the old picture erased before the new one appears.
    if client.pictures.contains_key(&pic_id) {
        ctx.rooms
            .broadcast(
                map_id,
                Some(client.id),
                relay_frame("rp", client.id, &[fields[1]]),
            )
            .await;
    }

    let mut pic = Picture {
        name: name.to_string(),
        use_transparent_color,
        fixed_to_map,
        ..Picture::default()
    };
    apply_picture_params(&mut pic, params);
    client.pictures.insert(pic_id, pic);

    ctx.engine.on_picture(client, name, &ctx.store).await?;

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("ap", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_picture_move(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 18)?;
    let map_id = require_room(client)?;
    let pic_id = parse_pic_id(fields[1])?;
    let params = parse_picture_block(fields, 2)?;
    parse_ranged(fields[17], 0, i64::MAX, "duration")?;

    // Moving a picture that was never shown is a silent no-op.
    let Some(pic) = client.pictures.get_mut(&pic_id) else {
        return Ok(());
    };
    apply_picture_params(pic, params);

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("p", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_picture_erase(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    let pic_id = parse_ranged(fields[1], 1, i64::from(i32::MAX), "picId")? as i32;

    if client.pictures.remove(&pic_id).is_none() {
        return Ok(());
    }
    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("rp", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_say(ctx: &Ctx, client: &Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 2)?;
    let map_id = require_room(client)?;
    // Room chat before name and appearance are set is silently
    // dropped; the client renders its own line locally.
    if client.name.is_empty() || client.system_name.is_empty() {
        debug!(client_id = client.id, "dropping room chat before name/appearance set");
        return Ok(());
    }
    let msg = session::checked_chat_msg(fields[1])?;
    if client.is_muted() {
        debug!(client_id = client.id, "dropping room chat from muted client");
        return Ok(());
    }
    ctx.rooms
        .broadcast(
            map_id,
            Some(client.id),
            build_msg(&[Part::Str("say"), Part::Int(client.id as i64), Part::Str(msg)]),
        )
        .await;
    Ok(())
}

/// `ploc <prevMapId> <prevLocations>`: where the client came from.
/// Not relayed; it feeds global-chat context and the previous-map
/// condition class.
async fn handle_prev_location(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    require_room(client)?;
    let prev_map = fields[1];
    if prev_map.len() != 4 || !prev_map.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CmdError::BadName { field: "prevMapId" }.into());
    }
    client.prev_map_id = prev_map.to_string();
    client.prev_locations = fields[2].to_string();
    ctx.engine.on_prev_map(client, &ctx.store).await?;
    Ok(())
}

async fn handle_switch(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    let map_id = require_room(client)?;
    let id = parse_int(fields[1], "switchId")? as i32;
    let value = parse_bool(fields[2], "value")?;

    ctx.engine
        .on_switch_write(client, id, value, &ctx.store)
        .await?;

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("ss", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_var(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    let map_id = require_room(client)?;
    let id = parse_int(fields[1], "varId")? as i32;
    let value = parse_int(fields[2], "value")?;

    ctx.engine.on_var_write(client, id, value, &ctx.store).await?;

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("sv", client.id, &fields[1..]))
        .await;
    Ok(())
}

async fn handle_event(ctx: &Ctx, client: &mut Client, fields: &[&str]) -> anyhow::Result<()> {
    expect_len(fields, 3)?;
    let map_id = require_room(client)?;
    let event_id = parse_int(fields[1], "eventId")? as i32;
    let action = parse_bool(fields[2], "action")?;

    ctx.engine
        .on_event(client, fields[1], action, &ctx.store)
        .await?;

    ctx.rooms
        .broadcast(map_id, Some(client.id), relay_frame("sev", client.id, &fields[1..]))
        .await;

    // Exp is awarded only when the report matches the active scripted
    // event, room and id both. A repeat completion earns nothing and
    // stays silent.
    if !action {
        let mut store = ctx.store.lock().await;
        if let Some(ev) = store.active_event() {
            if ev.map_id == map_id && ev.event_id == event_id {
                if let Some(exp) =
                    store.try_complete_event_vm(ev.period_id, &client.uuid, map_id, event_id)?
                {
                    drop(store);
                    client.send(build_msg(&[
                        Part::Str("vm"),
                        Part::Int(i64::from(event_id)),
                        Part::Int(i64::from(exp)),
                    ]));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_client;
    use crate::store::ActiveEventRec;
    use tokio::sync::mpsc::Receiver;

    fn decode(b: Bytes) -> Vec<String> {
        let s = String::from_utf8(b.to_vec()).unwrap();
        driftproto::split_msg(&s)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    fn drain(rx: &mut Receiver<Bytes>) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        while let Ok(b) = rx.try_recv() {
            out.push(decode(b));
        }
        out
    }

    fn test_ctx() -> Ctx {
        Ctx {
            cfg: Arc::new(Config::for_test()),
            rooms: Arc::new(RoomRegistry::new()),
            directory: Arc::new(Directory::new()),
            store: Arc::new(Mutex::new(PlayerStore::in_memory())),
            assets: Arc::new(Assets::default()),
            engine: Arc::new(ConditionEngine::empty()),
            next_client_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Identify a client and join it to a room, returning its receive
    /// probe.
    async fn joined_client(ctx: &Ctx, uuid: &str, map_id: i32) -> (Client, Receiver<Bytes>) {
        let (tx, mut rx) = mpsc::channel(64);
        let (dtx, _) = watch::channel(false);
        let mut client = handle_ident(ctx, &["ident", uuid], tx, dtx)
            .await
            .unwrap()
            .unwrap();
        let map_field = map_id.to_string();
        handle_frame(ctx, &mut client, &["jr", &map_field])
            .await
            .unwrap();
        drain(&mut rx);
        (client, rx)
    }

    #[tokio::test]
    async fn movement_echoes_to_the_room_except_sender() {
        let ctx = test_ctx();
        let (mut a, mut rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;
        let (_c, mut rx_c) = joined_client(&ctx, "u-c", 8).await;
        drain(&mut rx_a);

        handle_frame(&ctx, &mut a, &["m", "12", "34"]).await.unwrap();

        let got = drain(&mut rx_b);
        assert_eq!(got, vec![vec!["m", a.id.to_string().as_str(), "12", "34"]]);
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_c).is_empty());
        assert_eq!((a.x, a.y), (12, 34));
    }

    #[tokio::test]
    async fn bad_arity_drops_the_frame_without_state_change() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;

        assert!(handle_frame(&ctx, &mut a, &["m", "12"]).await.is_err());
        assert!(handle_frame(&ctx, &mut a, &["f", "9"]).await.is_err());
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!((a.x, a.y), (0, 0));
        assert_eq!(a.facing, 0);
    }

    #[tokio::test]
    async fn join_room_announces_presence_both_ways() {
        let ctx = test_ctx();
        let (a, mut rx_a) = joined_client(&ctx, "u-a", 7).await;

        let (tx, mut rx_b) = mpsc::channel(64);
        let (dtx, _) = watch::channel(false);
        let mut b = handle_ident(&ctx, &["ident", "u-b"], tx, dtx)
            .await
            .unwrap()
            .unwrap();
        drain(&mut rx_b);
        handle_frame(&ctx, &mut b, &["jr", "7"]).await.unwrap();

        // Newcomer hears about the existing member and vice versa.
        let b_got = drain(&mut rx_b);
        assert_eq!(b_got.len(), 1);
        assert_eq!(b_got[0][0], "c");
        assert_eq!(b_got[0][2], "u-a");

        let a_got = drain(&mut rx_a);
        assert_eq!(a_got.len(), 1);
        assert_eq!(a_got[0][0], "c");
        assert_eq!(a_got[0][2], "u-b");

        // Switching rooms emits a departure echo.
        handle_frame(&ctx, &mut b, &["jr", "9"]).await.unwrap();
        let a_got = drain(&mut rx_a);
        assert_eq!(a_got, vec![vec!["d", b.id.to_string().as_str()]]);
        assert_eq!(b.map_id, Some(9));
    }

    #[tokio::test]
    async fn picture_replace_is_erase_then_show() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;

        let show: Vec<&str> = vec![
            "ap", "3", "lantern", "0", "0", "0", "0", "0", "0", "100", "0", "0", "100", "100",
            "100", "100", "0", "0", "0", "1",
        ];
        handle_frame(&ctx, &mut a, &show).await.unwrap();
        assert_eq!(drain(&mut rx_b).len(), 1);

        handle_frame(&ctx, &mut a, &show).await.unwrap();
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0][0], "rp");
        assert_eq!(got[0][2], "3");
        assert_eq!(got[1][0], "ap");
        assert_eq!(a.pictures.len(), 1);
    }

    #[tokio::test]
    async fn moving_or_erasing_a_missing_picture_is_a_no_op() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;

        let mv: Vec<&str> = vec![
            "p", "3", "0", "0", "0", "0", "0", "0", "100", "0", "0", "100", "100", "100", "100",
            "0", "0", "30",
        ];
        handle_frame(&ctx, &mut a, &mv).await.unwrap();
        handle_frame(&ctx, &mut a, &["rp", "3"]).await.unwrap();
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn picture_move_carries_a_duration_and_no_name() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;

        let show: Vec<&str> = vec![
            "ap", "3", "lantern", "0", "0", "0", "0", "0", "0", "100", "0", "0", "100", "100",
            "100", "100", "0", "0", "0", "1",
        ];
        handle_frame(&ctx, &mut a, &show).await.unwrap();
        drain(&mut rx_b);

        let mv: Vec<&str> = vec![
            "p", "3", "5", "6", "0", "0", "0", "0", "100", "0", "0", "100", "100", "100", "100",
            "0", "0", "30",
        ];
        handle_frame(&ctx, &mut a, &mv).await.unwrap();
        let pic = &a.pictures[&3];
        assert_eq!((pic.x, pic.y), (5, 6));
        assert_eq!(pic.name, "lantern");
        assert_eq!(drain(&mut rx_b).len(), 1);

        // A negative duration drops the frame.
        let bad: Vec<&str> = vec![
            "p", "3", "5", "6", "0", "0", "0", "0", "100", "0", "0", "100", "100", "100", "100",
            "0", "0", "-1",
        ];
        assert!(handle_frame(&ctx, &mut a, &bad).await.is_err());
    }

    #[tokio::test]
    async fn prev_location_wants_a_four_digit_map_id() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;

        assert!(handle_frame(&ctx, &mut a, &["ploc", "42", "lake"]).await.is_err());
        assert!(a.prev_map_id.is_empty());

        handle_frame(&ctx, &mut a, &["ploc", "0042", "lake,shore"])
            .await
            .unwrap();
        assert_eq!(a.prev_map_id, "0042");
        assert_eq!(a.prev_locations, "lake,shore");
    }

    #[tokio::test]
    async fn room_chat_fans_out_but_never_echoes_the_sender() {
        let ctx = test_ctx();
        let (mut a, mut rx_a) = joined_client(&ctx, "u-a", 7).await;
        let (_b, mut rx_b) = joined_client(&ctx, "u-b", 7).await;
        drain(&mut rx_a);

        // No name yet: silent drop.
        handle_frame(&ctx, &mut a, &["say", "hello"]).await.unwrap();
        assert!(drain(&mut rx_b).is_empty());

        // Named but no appearance yet: still dropped.
        handle_frame(&ctx, &mut a, &["name", "Traveler"]).await.unwrap();
        drain(&mut rx_b);
        handle_frame(&ctx, &mut a, &["say", "hello"]).await.unwrap();
        assert!(drain(&mut rx_b).is_empty());

        handle_frame(&ctx, &mut a, &["sys", "classic"]).await.unwrap();
        drain(&mut rx_b);
        handle_frame(&ctx, &mut a, &["say", "hello"]).await.unwrap();
        let got = drain(&mut rx_b);
        assert_eq!(got, vec![vec!["say", a.id.to_string().as_str(), "hello"]]);
        // The sender never receives its own chat back.
        assert!(drain(&mut rx_a).is_empty());

        a.muted.store(true, std::sync::atomic::Ordering::Relaxed);
        handle_frame(&ctx, &mut a, &["say", "quiet now"]).await.unwrap();
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn sprite_filter_applies_outside_exempt_rooms() {
        let mut cfg = Config::for_test();
        cfg.host_profile = true;
        cfg.sprite_filter = vec!["hero".to_string()];
        cfg.sprite_filter_exempt = vec![9];
        let ctx = Ctx {
            cfg: Arc::new(cfg),
            ..test_ctx()
        };

        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;
        assert!(handle_frame(&ctx, &mut a, &["spr", "villain_red", "0"])
            .await
            .is_err());
        handle_frame(&ctx, &mut a, &["spr", "hero_red", "0"]).await.unwrap();
        assert_eq!(a.sprite_name, "hero_red");

        // The exception room takes anything on the allow-list.
        handle_frame(&ctx, &mut a, &["jr", "9"]).await.unwrap();
        handle_frame(&ctx, &mut a, &["spr", "villain_red", "0"])
            .await
            .unwrap();
        assert_eq!(a.sprite_name, "villain_red");
    }

    #[tokio::test]
    async fn repeating_flash_persists_and_clears() {
        let ctx = test_ctx();
        let (mut a, _rx_a) = joined_client(&ctx, "u-a", 7).await;

        handle_frame(&ctx, &mut a, &["fl", "255", "0", "0", "10", "30"])
            .await
            .unwrap();
        assert_eq!(a.flash, [0; 5]);

        handle_frame(&ctx, &mut a, &["rfl", "255", "0", "0", "10", "30"])
            .await
            .unwrap();
        assert_eq!(a.flash, [255, 0, 0, 10, 30]);

        handle_frame(&ctx, &mut a, &["rrfl"]).await.unwrap();
        assert_eq!(a.flash, [0; 5]);
    }

    #[tokio::test]
    async fn banned_player_is_refused_at_ident() {
        let ctx = test_ctx();
        {
            let mut s = ctx.store.lock().await;
            s.get_player("u-banned").unwrap();
            s.set_banned("u-banned", true).unwrap();
        }
        let (tx, _rx) = mpsc::channel(8);
        let (dtx, _) = watch::channel(false);
        let got = handle_ident(&ctx, &["ident", "u-banned"], tx, dtx)
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn event_vm_awards_exp_once_for_the_active_event() {
        let ctx = test_ctx();
        {
            let mut s = ctx.store.lock().await;
            s.set_active_event_for_test(ActiveEventRec {
                period_id: 4,
                map_id: 7,
                event_id: 77,
            });
            s.insert_vm_exp_for_test(77, 5);
        }
        let (mut a, mut rx_a) = joined_client(&ctx, "u-a", 7).await;

        handle_frame(&ctx, &mut a, &["sev", "77", "0"]).await.unwrap();
        assert_eq!(drain(&mut rx_a), vec![vec!["vm", "77", "5"]]);

        // A repeat completion awards nothing and echoes nothing.
        handle_frame(&ctx, &mut a, &["sev", "77", "0"]).await.unwrap();
        assert!(drain(&mut rx_a).is_empty());

        // A report for some other event stays silent.
        handle_frame(&ctx, &mut a, &["sev", "78", "0"]).await.unwrap();
        assert!(drain(&mut rx_a).is_empty());

        // So does the right event reported from the wrong room.
        handle_frame(&ctx, &mut a, &["jr", "8"]).await.unwrap();
        handle_frame(&ctx, &mut a, &["sev", "77", "0"]).await.unwrap();
        assert!(drain(&mut rx_a).is_empty());
    }
}
