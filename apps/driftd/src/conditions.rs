//! Condition trigger engine.
//!
//! Conditions are loaded once from a JSON config and never mutated, so
//! the engine is a plain `Arc` with no interior locking. All mutable
//! inputs to an evaluation live on the triggering client (its sparse
//! switch/var caches), and all durable effects go through the player
//! store's guarded writes.
//!
//! Each condition has a driving side and a gate side. `var_trigger`
//! picks the driver: switch writes drive switch-sided conditions, var
//! writes drive var-sided ones. The gate side is only ever read from
//! the cache; writing a gate value alone never fires anything, the
//! next driving write observes it. Chain progress is derived live as
//! the longest satisfied prefix of the cache, never stored, so a
//! reconnect re-walks the chain from the start and the idempotent tag
//! write absorbs the replay.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::Deserialize;
use tokio::sync::Mutex;

use driftproto::{build_msg, Part};

use crate::client::Client;
use crate::store::PlayerStore;

/// Switch that arms the time-trial clock on the host deployment.
pub const TIME_TRIAL_SWITCH_ID: i32 = 1430;
/// Variable carrying elapsed time-trial seconds.
pub const ELAPSED_TIME_VAR_ID: i32 = 88;
/// Results at or above this are not worth recording.
pub const TIME_TRIAL_MAX_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Default,
    Teleport,
    Coords,
    Picture,
    Event,
    EventAction,
    PrevMap,
}

#[derive(Debug, Clone)]
pub enum SwitchSide {
    None,
    Single { id: i32, value: bool },
    Chain(Vec<(i32, bool)>),
}

impl SwitchSide {
    fn first_id(&self) -> Option<i32> {
        match self {
            SwitchSide::None => None,
            SwitchSide::Single { id, .. } => Some(*id),
            SwitchSide::Chain(items) => items.first().map(|(id, _)| *id),
        }
    }

    fn involves(&self, written: i32) -> bool {
        match self {
            SwitchSide::None => false,
            SwitchSide::Single { id, .. } => *id == written,
            SwitchSide::Chain(items) => items.iter().any(|(id, _)| *id == written),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum VarSpec {
    Eq(i64),
    /// Inclusive on both ends.
    Range(i64, i64),
}

impl VarSpec {
    fn matches(&self, v: i64) -> bool {
        match self {
            VarSpec::Eq(want) => v == *want,
            VarSpec::Range(lo, hi) => v >= *lo && v <= *hi,
        }
    }
}

#[derive(Debug, Clone)]
pub enum VarSide {
    None,
    Single { id: i32, spec: VarSpec },
    Chain(Vec<(i32, VarSpec)>),
}

impl VarSide {
    fn first_id(&self) -> Option<i32> {
        match self {
            VarSide::None => None,
            VarSide::Single { id, .. } => Some(*id),
            VarSide::Chain(items) => items.first().map(|(id, _)| *id),
        }
    }

    fn involves(&self, written: i32) -> bool {
        match self {
            VarSide::None => false,
            VarSide::Single { id, .. } => *id == written,
            VarSide::Chain(items) => items.iter().any(|(id, _)| *id == written),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CoordRect {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl CoordRect {
    fn contains(&self, x: i64, y: i64) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub id: String,
    pub map_id: Option<i32>,
    pub trigger: TriggerKind,
    /// When set, the var side drives and the switch side gates.
    pub var_trigger: bool,
    pub switch_side: SwitchSide,
    pub var_side: VarSide,
    pub coords: Option<CoordRect>,
    pub time_trial: bool,
    /// Picture name or event key for the string-keyed trigger classes.
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MinigameDef {
    pub id: String,
    pub switch_id: Option<i32>,
    pub switch_value: bool,
    pub var_id: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawCondition {
    id: String,
    map_id: Option<i32>,
    trigger: String,
    var_trigger: bool,
    switch_id: Option<i32>,
    switch_value: Option<bool>,
    switch_ids: Vec<i32>,
    switch_values: Vec<bool>,
    var_id: Option<i32>,
    var_value: Option<i64>,
    var_value2: Option<i64>,
    var_ids: Vec<i32>,
    var_values: Vec<i64>,
    coords: Option<CoordRect>,
    time_trial: bool,
    value: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawMinigame {
    id: String,
    switch_id: Option<i32>,
    switch_value: Option<bool>,
    var_id: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    conditions: Vec<RawCondition>,
    minigames: Vec<RawMinigame>,
}

fn parse_trigger(s: &str, cond_id: &str) -> anyhow::Result<TriggerKind> {
    Ok(match s {
        "" | "default" => TriggerKind::Default,
        "teleport" => TriggerKind::Teleport,
        "coords" => TriggerKind::Coords,
        "picture" => TriggerKind::Picture,
        "event" => TriggerKind::Event,
        "eventAction" | "event_action" => TriggerKind::EventAction,
        "prevMap" | "prev_map" => TriggerKind::PrevMap,
        other => bail!("condition {cond_id}: unknown trigger {other:?}"),
    })
}

impl RawCondition {
    fn build(self) -> anyhow::Result<Condition> {
        let trigger = parse_trigger(&self.trigger, &self.id)?;

        let switch_side = if !self.switch_ids.is_empty() {
            if self.switch_values.len() != self.switch_ids.len() {
                bail!("condition {}: switchIds/switchValues length mismatch", self.id);
            }
            SwitchSide::Chain(
                self.switch_ids
                    .iter()
                    .copied()
                    .zip(self.switch_values.iter().copied())
                    .collect(),
            )
        } else if let Some(id) = self.switch_id {
            SwitchSide::Single {
                id,
                value: self.switch_value.unwrap_or(true),
            }
        } else {
            SwitchSide::None
        };

        let var_side = if !self.var_ids.is_empty() {
            if self.var_values.len() != self.var_ids.len() {
                bail!("condition {}: varIds/varValues length mismatch", self.id);
            }
            VarSide::Chain(
                self.var_ids
                    .iter()
                    .copied()
                    .zip(self.var_values.iter().map(|v| VarSpec::Eq(*v)))
                    .collect(),
            )
        } else if let Some(id) = self.var_id {
            let spec = match (self.var_value, self.var_value2) {
                (Some(lo), Some(hi)) => VarSpec::Range(lo, hi),
                (Some(v), None) => VarSpec::Eq(v),
                (None, Some(_)) => bail!("condition {}: varValue2 without varValue", self.id),
                (None, None) => bail!("condition {}: varId without varValue", self.id),
            };
            VarSide::Single { id, spec }
        } else {
            VarSide::None
        };

        if self.var_trigger && matches!(var_side, VarSide::None) {
            bail!("condition {}: varTrigger without a var side", self.id);
        }

        Ok(Condition {
            id: self.id,
            map_id: self.map_id,
            trigger,
            var_trigger: self.var_trigger,
            switch_side,
            var_side,
            coords: self.coords,
            time_trial: self.time_trial,
            value: self.value,
        })
    }
}

/// Outcome of matching a write against a condition's driving side.
enum Drive {
    No,
    /// Matched a non-final chain position; the id of the next step.
    Hint(i32),
    Full,
}

fn drive_switch(side: &SwitchSide, cache: &HashMap<i32, bool>, written: i32) -> Drive {
    match side {
        SwitchSide::None => Drive::No,
        SwitchSide::Single { id, value } => {
            if *id == written && cache.get(id) == Some(value) {
                Drive::Full
            } else {
                Drive::No
            }
        }
        SwitchSide::Chain(items) => {
            for (i, (id, want)) in items.iter().enumerate() {
                let ok = cache.get(id) == Some(want);
                if *id == written {
                    if !ok {
                        return Drive::No;
                    }
                    return match items.get(i + 1) {
                        Some((next, _)) => Drive::Hint(*next),
                        None => Drive::Full,
                    };
                }
                if !ok {
                    return Drive::No;
                }
            }
            Drive::No
        }
    }
}

fn drive_var(side: &VarSide, cache: &HashMap<i32, i64>, written: i32) -> Drive {
    match side {
        VarSide::None => Drive::No,
        VarSide::Single { id, spec } => {
            if *id == written && cache.get(id).map(|v| spec.matches(*v)).unwrap_or(false) {
                Drive::Full
            } else {
                Drive::No
            }
        }
        VarSide::Chain(items) => {
            for (i, (id, spec)) in items.iter().enumerate() {
                let ok = cache.get(id).map(|v| spec.matches(*v)).unwrap_or(false);
                if *id == written {
                    if !ok {
                        return Drive::No;
                    }
                    return match items.get(i + 1) {
                        Some((next, _)) => Drive::Hint(*next),
                        None => Drive::Full,
                    };
                }
                if !ok {
                    return Drive::No;
                }
            }
            Drive::No
        }
    }
}

fn switch_gate(side: &SwitchSide, cache: &HashMap<i32, bool>) -> bool {
    match side {
        SwitchSide::None => true,
        SwitchSide::Single { id, value } => cache.get(id) == Some(value),
        SwitchSide::Chain(items) => items.iter().all(|(id, want)| cache.get(id) == Some(want)),
    }
}

fn var_gate(side: &VarSide, cache: &HashMap<i32, i64>) -> bool {
    match side {
        VarSide::None => true,
        VarSide::Single { id, spec } => {
            cache.get(id).map(|v| spec.matches(*v)).unwrap_or(false)
        }
        VarSide::Chain(items) => items
            .iter()
            .all(|(id, spec)| cache.get(id).map(|v| spec.matches(*v)).unwrap_or(false)),
    }
}

#[derive(Debug, Default)]
pub struct ConditionEngine {
    global: Vec<Arc<Condition>>,
    by_room: HashMap<i32, Vec<Arc<Condition>>>,
    minigames: Vec<MinigameDef>,
    time_trial_switch: Option<i32>,
}

impl ConditionEngine {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(conditions: Vec<Condition>, minigames: Vec<MinigameDef>, host_profile: bool) -> Self {
        let mut global = Vec::new();
        let mut by_room: HashMap<i32, Vec<Arc<Condition>>> = HashMap::new();
        for c in conditions {
            let c = Arc::new(c);
            match c.map_id {
                Some(m) => by_room.entry(m).or_default().push(c),
                None => global.push(c),
            }
        }
        Self {
            global,
            by_room,
            minigames,
            time_trial_switch: host_profile.then_some(TIME_TRIAL_SWITCH_ID),
        }
    }

    pub fn load(path: &Path, host_profile: bool) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read conditions file {}", path.display()))?;
        let raw: RawConfig = serde_json::from_str(&s)
            .with_context(|| format!("parse conditions file {}", path.display()))?;
        let conditions = raw
            .conditions
            .into_iter()
            .map(RawCondition::build)
            .collect::<anyhow::Result<Vec<_>>>()?;
        let minigames = raw
            .minigames
            .into_iter()
            .map(|m| MinigameDef {
                id: m.id,
                switch_id: m.switch_id,
                switch_value: m.switch_value.unwrap_or(true),
                var_id: m.var_id,
            })
            .collect();
        Ok(Self::new(conditions, minigames, host_profile))
    }

    fn candidates(&self, map_id: Option<i32>) -> impl Iterator<Item = &Arc<Condition>> + '_ {
        self.global.iter().chain(
            map_id
                .and_then(|m| self.by_room.get(&m))
                .into_iter()
                .flatten(),
        )
    }

    /// Whether joining this room should turn on coordinate syncing.
    pub fn room_has_coord_triggers(&self, map_id: i32) -> bool {
        self.candidates(Some(map_id))
            .any(|c| c.trigger == TriggerKind::Coords)
    }

    fn coords_ok(cond: &Condition, client: &Client) -> bool {
        match &cond.coords {
            Some(rect) => rect.contains(i64::from(client.x), i64::from(client.y)),
            None => true,
        }
    }

    async fn fire(
        &self,
        client: &Client,
        cond: &Condition,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        let fresh = store
            .lock()
            .await
            .try_write_player_tag(&client.uuid, &cond.id)?;
        if fresh {
            client.send(build_msg(&[Part::Str("b"), Part::Str(&cond.id)]));
        }
        Ok(())
    }

    /// Run after a switch value lands in the cache.
    pub async fn on_switch_write(
        &self,
        client: &mut Client,
        id: i32,
        value: bool,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        client.switch_cache.insert(id, value);

        // Host deployment: arming the time-trial switch nudges the
        // client to re-report elapsed time, nothing else.
        if self.time_trial_switch == Some(id) && value {
            client.send(build_msg(&[
                Part::Str("sv"),
                Part::Int(i64::from(ELAPSED_TIME_VAR_ID)),
                Part::Int(0),
            ]));
            return Ok(());
        }

        self.check_minigames(client, None, store).await?;

        for cond in self.candidates(client.map_id) {
            if cond.trigger != TriggerKind::Default {
                continue;
            }
            if cond.var_trigger {
                // This write landed on the gate side. When it completes
                // the switch gate, nudge the client to re-report the
                // driving variable so the condition can re-evaluate.
                if cond.switch_side.involves(id)
                    && switch_gate(&cond.switch_side, &client.switch_cache)
                {
                    if cond.time_trial {
                        if self.time_trial_switch.is_some() {
                            client.send(build_msg(&[
                                Part::Str("ss"),
                                Part::Int(i64::from(TIME_TRIAL_SWITCH_ID)),
                                Part::Int(0),
                            ]));
                        }
                    } else if let Some(var_id) = cond.var_side.first_id() {
                        client.send(build_msg(&[
                            Part::Str("sv"),
                            Part::Int(i64::from(var_id)),
                            Part::Int(0),
                        ]));
                    }
                }
                continue;
            }
            // The other side gates everything, chain hints included.
            if !var_gate(&cond.var_side, &client.var_cache) {
                continue;
            }
            match drive_switch(&cond.switch_side, &client.switch_cache, id) {
                Drive::No => {}
                Drive::Hint(next) => {
                    client.send(build_msg(&[
                        Part::Str("ss"),
                        Part::Int(i64::from(next)),
                        Part::Int(0),
                    ]));
                }
                Drive::Full => {
                    if !cond.time_trial && Self::coords_ok(cond, client) {
                        self.fire(client, cond, store).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run after a variable value lands in the cache.
    pub async fn on_var_write(
        &self,
        client: &mut Client,
        id: i32,
        value: i64,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        client.var_cache.insert(id, value);

        self.check_minigames(client, Some(id), store).await?;

        for cond in self.candidates(client.map_id) {
            if cond.trigger != TriggerKind::Default {
                continue;
            }
            if !cond.var_trigger {
                // Gate-side write: a completed var gate nudges the
                // client to re-report the driving switch.
                if cond.var_side.involves(id) && var_gate(&cond.var_side, &client.var_cache) {
                    if cond.time_trial {
                        if self.time_trial_switch.is_some() {
                            client.send(build_msg(&[
                                Part::Str("ss"),
                                Part::Int(i64::from(TIME_TRIAL_SWITCH_ID)),
                                Part::Int(0),
                            ]));
                        }
                    } else if let Some(switch_id) = cond.switch_side.first_id() {
                        client.send(build_msg(&[
                            Part::Str("ss"),
                            Part::Int(i64::from(switch_id)),
                            Part::Int(0),
                        ]));
                    }
                }
                continue;
            }
            if !switch_gate(&cond.switch_side, &client.switch_cache) {
                continue;
            }
            match drive_var(&cond.var_side, &client.var_cache, id) {
                Drive::No => {}
                Drive::Hint(next) => {
                    client.send(build_msg(&[
                        Part::Str("sv"),
                        Part::Int(i64::from(next)),
                        Part::Int(0),
                    ]));
                }
                Drive::Full => {
                    if !Self::coords_ok(cond, client) {
                        continue;
                    }
                    if cond.time_trial {
                        if value < TIME_TRIAL_MAX_SECONDS {
                            if let Some(map_id) = client.map_id {
                                let fresh = store
                                    .lock()
                                    .await
                                    .try_write_player_time_trial(&client.uuid, map_id, value)?;
                                // A fresh personal best still earns the
                                // confirmation echo, just no tag.
                                if fresh {
                                    client.send(build_msg(&[
                                        Part::Str("b"),
                                        Part::Str(&cond.id),
                                    ]));
                                }
                            }
                        }
                    } else {
                        self.fire(client, cond, store).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Run after movement; `teleport` distinguishes the `tp` command
    /// from plain coordinate updates.
    pub async fn on_move(
        &self,
        client: &Client,
        teleport: bool,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        let want = if teleport {
            TriggerKind::Teleport
        } else {
            TriggerKind::Coords
        };
        for cond in self.candidates(client.map_id) {
            if cond.trigger != want || cond.time_trial {
                continue;
            }
            if Self::coords_ok(cond, client)
                && switch_gate(&cond.switch_side, &client.switch_cache)
                && var_gate(&cond.var_side, &client.var_cache)
            {
                self.fire(client, cond, store).await?;
            }
        }
        Ok(())
    }

    /// Run after a picture is shown.
    pub async fn on_picture(
        &self,
        client: &Client,
        name: &str,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        for cond in self.candidates(client.map_id) {
            if cond.trigger != TriggerKind::Picture || cond.time_trial {
                continue;
            }
            if cond.value.as_deref() != Some(name) {
                continue;
            }
            if Self::coords_ok(cond, client)
                && switch_gate(&cond.switch_side, &client.switch_cache)
                && var_gate(&cond.var_side, &client.var_cache)
            {
                self.fire(client, cond, store).await?;
            }
        }
        Ok(())
    }

    /// Run after a `ploc` report updates the previous-map fields.
    pub async fn on_prev_map(
        &self,
        client: &Client,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        for cond in self.candidates(client.map_id) {
            if cond.trigger != TriggerKind::PrevMap || cond.time_trial {
                continue;
            }
            if cond.value.as_deref() != Some(client.prev_map_id.as_str()) {
                continue;
            }
            if Self::coords_ok(cond, client)
                && switch_gate(&cond.switch_side, &client.switch_cache)
                && var_gate(&cond.var_side, &client.var_cache)
            {
                self.fire(client, cond, store).await?;
            }
        }
        Ok(())
    }

    /// Run on an `sev` report; `action` selects the event-action class.
    pub async fn on_event(
        &self,
        client: &Client,
        event_key: &str,
        action: bool,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        let want = if action {
            TriggerKind::EventAction
        } else {
            TriggerKind::Event
        };
        for cond in self.candidates(client.map_id) {
            if cond.trigger != want || cond.time_trial {
                continue;
            }
            if cond.value.as_deref() != Some(event_key) {
                continue;
            }
            if switch_gate(&cond.switch_side, &client.switch_cache)
                && var_gate(&cond.var_side, &client.var_cache)
            {
                self.fire(client, cond, store).await?;
            }
        }
        Ok(())
    }

    /// `written_var` is the variable id that triggered this pass, when
    /// the pass came from a var write.
    async fn check_minigames(
        &self,
        client: &mut Client,
        written_var: Option<i32>,
        store: &Mutex<PlayerStore>,
    ) -> anyhow::Result<()> {
        for def in &self.minigames {
            if let Some(sid) = def.switch_id {
                if client.switch_cache.get(&sid) != Some(&def.switch_value) {
                    // A score report with the gate switch unknown asks
                    // the client to re-report it.
                    if written_var == Some(def.var_id) {
                        client.send(build_msg(&[
                            Part::Str("ss"),
                            Part::Int(i64::from(sid)),
                            Part::Int(0),
                        ]));
                    }
                    continue;
                }
            }
            let Some(score) = client.var_cache.get(&def.var_id).copied() else {
                continue;
            };
            let improves = client
                .minigame_best
                .get(&def.id)
                .map(|best| score > *best)
                .unwrap_or(true);
            if !improves {
                continue;
            }
            store
                .lock()
                .await
                .try_write_player_minigame_score(&client.uuid, &def.id, score)?;
            client.minigame_best.insert(def.id.clone(), score);
        }
        Ok(())
    }
}
