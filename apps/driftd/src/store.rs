//! Player persistence.
//!
//! One JSON file, loaded at startup and rewritten whole on every
//! mutation via write-to-tmp-then-rename. With no backing path the
//! store is volatile, which is what the tests use.
//!
//! The `try_write_*` operations are the guarded writes the trigger
//! engine depends on: each one is idempotent or monotonic on its own,
//! so re-running a trigger after a reconnect never double-awards.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlayerRec {
    pub uuid: String,
    pub name: String,
    pub rank: i32,
    pub badge: String,
    pub badge_slot_rows: i32,
    pub badge_slot_cols: i32,
    pub banned: bool,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartyRec {
    pub id: i32,
    pub name: String,
    pub owner_uuid: String,
    pub password: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EventPeriodRec {
    pub id: i32,
    pub ends_unix: u64,
}

/// The scripted event currently eligible for exp awards.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActiveEventRec {
    pub period_id: i32,
    pub map_id: i32,
    pub event_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLocationRec {
    pub period_id: i32,
    pub map_id: i32,
    pub title: String,
    pub complete: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    players: HashMap<String, PlayerRec>,
    /// Bearer token -> uuid, for the admin surface.
    tokens: HashMap<String, String>,
    /// uuid -> condition ids already awarded.
    tags: HashMap<String, HashSet<String>>,
    /// uuid -> minigame id -> best score.
    minigame_scores: HashMap<String, HashMap<String, i64>>,
    /// uuid -> map id -> best (lowest) seconds.
    time_trials: HashMap<String, HashMap<i32, i64>>,
    /// "period:uuid:event" -> exp that was awarded.
    event_vms: HashMap<String, i32>,
    /// event id -> exp value; missing entries award 1.
    vm_exp: HashMap<i32, i32>,
    parties: HashMap<i32, PartyRec>,
    event_period: Option<EventPeriodRec>,
    active_event: Option<ActiveEventRec>,
    /// uuid -> assigned event locations.
    event_locations: HashMap<String, Vec<EventLocationRec>>,
}

#[derive(Debug)]
pub struct PlayerStore {
    path: Option<PathBuf>,
    state: StoreState,
}

impl PlayerStore {
    /// Volatile store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: StoreState::default(),
        }
    }

    pub fn load(path: PathBuf) -> Self {
        let state = match std::fs::read_to_string(&path) {
            Ok(s) => match serde_json::from_str::<StoreState>(&s) {
                Ok(v) => v,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "store file unreadable, starting fresh");
                    StoreState::default()
                }
            },
            Err(_) => StoreState::default(),
        };
        Self {
            path: Some(path),
            state,
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let s = serde_json::to_string_pretty(&self.state).context("serialize store")?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, s).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    /// Fetch a player, creating a default record on first sight.
    pub fn get_player(&mut self, uuid: &str) -> anyhow::Result<PlayerRec> {
        if let Some(rec) = self.state.players.get(uuid) {
            return Ok(rec.clone());
        }
        let rec = PlayerRec {
            uuid: uuid.to_string(),
            ..PlayerRec::default()
        };
        self.state.players.insert(uuid.to_string(), rec.clone());
        self.save()?;
        Ok(rec)
    }

    pub fn set_name(&mut self, uuid: &str, name: &str) -> anyhow::Result<()> {
        if let Some(rec) = self.state.players.get_mut(uuid) {
            rec.name = name.to_string();
            self.save()?;
        }
        Ok(())
    }

    /// Award a tag once. Returns `true` only on a fresh award.
    pub fn try_write_player_tag(&mut self, uuid: &str, cond_id: &str) -> anyhow::Result<bool> {
        let fresh = self
            .state
            .tags
            .entry(uuid.to_string())
            .or_default()
            .insert(cond_id.to_string());
        if fresh {
            self.save()?;
        }
        Ok(fresh)
    }

    pub fn has_player_tag(&self, uuid: &str, cond_id: &str) -> bool {
        self.state
            .tags
            .get(uuid)
            .map(|t| t.contains(cond_id))
            .unwrap_or(false)
    }

    /// Record a minigame score if it strictly beats the stored best.
    pub fn try_write_player_minigame_score(
        &mut self,
        uuid: &str,
        minigame: &str,
        score: i64,
    ) -> anyhow::Result<bool> {
        let scores = self.state.minigame_scores.entry(uuid.to_string()).or_default();
        match scores.get(minigame) {
            Some(best) if *best >= score => Ok(false),
            _ => {
                scores.insert(minigame.to_string(), score);
                self.save()?;
                Ok(true)
            }
        }
    }

    pub fn player_minigame_score(&self, uuid: &str, minigame: &str) -> Option<i64> {
        self.state.minigame_scores.get(uuid)?.get(minigame).copied()
    }

    /// Record a time-trial result if it strictly beats (is lower than)
    /// the stored best for that map.
    pub fn try_write_player_time_trial(
        &mut self,
        uuid: &str,
        map_id: i32,
        seconds: i64,
    ) -> anyhow::Result<bool> {
        let trials = self.state.time_trials.entry(uuid.to_string()).or_default();
        match trials.get(&map_id) {
            Some(best) if *best <= seconds => Ok(false),
            _ => {
                trials.insert(map_id, seconds);
                self.save()?;
                Ok(true)
            }
        }
    }

    /// Complete an event VM once per (period, player, event). Returns
    /// the exp awarded, `None` when already completed. A fresh
    /// completion also marks the player's matching event location
    /// complete.
    pub fn try_complete_event_vm(
        &mut self,
        period_id: i32,
        uuid: &str,
        map_id: i32,
        event_id: i32,
    ) -> anyhow::Result<Option<i32>> {
        let key = format!("{period_id}:{uuid}:{event_id}");
        if self.state.event_vms.contains_key(&key) {
            return Ok(None);
        }
        let exp = self.state.vm_exp.get(&event_id).copied().unwrap_or(1);
        self.state.event_vms.insert(key, exp);
        if let Some(locations) = self.state.event_locations.get_mut(uuid) {
            for l in locations
                .iter_mut()
                .filter(|l| l.period_id == period_id && l.map_id == map_id)
            {
                l.complete = true;
            }
        }
        self.save()?;
        Ok(Some(exp))
    }

    pub fn party_for(&self, uuid: &str) -> Option<PartyRec> {
        self.state
            .parties
            .values()
            .find(|p| p.members.iter().any(|m| m == uuid))
            .cloned()
    }

    pub fn event_period(&self) -> Option<EventPeriodRec> {
        self.state.event_period
    }

    pub fn active_event(&self) -> Option<ActiveEventRec> {
        self.state.active_event
    }

    pub fn set_event_period(&mut self, period: EventPeriodRec) -> anyhow::Result<()> {
        self.state.event_period = Some(period);
        self.save()
    }

    pub fn event_locations(&self, uuid: &str, period_id: i32) -> Vec<EventLocationRec> {
        self.state
            .event_locations
            .get(uuid)
            .map(|v| {
                v.iter()
                    .filter(|l| l.period_id == period_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn add_event_location(&mut self, uuid: &str, rec: EventLocationRec) -> anyhow::Result<()> {
        self.state
            .event_locations
            .entry(uuid.to_string())
            .or_default()
            .push(rec);
        self.save()
    }

    pub fn resolve_token(&self, token: &str) -> Option<(String, i32)> {
        let uuid = self.state.tokens.get(token)?;
        let rank = self.state.players.get(uuid).map(|p| p.rank).unwrap_or(0);
        Some((uuid.clone(), rank))
    }

    pub fn insert_token(&mut self, token: &str, uuid: &str) -> anyhow::Result<()> {
        self.state.tokens.insert(token.to_string(), uuid.to_string());
        self.save()
    }

    /// Resolve an admin `user` argument: exact uuid first, then name.
    pub fn resolve_user(&self, user: &str) -> Option<String> {
        if self.state.players.contains_key(user) {
            return Some(user.to_string());
        }
        self.state
            .players
            .values()
            .find(|p| p.name == user)
            .map(|p| p.uuid.clone())
    }

    pub fn set_banned(&mut self, uuid: &str, banned: bool) -> anyhow::Result<bool> {
        match self.state.players.get_mut(uuid) {
            Some(rec) => {
                rec.banned = banned;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn set_muted(&mut self, uuid: &str, muted: bool) -> anyhow::Result<bool> {
        match self.state.players.get_mut(uuid) {
            Some(rec) => {
                rec.muted = muted;
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn rename(&mut self, uuid: &str, new_name: &str) -> anyhow::Result<bool> {
        match self.state.players.get_mut(uuid) {
            Some(rec) => {
                rec.name = new_name.to_string();
                self.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_players(&self) -> Vec<PlayerRec> {
        let mut v: Vec<PlayerRec> = self.state.players.values().cloned().collect();
        v.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        v
    }

    #[cfg(test)]
    pub(crate) fn insert_player_for_test(&mut self, rec: PlayerRec) {
        self.state.players.insert(rec.uuid.clone(), rec);
    }

    #[cfg(test)]
    pub(crate) fn insert_party_for_test(&mut self, rec: PartyRec) {
        self.state.parties.insert(rec.id, rec);
    }

    #[cfg(test)]
    pub(crate) fn insert_vm_exp_for_test(&mut self, event_id: i32, exp: i32) {
        self.state.vm_exp.insert(event_id, exp);
    }

    #[cfg(test)]
    pub(crate) fn set_active_event_for_test(&mut self, ev: ActiveEventRec) {
        self.state.active_event = Some(ev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_award_is_idempotent() {
        let mut s = PlayerStore::in_memory();
        assert!(s.try_write_player_tag("u-1", "badge_a").unwrap());
        assert!(!s.try_write_player_tag("u-1", "badge_a").unwrap());
        assert!(s.has_player_tag("u-1", "badge_a"));
        assert!(!s.has_player_tag("u-1", "badge_b"));
    }

    #[test]
    fn minigame_scores_only_move_up() {
        let mut s = PlayerStore::in_memory();
        assert!(s.try_write_player_minigame_score("u-1", "snake", 10).unwrap());
        assert!(!s.try_write_player_minigame_score("u-1", "snake", 10).unwrap());
        assert!(!s.try_write_player_minigame_score("u-1", "snake", 5).unwrap());
        assert!(s.try_write_player_minigame_score("u-1", "snake", 11).unwrap());
        assert_eq!(s.player_minigame_score("u-1", "snake"), Some(11));
    }

    #[test]
    fn time_trials_only_move_down() {
        let mut s = PlayerStore::in_memory();
        assert!(s.try_write_player_time_trial("u-1", 42, 300).unwrap());
        assert!(!s.try_write_player_time_trial("u-1", 42, 300).unwrap());
        assert!(!s.try_write_player_time_trial("u-1", 42, 500).unwrap());
        assert!(s.try_write_player_time_trial("u-1", 42, 299).unwrap());
    }

    #[test]
    fn event_vm_awards_once_per_period_player_event() {
        let mut s = PlayerStore::in_memory();
        assert_eq!(s.try_complete_event_vm(1, "u-1", 30, 7).unwrap(), Some(1));
        assert_eq!(s.try_complete_event_vm(1, "u-1", 30, 7).unwrap(), None);
        // Different period or player awards again.
        assert_eq!(s.try_complete_event_vm(2, "u-1", 30, 7).unwrap(), Some(1));
        assert_eq!(s.try_complete_event_vm(1, "u-2", 30, 7).unwrap(), Some(1));
    }

    #[test]
    fn event_vm_completion_marks_the_location() {
        let mut s = PlayerStore::in_memory();
        s.add_event_location(
            "u-1",
            EventLocationRec {
                period_id: 1,
                map_id: 30,
                title: "ruins".to_string(),
                complete: false,
            },
        )
        .unwrap();
        assert_eq!(s.try_complete_event_vm(1, "u-1", 30, 7).unwrap(), Some(1));
        assert!(s.event_locations("u-1", 1)[0].complete);
    }

    #[test]
    fn tokens_resolve_to_uuid_and_rank() {
        let mut s = PlayerStore::in_memory();
        s.insert_player_for_test(PlayerRec {
            uuid: "u-mod".to_string(),
            name: "Mod".to_string(),
            rank: 1,
            ..PlayerRec::default()
        });
        s.insert_token("secret", "u-mod").unwrap();
        assert_eq!(s.resolve_token("secret"), Some(("u-mod".to_string(), 1)));
        assert_eq!(s.resolve_token("wrong"), None);
    }

    #[test]
    fn resolve_user_matches_uuid_then_name() {
        let mut s = PlayerStore::in_memory();
        s.insert_player_for_test(PlayerRec {
            uuid: "u-9".to_string(),
            name: "Niner".to_string(),
            ..PlayerRec::default()
        });
        assert_eq!(s.resolve_user("u-9").as_deref(), Some("u-9"));
        assert_eq!(s.resolve_user("Niner").as_deref(), Some("u-9"));
        assert_eq!(s.resolve_user("Nobody"), None);
    }

    #[test]
    fn saves_and_reloads_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.json");
        {
            let mut s = PlayerStore::load(path.clone());
            s.try_write_player_tag("u-1", "badge_a").unwrap();
            s.try_write_player_time_trial("u-1", 3, 120).unwrap();
        }
        let s = PlayerStore::load(path);
        assert!(s.has_player_tag("u-1", "badge_a"));
    }
}
