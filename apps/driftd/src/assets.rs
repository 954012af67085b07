//! Resource allow-lists.
//!
//! Loaded once at startup from an optional JSON file and never
//! mutated afterwards, so handlers can hold an `Arc<Assets>` without
//! locking. An empty set means "allow everything", which is the dev
//! default when no assets file is configured.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Assets {
    pub sprite_names: HashSet<String>,
    pub system_names: HashSet<String>,
    pub sound_names: HashSet<String>,
    pub picture_names: HashSet<String>,
    pub picture_prefixes: Vec<String>,
}

impl Assets {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read assets file {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse assets file {}", path.display()))
    }

    fn allowed(set: &HashSet<String>, name: &str) -> bool {
        set.is_empty() || set.contains(name)
    }

    pub fn is_valid_sprite(&self, name: &str) -> bool {
        Self::allowed(&self.sprite_names, name)
    }

    pub fn is_valid_system(&self, name: &str) -> bool {
        Self::allowed(&self.system_names, name)
    }

    pub fn is_valid_sound(&self, name: &str) -> bool {
        Self::allowed(&self.sound_names, name)
    }

    pub fn is_valid_picture(&self, name: &str) -> bool {
        if self.picture_names.is_empty() && self.picture_prefixes.is_empty() {
            return true;
        }
        self.picture_names.contains(name)
            || self.picture_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Player-name rule: non-empty, ASCII alphanumeric only.
pub fn is_ok_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sets_allow_everything() {
        let a = Assets::default();
        assert!(a.is_valid_sprite("anything"));
        assert!(a.is_valid_picture("whatever"));
    }

    #[test]
    fn populated_sets_gate_names() {
        let mut a = Assets::default();
        a.sprite_names.insert("hero_red".to_string());
        assert!(a.is_valid_sprite("hero_red"));
        assert!(!a.is_valid_sprite("hero_blue"));
    }

    #[test]
    fn picture_prefixes_match() {
        let mut a = Assets::default();
        a.picture_prefixes.push("ui_".to_string());
        assert!(a.is_valid_picture("ui_cursor"));
        assert!(!a.is_valid_picture("bg_cursor"));
    }

    #[test]
    fn name_rule_is_alphanumeric() {
        assert!(is_ok_name("Traveler12"));
        assert!(!is_ok_name(""));
        assert!(!is_ok_name("has space"));
        assert!(!is_ok_name("uni\u{ffff}corn"));
    }
}
