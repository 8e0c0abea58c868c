//! Planned-race index with skip guards.
//!
//! After a failed match attempt the date is put on a cooldown so the loop
//! does not oscillate between Lobby and Raceday retrying the same title.

use std::collections::BTreeMap;

use tracing::info;

use crate::config::PlannedRaceEntry;

#[derive(Debug, Clone)]
struct PlannedSlot {
    name: String,
    tentative: bool,
    cooldown: u32,
    completed: bool,
}

#[derive(Debug, Default)]
pub struct PlannedRaceIndex {
    slots: BTreeMap<String, PlannedSlot>,
}

impl PlannedRaceIndex {
    pub fn from_preset(planned: &BTreeMap<String, PlannedRaceEntry>) -> Self {
        let slots = planned
            .iter()
            .map(|(key, entry)| {
                (
                    key.clone(),
                    PlannedSlot {
                        name: entry.name.clone(),
                        tentative: entry.tentative,
                        cooldown: 0,
                        completed: false,
                    },
                )
            })
            .collect();
        Self { slots }
    }

    /// Active plan for the date. A slot on cooldown or already completed is
    /// treated as absent.
    pub fn race_for(&self, date_key: &str) -> Option<(&str, bool)> {
        self.slots.get(date_key).and_then(|slot| {
            if slot.cooldown > 0 || slot.completed {
                None
            } else {
                Some((slot.name.as_str(), slot.tentative))
            }
        })
    }

    pub fn is_tentative(&self, date_key: &str) -> bool {
        self.slots
            .get(date_key)
            .map(|s| s.tentative)
            .unwrap_or(false)
    }

    pub fn mark_skipped(&mut self, date_key: &str, cooldown: u32) {
        if let Some(slot) = self.slots.get_mut(date_key) {
            slot.cooldown = cooldown;
            info!(
                "[planned_race] skip_guard=1 after failure plan='{}' key={} cooldown={}",
                slot.name, date_key, cooldown
            );
        }
    }

    pub fn mark_completed(&mut self, date_key: &str) {
        if let Some(slot) = self.slots.get_mut(date_key) {
            slot.completed = true;
            info!(
                "[planned_race] completed plan='{}' key={}",
                slot.name, date_key
            );
        }
    }

    /// Decrement cooldowns once per loop tick; logs guard releases.
    pub fn tick(&mut self) {
        for (key, slot) in self.slots.iter_mut() {
            if slot.cooldown > 0 {
                slot.cooldown -= 1;
                if slot.cooldown == 0 {
                    info!("[planned_race] skip guard released key={}", key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(key: &str, name: &str, tentative: bool) -> PlannedRaceIndex {
        let mut planned = BTreeMap::new();
        planned.insert(
            key.to_string(),
            PlannedRaceEntry {
                name: name.to_string(),
                tentative,
            },
        );
        PlannedRaceIndex::from_preset(&planned)
    }

    #[test]
    fn cooldown_hides_the_plan_until_it_elapses() {
        let mut idx = index_with("Y3-06-2", "Summer Crown", false);
        assert_eq!(idx.race_for("Y3-06-2"), Some(("Summer Crown", false)));

        idx.mark_skipped("Y3-06-2", 2);
        assert_eq!(idx.race_for("Y3-06-2"), None);
        idx.tick();
        assert_eq!(idx.race_for("Y3-06-2"), None);
        idx.tick();
        assert_eq!(idx.race_for("Y3-06-2"), Some(("Summer Crown", false)));
    }

    #[test]
    fn completion_is_terminal_for_the_date() {
        let mut idx = index_with("Y2-10-1", "Autumn Mile", true);
        assert!(idx.is_tentative("Y2-10-1"));
        idx.mark_completed("Y2-10-1");
        assert_eq!(idx.race_for("Y2-10-1"), None);
        idx.tick();
        assert_eq!(idx.race_for("Y2-10-1"), None);
    }

    #[test]
    fn unknown_dates_have_no_plan() {
        let idx = index_with("Y1-12-1", "Debut Cup", false);
        assert_eq!(idx.race_for("Y1-11-1"), None);
        assert!(!idx.is_tentative("Y1-11-1"));
    }
}
