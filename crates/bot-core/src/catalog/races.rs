//! Race index keyed by career date.
//!
//! Each date key ("Y3-06-2") lists the race cards that can appear on that
//! day's Raceday list, with the display title the card actually shows and the
//! rank badge next to it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::date::CareerDate;
use crate::text::normalize_ocr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum RaceRank {
    #[serde(rename = "OP")]
    Op,
    #[serde(rename = "G3")]
    G3,
    #[serde(rename = "G2")]
    G2,
    #[serde(rename = "G1")]
    G1,
    #[serde(rename = "EX")]
    Ex,
}

impl RaceRank {
    /// Selection priority: EX > G1 > G2 > G3 > OP.
    pub fn priority(&self) -> u8 {
        match self {
            RaceRank::Op => 1,
            RaceRank::G3 => 2,
            RaceRank::G2 => 3,
            RaceRank::G1 => 4,
            RaceRank::Ex => 5,
        }
    }

    pub fn parse_label(label: &str) -> Option<RaceRank> {
        match normalize_ocr(label).as_str() {
            "ex" => Some(RaceRank::Ex),
            "g1" | "gl" => Some(RaceRank::G1),
            "g2" => Some(RaceRank::G2),
            "g3" => Some(RaceRank::G3),
            "op" | "0p" => Some(RaceRank::Op),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RaceEntry {
    pub name: String,
    /// The text the race card shows; may differ from the canonical name.
    #[serde(default)]
    pub display_title: String,
    pub rank: RaceRank,
    /// Position in the day's list (1-based), when known.
    #[serde(default = "one")]
    pub order: u8,
}

fn one() -> u8 {
    1
}

impl RaceEntry {
    pub fn title_for_matching(&self) -> &str {
        if self.display_title.is_empty() {
            &self.name
        } else {
            &self.display_title
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RaceIndex {
    /// Date key -> race cards available that day.
    #[serde(default)]
    by_date: BTreeMap<String, Vec<RaceEntry>>,
    /// Unity Cup pre-season showdown slots: date key -> race index (1..=4).
    #[serde(default)]
    unity_preseason: BTreeMap<String, u8>,
}

impl RaceIndex {
    pub fn from_entries(by_date: BTreeMap<String, Vec<RaceEntry>>) -> Self {
        Self {
            by_date,
            unity_preseason: BTreeMap::new(),
        }
    }

    pub fn load_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn canonicalize(name: &str) -> String {
        normalize_ocr(name)
    }

    pub fn races_on(&self, date_key: &str) -> &[RaceEntry] {
        self.by_date.get(date_key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entry_for_name_on_date(&self, name: &str, date_key: &str) -> Option<&RaceEntry> {
        let canon = Self::canonicalize(name);
        self.races_on(date_key)
            .iter()
            .find(|e| Self::canonicalize(&e.name) == canon)
    }

    pub fn valid_date_for_race(&self, name: &str, date_key: &str) -> bool {
        self.entry_for_name_on_date(name, date_key).is_some()
    }

    /// All display titles this race uses across the calendar, for matching
    /// when the date binding is unknown.
    pub fn expected_titles_for_race(&self, name: &str) -> Vec<(String, RaceRank)> {
        let canon = Self::canonicalize(name);
        let mut out = Vec::new();
        for entries in self.by_date.values() {
            for e in entries {
                if Self::canonicalize(&e.name) == canon {
                    let title = e.title_for_matching().to_string();
                    if !out.iter().any(|(t, _)| *t == title) {
                        out.push((title, e.rank));
                    }
                }
            }
        }
        out
    }

    /// Unity Cup pre-season race index for the date, when the date falls on a
    /// scheduled showdown.
    pub fn unity_preseason_index(&self, date: &CareerDate) -> Option<u8> {
        self.unity_preseason.get(&date.key()).copied()
    }

    pub fn set_unity_preseason(&mut self, date_key: &str, race_index: u8) {
        self.unity_preseason
            .insert(date_key.to_string(), race_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RaceIndex {
        let mut by_date = BTreeMap::new();
        by_date.insert(
            "Y3-06-2".to_string(),
            vec![RaceEntry {
                name: "Summer Crown".to_string(),
                display_title: "Summer Crown Turf 2200".to_string(),
                rank: RaceRank::G1,
                order: 1,
            }],
        );
        RaceIndex::from_entries(by_date)
    }

    #[test]
    fn lookup_by_date_and_name() {
        let idx = sample();
        assert!(idx.valid_date_for_race("summer crown", "Y3-06-2"));
        assert!(!idx.valid_date_for_race("summer crown", "Y3-07-1"));
        let e = idx.entry_for_name_on_date("Summer Crown", "Y3-06-2").unwrap();
        assert_eq!(e.rank, RaceRank::G1);
        assert_eq!(e.title_for_matching(), "Summer Crown Turf 2200");
    }

    #[test]
    fn rank_priorities_and_parsing() {
        assert!(RaceRank::Ex.priority() > RaceRank::G1.priority());
        assert_eq!(RaceRank::parse_label(" G1 "), Some(RaceRank::G1));
        assert_eq!(RaceRank::parse_label("??"), None);
    }

    #[test]
    fn preseason_index_by_date() {
        let mut idx = sample();
        idx.set_unity_preseason("Y2-09-1", 2);
        assert_eq!(
            idx.unity_preseason_index(&CareerDate::new(2, 9, 1)),
            Some(2)
        );
        assert_eq!(idx.unity_preseason_index(&CareerDate::new(2, 9, 2)), None);
    }
}
