use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::text::normalize_ocr;

/// Trainee mood, ordered worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    Awful,
    Bad,
    Normal,
    Good,
    Great,
}

impl Mood {
    pub fn parse_ocr(raw: &str) -> Option<Mood> {
        let norm = normalize_ocr(raw);
        for (needle, mood) in [
            ("awful", Mood::Awful),
            ("bad", Mood::Bad),
            ("normal", Mood::Normal),
            ("good", Mood::Good),
            ("great", Mood::Great),
        ] {
            if norm.contains(needle) {
                return Some(mood);
            }
        }
        None
    }
}

/// Running style, ordered as the strategy modal lays them out left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    End,
    Late,
    Pace,
    Front,
}

impl Style {
    pub fn label(&self) -> &'static str {
        match self {
            Style::End => "end",
            Style::Late => "late",
            Style::Pace => "pace",
            Style::Front => "front",
        }
    }

    /// Position in the strategy modal (left to right).
    pub fn modal_index(&self) -> usize {
        match self {
            Style::End => 0,
            Style::Late => 1,
            Style::Pace => 2,
            Style::Front => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum StatKey {
    #[serde(rename = "SPD")]
    Spd,
    #[serde(rename = "STA")]
    Sta,
    #[serde(rename = "PWR")]
    Pwr,
    #[serde(rename = "GUTS")]
    Guts,
    #[serde(rename = "WIT")]
    Wit,
}

impl StatKey {
    pub const ALL: [StatKey; 5] = [
        StatKey::Spd,
        StatKey::Sta,
        StatKey::Pwr,
        StatKey::Guts,
        StatKey::Wit,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StatKey::Spd => "SPD",
            StatKey::Sta => "STA",
            StatKey::Pwr => "PWR",
            StatKey::Guts => "GUTS",
            StatKey::Wit => "WIT",
        }
    }
}

pub type Stats = BTreeMap<StatKey, u32>;

/// Skill grade as shown in the shop: single circle (base) or double circle
/// (upgraded). A double-circle listing buys the base grade first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillGrade {
    Single,
    Double,
}

impl SkillGrade {
    pub fn symbol(&self) -> &'static str {
        match self {
            SkillGrade::Single => "○",
            SkillGrade::Double => "◎",
        }
    }
}

/// Headroom toward a target cap; zero when the stat is already capped.
pub fn stat_headroom(stats: &Stats, targets: &Stats, key: StatKey) -> u32 {
    let current = stats.get(&key).copied().unwrap_or(0);
    let target = targets.get(&key).copied().unwrap_or(u32::MAX);
    target.saturating_sub(current)
}

/// Uniform result for policy actions. Policies propagate reasons, not
/// booleans, so the loop can distinguish recoverable misses from failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Ok,
    NoMatch,
    SoftFail(&'static str),
    HardFail(&'static str),
}
