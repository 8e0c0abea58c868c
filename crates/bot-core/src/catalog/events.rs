//! Event catalog and per-entity preferences for the event decider.
//!
//! Records are keyed `type/name/attr/rarity/event` with a `#s<step>` suffix
//! for chain steps. Outcome records carry the reward payloads the decider
//! needs for energy-overflow avoidance and reward-priority rotation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::text::{fuzzy_ratio, normalize_ocr};
use crate::types::StatKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventEntityKind {
    Support,
    Trainee,
    Scenario,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct OutcomeRecord {
    pub stats: BTreeMap<StatKey, i32>,
    pub energy: i32,
    pub skill_pts: i32,
    pub hints: Vec<String>,
    pub mood: i8,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCategory {
    SkillPts,
    Stats,
    Hints,
    Energy,
}

pub const DEFAULT_REWARD_PRIORITY: [RewardCategory; 4] = [
    RewardCategory::SkillPts,
    RewardCategory::Stats,
    RewardCategory::Hints,
    RewardCategory::Energy,
];

/// Largest positive energy gain any outcome of an option can yield.
pub fn max_positive_energy(outcomes: &[OutcomeRecord]) -> i32 {
    outcomes.iter().map(|o| o.energy.max(0)).max().unwrap_or(0)
}

pub fn reward_categories(outcomes: &[OutcomeRecord]) -> BTreeSet<RewardCategory> {
    let mut cats = BTreeSet::new();
    for o in outcomes {
        if o.skill_pts > 0 {
            cats.insert(RewardCategory::SkillPts);
        }
        if o.stats.values().any(|v| *v > 0) {
            cats.insert(RewardCategory::Stats);
        }
        if !o.hints.is_empty() {
            cats.insert(RewardCategory::Hints);
        }
        if o.energy > 0 {
            cats.insert(RewardCategory::Energy);
        }
    }
    cats
}

/// Pick the first safe candidate carrying the highest-priority reward, then
/// any safe candidate in rotation order.
pub fn select_candidate_by_priority(
    candidate_order: &[u8],
    safe_candidates: &[u8],
    option_categories: &BTreeMap<u8, BTreeSet<RewardCategory>>,
    priority: &[RewardCategory],
) -> Option<(u8, Option<RewardCategory>)> {
    if safe_candidates.is_empty() {
        return None;
    }
    let priority: Vec<RewardCategory> = if priority.is_empty() {
        DEFAULT_REWARD_PRIORITY.to_vec()
    } else {
        priority.to_vec()
    };
    for category in &priority {
        for opt in candidate_order {
            if !safe_candidates.contains(opt) {
                continue;
            }
            if option_categories
                .get(opt)
                .map(|cats| cats.contains(category))
                .unwrap_or(false)
            {
                return Some((*opt, Some(*category)));
            }
        }
    }
    candidate_order
        .iter()
        .find(|opt| safe_candidates.contains(opt))
        .map(|opt| (*opt, None))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventRecord {
    /// `type/name/attr/rarity/event` without the step suffix.
    pub key: String,
    /// `key#s<step>` for chain events, equal to `key#s1` otherwise.
    pub key_step: String,
    pub kind: EventEntityKind,
    pub name: String,
    #[serde(default)]
    pub attribute: String,
    #[serde(default)]
    pub rarity: String,
    pub event_name: String,
    #[serde(default = "one")]
    pub step: u8,
    pub options: BTreeMap<u8, Vec<OutcomeRecord>>,
    #[serde(default)]
    pub default_preference: Option<u8>,
}

fn one() -> u8 {
    1
}

impl EventRecord {
    pub fn expected_options(&self) -> usize {
        self.options.len()
    }

    pub fn is_pal_support(&self) -> bool {
        self.kind == EventEntityKind::Support && self.attribute.eq_ignore_ascii_case("pal")
    }

    /// Whether any outcome of the given step restores energy; used by PAL
    /// chain prediction.
    pub fn option_restores_energy(&self, option: u8) -> bool {
        self.options
            .get(&option)
            .map(|outs| outs.iter().any(|o| o.energy > 0))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EventCatalog {
    #[serde(default)]
    records: Vec<EventRecord>,
}

impl EventCatalog {
    pub fn from_records(records: Vec<EventRecord>) -> Self {
        Self { records }
    }

    pub fn load_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Best record for an OCR'd event title. Chain-step hints narrow the pool
    /// first; the caller may retry with step 1 when nothing scores.
    pub fn find_best(
        &self,
        ocr_title: &str,
        kind_hint: Option<EventEntityKind>,
        chain_step_hint: Option<u8>,
        min_score: f32,
    ) -> Option<(&EventRecord, f32)> {
        let title_norm = normalize_ocr(ocr_title);
        if title_norm.is_empty() {
            return None;
        }
        let mut best: Option<(&EventRecord, f32)> = None;
        for rec in &self.records {
            if let Some(kind) = kind_hint {
                if rec.kind != kind {
                    continue;
                }
            }
            if let Some(step) = chain_step_hint {
                if rec.step != step {
                    continue;
                }
            }
            let score = fuzzy_ratio(&title_norm, &normalize_ocr(&rec.event_name));
            if score >= min_score && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((rec, score));
            }
        }
        best
    }

    /// Whether the next chain step of a PAL support still restores energy.
    pub fn next_chain_step_has_energy(&self, support_name: &str, next_step: u8) -> Option<bool> {
        let name_norm = normalize_ocr(support_name);
        let rec = self.records.iter().find(|r| {
            r.is_pal_support() && r.step == next_step && normalize_ocr(&r.name) == name_norm
        })?;
        Some(
            rec.options
                .values()
                .any(|outs| outs.iter().any(|o| o.energy > 0)),
        )
    }
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventPrefs {
    /// Exact key or key_step -> option number.
    pub overrides: BTreeMap<String, u8>,
    pub default_by_type: BTreeMap<EventEntityKind, u8>,
    pub avoid_energy_overflow: bool,
    /// Per-entity overrides keyed by the record's `key` prefix
    /// (`support/name/attr/rarity`, `scenario/name`, `trainee/name`).
    pub avoid_energy_overflow_by_entity: BTreeMap<String, bool>,
    pub reward_priority: Vec<RewardCategory>,
    pub reward_priority_by_entity: BTreeMap<String, Vec<RewardCategory>>,
    pub preferred_trainee_name: Option<String>,
}

impl Default for EventPrefs {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            default_by_type: BTreeMap::new(),
            avoid_energy_overflow: true,
            avoid_energy_overflow_by_entity: BTreeMap::new(),
            reward_priority: DEFAULT_REWARD_PRIORITY.to_vec(),
            reward_priority_by_entity: BTreeMap::new(),
            preferred_trainee_name: None,
        }
    }
}

impl EventPrefs {
    fn entity_key(rec: &EventRecord) -> String {
        match rec.kind {
            EventEntityKind::Support => format!(
                "support/{}/{}/{}",
                normalize_ocr(&rec.name),
                normalize_ocr(&rec.attribute),
                normalize_ocr(&rec.rarity)
            ),
            EventEntityKind::Scenario => format!("scenario/{}", normalize_ocr(&rec.name)),
            EventEntityKind::Trainee => format!("trainee/{}", normalize_ocr(&rec.name)),
        }
    }

    /// Resolve the preferred option: step-aware override, then legacy key
    /// override, then the record default, then the type default.
    pub fn pick_for(&self, rec: &EventRecord) -> u8 {
        if let Some(pick) = self.overrides.get(&rec.key_step) {
            return *pick;
        }
        if let Some(pick) = self.overrides.get(&rec.key) {
            return *pick;
        }
        if let Some(pick) = rec.default_preference {
            return pick;
        }
        self.default_by_type.get(&rec.kind).copied().unwrap_or(1)
    }

    pub fn should_avoid_energy(&self, rec: &EventRecord) -> bool {
        self.avoid_energy_overflow_by_entity
            .get(&Self::entity_key(rec))
            .copied()
            .unwrap_or(self.avoid_energy_overflow)
    }

    pub fn reward_priority_for(&self, rec: &EventRecord) -> Vec<RewardCategory> {
        self.reward_priority_by_entity
            .get(&Self::entity_key(rec))
            .cloned()
            .unwrap_or_else(|| self.reward_priority.clone())
    }
}

#[cfg(test)]
pub(crate) fn record(
    kind: EventEntityKind,
    name: &str,
    event_name: &str,
    step: u8,
    options: Vec<(u8, Vec<OutcomeRecord>)>,
) -> EventRecord {
    let key = match kind {
        EventEntityKind::Support => format!("support/{name}/SPD/SSR/{event_name}"),
        EventEntityKind::Trainee => format!("trainee/{name}/None/None/{event_name}"),
        EventEntityKind::Scenario => format!("scenario/{name}/None/None/{event_name}"),
    };
    EventRecord {
        key_step: format!("{key}#s{step}"),
        key,
        kind,
        name: name.to_string(),
        attribute: if kind == EventEntityKind::Support {
            "SPD".to_string()
        } else {
            String::new()
        },
        rarity: String::new(),
        event_name: event_name.to_string(),
        step,
        options: options.into_iter().collect(),
        default_preference: None,
    }
}

#[cfg(test)]
pub(crate) fn outcome_energy(energy: i32) -> OutcomeRecord {
    OutcomeRecord {
        energy,
        ..OutcomeRecord::default()
    }
}
