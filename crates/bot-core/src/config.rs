//! Run configuration: general knobs plus per-scenario presets.
//!
//! Loaded once at agent start and refreshed only on explicit reload. The core
//! has no write path into the backing store.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Mood, StatKey, Stats, Style};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown scenario key: {0}")]
    UnknownScenario(String),
    #[error("scenario {0} has no preset named {1}")]
    UnknownPreset(String, String),
    #[error("preset invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Ura,
    UnityCup,
}

impl Scenario {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Ura => "ura",
            Scenario::UnityCup => "unity_cup",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub hotkey: String,
    pub debug: bool,
    pub auto_rest_minimum: u32,
    pub undertrain_threshold: f32,
    pub top_stats_focus: usize,
    pub skill_check_interval: u32,
    pub skill_pts_delta: u32,
    pub scenario: Scenario,
    pub controller: String,
    pub scenario_confirmed: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            hotkey: "F2".to_string(),
            debug: false,
            auto_rest_minimum: 26,
            undertrain_threshold: 6.0,
            top_stats_focus: 3,
            skill_check_interval: 3,
            skill_pts_delta: 120,
            scenario: Scenario::Ura,
            controller: "desktop".to_string(),
            scenario_confirmed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StyleScheduleEntry {
    pub year_code: u8,
    pub month: u8,
    pub half: u8,
    pub style: Style,
}

impl Default for StyleScheduleEntry {
    fn default() -> Self {
        Self {
            year_code: 1,
            month: 1,
            half: 1,
            style: Style::Pace,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlannedRaceEntry {
    pub name: String,
    #[serde(default)]
    pub tentative: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UnityCupScores {
    pub rainbow_combo: f32,
    pub white_spirit_fill: f32,
    pub white_spirit_exploded: f32,
    pub white_combo_base: f32,
    pub white_combo_per_fill: f32,
    pub white_combo_exploded_tiny: f32,
    pub blue_spirit_each: f32,
    pub blue_combo_per_extra_fill: f32,
}

impl Default for UnityCupScores {
    fn default() -> Self {
        Self {
            rainbow_combo: 0.5,
            white_spirit_fill: 0.4,
            white_spirit_exploded: 0.13,
            white_combo_base: 0.2,
            white_combo_per_fill: 0.25,
            white_combo_exploded_tiny: 0.01,
            blue_spirit_each: 0.5,
            blue_combo_per_extra_fill: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PhaseMultipliers {
    pub white: f32,
    pub white_combo: f32,
    pub blue_combo: f32,
}

impl Default for PhaseMultipliers {
    fn default() -> Self {
        Self {
            white: 1.0,
            white_combo: 1.0,
            blue_combo: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SeasonalMultipliers {
    pub junior_classic: PhaseMultipliers,
    pub senior: PhaseMultipliers,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BurstDeadline {
    /// Halves before Senior early November that open the deadline boost.
    pub pre_senior_nov_early_turns: u32,
    /// Final-season window where remaining spirits must explode.
    pub final_season_explode_last_turns: u32,
}

impl Default for BurstDeadline {
    fn default() -> Self {
        Self {
            pre_senior_nov_early_turns: 4,
            final_season_explode_last_turns: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OpponentSelection {
    pub race1: u8,
    pub race2: u8,
    pub race3: u8,
    pub race4: u8,
    pub default_unknown: u8,
}

impl Default for OpponentSelection {
    fn default() -> Self {
        Self {
            race1: 2,
            race2: 1,
            race3: 1,
            race4: 1,
            default_unknown: 1,
        }
    }
}

impl OpponentSelection {
    /// Preferred banner slot (1..=3) for the given pre-season race index.
    pub fn slot_for(&self, race_index: Option<u8>) -> u8 {
        let slot = match race_index {
            Some(1) => self.race1,
            Some(2) => self.race2,
            Some(3) => self.race3,
            Some(4) => self.race4,
            _ => self.default_unknown,
        };
        slot.clamp(1, 3)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UnityCupAdvanced {
    pub burst_allowed_stats: Vec<StatKey>,
    pub scores: UnityCupScores,
    pub multipliers: SeasonalMultipliers,
    pub burst_deadline: BurstDeadline,
    pub opponent_selection: OpponentSelection,
}

impl UnityCupAdvanced {
    pub fn burst_allows(&self, stat: StatKey) -> bool {
        self.burst_allowed_stats.is_empty() || self.burst_allowed_stats.contains(&stat)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Preset {
    pub priority_stats: Vec<StatKey>,
    pub target_stats: Stats,
    pub minimum_mood: Mood,
    pub junior_minimum_mood: Option<Mood>,
    pub debut_style: Option<Style>,
    pub style_schedule: Vec<StyleScheduleEntry>,
    pub skills: Vec<String>,
    pub planned_races: BTreeMap<String, PlannedRaceEntry>,
    pub race_if_no_good_value: bool,
    pub weak_turn_sv: f32,
    pub race_precheck_sv: f32,
    pub lobby_precheck_enable: bool,
    pub goal_race_force_turns: u32,
    pub max_failure: u8,
    pub hint_is_important: bool,
    pub accept_consecutive_race: bool,
    pub try_again_on_failed_goal: bool,
    pub minimum_skill_pts: u32,
    pub unity_cup: UnityCupAdvanced,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            priority_stats: vec![StatKey::Spd, StatKey::Sta, StatKey::Pwr],
            target_stats: Stats::new(),
            minimum_mood: Mood::Normal,
            junior_minimum_mood: None,
            debut_style: None,
            style_schedule: Vec::new(),
            skills: Vec::new(),
            planned_races: BTreeMap::new(),
            race_if_no_good_value: true,
            weak_turn_sv: 1.0,
            race_precheck_sv: 2.5,
            lobby_precheck_enable: false,
            goal_race_force_turns: 5,
            max_failure: 20,
            hint_is_important: false,
            accept_consecutive_race: true,
            try_again_on_failed_goal: true,
            minimum_skill_pts: 700,
            unity_cup: UnityCupAdvanced::default(),
        }
    }
}

impl Preset {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failure > 100 {
            return Err(ConfigError::Invalid(format!(
                "max_failure {} out of range",
                self.max_failure
            )));
        }
        for (key, entry) in &self.planned_races {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "planned race for {key} has an empty name"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ScenarioConfig {
    #[serde(default)]
    pub active_preset: String,
    #[serde(default)]
    pub presets: BTreeMap<String, Preset>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,
}

impl Config {
    /// Resolve the active scenario's active preset, with its id.
    pub fn active_preset(&self) -> Result<(String, Preset), ConfigError> {
        let key = self.general.scenario.as_str();
        let scenario = self
            .scenarios
            .get(key)
            .ok_or_else(|| ConfigError::UnknownScenario(key.to_string()))?;
        let id = if scenario.active_preset.is_empty() {
            scenario
                .presets
                .keys()
                .next()
                .cloned()
                .ok_or_else(|| ConfigError::UnknownPreset(key.to_string(), "<any>".into()))?
        } else {
            scenario.active_preset.clone()
        };
        let preset = scenario
            .presets
            .get(&id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPreset(key.to_string(), id.clone()))?;
        preset.validate()?;
        Ok((id, preset))
    }
}

/// Minimal config loader.
///
/// Search order:
/// 1) `STRIDE_BOT_CONFIG_DIR/<relative_path>`
/// 2) `./<relative_path>`
/// 3) `<crate_root>/../../config/<relative_path>` (repo-local convenience)
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn parse_from_file<T: DeserializeOwned>(relative_path: &str) -> anyhow::Result<T> {
        let path = Self::resolve_path(relative_path)?;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse_from_string(&text)
    }

    pub fn parse_from_string<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
        toml::from_str(text).context("Failed to parse TOML")
    }

    fn resolve_path(relative_path: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(relative_path);

        if let Some(root) = env::var_os("STRIDE_BOT_CONFIG_DIR") {
            let candidate = PathBuf::from(root).join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        if let Ok(cwd) = env::current_dir() {
            let candidate = cwd.join(rel);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        let candidate = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .ancestors()
            .nth(2)
            .ok_or_else(|| anyhow::anyhow!("CARGO_MANIFEST_DIR has insufficient ancestors"))?
            .join("config")
            .join(rel);
        if candidate.is_file() {
            return Ok(candidate);
        }

        anyhow::bail!("Config file not found for {:?}", rel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
scenario = "unity_cup"
auto_rest_minimum = 30

[scenarios.unity_cup]
active_preset = "main"

[scenarios.unity_cup.presets.main]
skills = ["Concentration", "Swinging Maestro"]
minimum_mood = "normal"
race_precheck_sv = 3.0
lobby_precheck_enable = true

[scenarios.unity_cup.presets.main.target_stats]
SPD = 1100
WIT = 600

[scenarios.unity_cup.presets.main.planned_races."Y3-06-2"]
name = "Summer Crown"
tentative = true

[scenarios.unity_cup.presets.main.unity_cup]
burst_allowed_stats = ["SPD", "PWR"]

[scenarios.unity_cup.presets.main.unity_cup.opponent_selection]
race1 = 3
"#;

    #[test]
    fn parses_sample_and_resolves_active_preset() {
        let cfg: Config = ConfigLoader::parse_from_string(SAMPLE).unwrap();
        assert_eq!(cfg.general.scenario, Scenario::UnityCup);
        assert_eq!(cfg.general.auto_rest_minimum, 30);

        let (id, preset) = cfg.active_preset().unwrap();
        assert_eq!(id, "main");
        assert_eq!(preset.skills.len(), 2);
        assert!(preset.lobby_precheck_enable);
        assert_eq!(preset.target_stats.get(&StatKey::Spd), Some(&1100));

        let planned = preset.planned_races.get("Y3-06-2").unwrap();
        assert_eq!(planned.name, "Summer Crown");
        assert!(planned.tentative);

        assert!(preset.unity_cup.burst_allows(StatKey::Spd));
        assert!(!preset.unity_cup.burst_allows(StatKey::Guts));
        assert_eq!(preset.unity_cup.opponent_selection.slot_for(Some(1)), 3);
        assert_eq!(preset.unity_cup.opponent_selection.slot_for(None), 1);
    }

    #[test]
    fn defaults_cover_missing_sections() {
        let cfg: Config = ConfigLoader::parse_from_string("[general]\nscenario = \"ura\"").unwrap();
        assert!(cfg.active_preset().is_err());
        assert_eq!(cfg.general.skill_check_interval, 3);

        let preset = Preset::default();
        assert_eq!(preset.max_failure, 20);
        assert!(preset.accept_consecutive_race);
        assert!(preset.unity_cup.burst_allows(StatKey::Wit));
    }
}
