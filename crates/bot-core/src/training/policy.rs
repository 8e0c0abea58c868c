//! Turn decision over the evaluator output: train, race, rest, recreate,
//! infirmary, or open the skills shop.
//!
//! Gate order matters: hard energy safeguards first, then infirmary/mood,
//! then planned-race and value-based choices. PAL recreation substitutes for
//! rest only while the chain still pays energy back.

use tracing::info;

use crate::config::{Preset, Scenario};
use crate::date::CareerDate;
use crate::training::evaluator::TileScore;
use crate::types::Mood;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingAction {
    Train(usize),
    Race,
    Rest,
    Recreate,
    RecreatePal,
    Infirmary,
    /// Late-game safety: spend banked points in the skills shop instead of
    /// squeezing out one more weak training turn.
    Skills,
    NoOp,
}

#[derive(Debug, Clone)]
pub struct PolicyInputs<'a> {
    pub scenario: Scenario,
    pub scores: &'a [TileScore],
    pub energy: Option<u32>,
    pub mood: Option<Mood>,
    pub date: Option<CareerDate>,
    pub infirmary_on: bool,
    pub pal_available: bool,
    pub pal_next_energy: bool,
    pub planned_race_today: bool,
    pub planned_tentative: bool,
    /// False while a skip guard from an earlier failed race attempt is live.
    pub race_available: bool,
    pub auto_rest_minimum: u32,
}

/// Best pick honoring the Unity Cup burst allow-list: a blue-burst tile on a
/// disallowed or capped stat is skipped unless it is the only candidate.
fn best_allowed<'a>(inputs: &'a PolicyInputs<'a>) -> Option<&'a TileScore> {
    let allowed: Vec<&TileScore> = inputs.scores.iter().filter(|s| s.allowed).collect();
    if allowed.is_empty() {
        return None;
    }
    if inputs.scenario == Scenario::UnityCup {
        if let Some(pick) = allowed
            .iter()
            .find(|s| !s.blue_burst || s.burst_allowed)
        {
            return Some(pick);
        }
        // Every candidate is a blocked burst; the top one is still better
        // than nothing.
    }
    allowed.first().copied()
}

fn rest_or_pal(inputs: &PolicyInputs) -> TrainingAction {
    if inputs.pal_available && inputs.pal_next_energy {
        TrainingAction::RecreatePal
    } else {
        TrainingAction::Rest
    }
}

fn minimum_mood(preset: &Preset, date: Option<&CareerDate>) -> Mood {
    if let (Some(junior_min), Some(d)) = (preset.junior_minimum_mood, date) {
        if d.year_code <= 1 {
            return junior_min;
        }
    }
    preset.minimum_mood
}

pub fn choose_training_action(inputs: &PolicyInputs, preset: &Preset) -> TrainingAction {
    let best = best_allowed(inputs);
    let best_sv = best.map(|s| s.sv).unwrap_or(0.0);

    // Absolute safeguards first.
    if let Some(energy) = inputs.energy {
        if energy <= inputs.auto_rest_minimum {
            info!("[lobby] energy {}<=auto-rest minimum, resting", energy);
            return rest_or_pal(inputs);
        }
        let summer_close = inputs
            .date
            .map(|d| d.summer_within_turns(2))
            .unwrap_or(false);
        if summer_close && energy <= 30 {
            info!("[lobby] summer within 2 turns with low energy, resting");
            return rest_or_pal(inputs);
        }
    }

    if inputs.infirmary_on {
        // Lobby precheck can outrank the infirmary for a standout turn.
        if preset.lobby_precheck_enable && best_sv >= preset.race_precheck_sv {
            if let Some(pick) = best {
                info!(
                    "[lobby] precheck sv={:.2} beats infirmary, training tile {}",
                    best_sv, pick.tile_idx
                );
                return TrainingAction::Train(pick.tile_idx);
            }
        }
        return TrainingAction::Infirmary;
    }

    if let Some(mood) = inputs.mood {
        if mood < minimum_mood(preset, inputs.date.as_ref()) {
            if inputs.pal_available && inputs.pal_next_energy {
                return TrainingAction::RecreatePal;
            }
            return TrainingAction::Recreate;
        }
    }

    if inputs.planned_race_today && inputs.race_available {
        if inputs.planned_tentative && best_sv >= preset.race_precheck_sv {
            if let Some(pick) = best {
                info!(
                    "[lobby] tentative plan pre-empted by training sv={:.2}",
                    best_sv
                );
                return TrainingAction::Train(pick.tile_idx);
            }
        }
        return TrainingAction::Race;
    }

    if let Some(pick) = best {
        if pick.sv >= preset.weak_turn_sv {
            return TrainingAction::Train(pick.tile_idx);
        }
    }

    // Weak turn: no tile worth the risk.
    if inputs.date.map(|d| d.is_finals()).unwrap_or(false) {
        info!("[lobby] weak final-season turn (best sv={best_sv:.2}), securing skills");
        return TrainingAction::Skills;
    }
    let pre_debut = inputs.date.map(|d| d.is_pre_debut()).unwrap_or(false);
    let summer = inputs.date.map(|d| d.is_summer()).unwrap_or(false);
    if preset.race_if_no_good_value && inputs.race_available && !pre_debut && !summer {
        info!("[lobby] weak turn (best sv={best_sv:.2}), racing for value");
        return TrainingAction::Race;
    }

    if let Some(pick) = best {
        return TrainingAction::Train(pick.tile_idx);
    }
    rest_or_pal(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StatKey;

    fn score(tile_idx: usize, sv: f32) -> TileScore {
        TileScore {
            tile_idx,
            stat: StatKey::Spd,
            sv,
            failure_pct: 5,
            risk_limit: 20,
            allowed: true,
            greedy_hit: sv >= 2.5,
            blue_burst: false,
            burst_allowed: false,
            notes: Vec::new(),
        }
    }

    fn burst_score(tile_idx: usize, sv: f32, burst_allowed: bool) -> TileScore {
        TileScore {
            blue_burst: true,
            burst_allowed,
            ..score(tile_idx, sv)
        }
    }

    fn base_inputs<'a>(scores: &'a [TileScore]) -> PolicyInputs<'a> {
        PolicyInputs {
            scenario: Scenario::Ura,
            scores,
            energy: Some(60),
            mood: Some(Mood::Good),
            date: Some(CareerDate::new(2, 4, 1)),
            infirmary_on: false,
            pal_available: false,
            pal_next_energy: false,
            planned_race_today: false,
            planned_tentative: false,
            race_available: true,
            auto_rest_minimum: 26,
        }
    }

    #[test]
    fn low_energy_always_rests() {
        let scores = vec![score(0, 5.0)];
        let mut inputs = base_inputs(&scores);
        inputs.energy = Some(20);
        let preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Rest
        );
    }

    #[test]
    fn pal_substitutes_for_rest_when_chain_pays_energy() {
        let scores = vec![];
        let mut inputs = base_inputs(&scores);
        inputs.energy = Some(10);
        inputs.pal_available = true;
        inputs.pal_next_energy = true;
        let preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::RecreatePal
        );

        inputs.pal_next_energy = false;
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Rest
        );
    }

    #[test]
    fn infirmary_unless_precheck_beats_it() {
        let scores = vec![score(2, 3.2)];
        let mut inputs = base_inputs(&scores);
        inputs.infirmary_on = true;

        let mut preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Infirmary
        );

        preset.lobby_precheck_enable = true;
        preset.race_precheck_sv = 3.0;
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Train(2)
        );
    }

    #[test]
    fn low_mood_recreates() {
        let scores = vec![score(0, 2.0)];
        let mut inputs = base_inputs(&scores);
        inputs.mood = Some(Mood::Bad);
        let preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Recreate
        );
    }

    #[test]
    fn junior_minimum_mood_overrides() {
        let scores = vec![score(0, 2.0)];
        let mut inputs = base_inputs(&scores);
        inputs.mood = Some(Mood::Normal);
        inputs.date = Some(CareerDate::new(1, 10, 1));
        let mut preset = Preset::default();
        preset.junior_minimum_mood = Some(Mood::Good);
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Recreate
        );

        // Outside junior the base minimum applies again.
        inputs.date = Some(CareerDate::new(2, 10, 1));
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Train(0)
        );
    }

    #[test]
    fn planned_race_runs_unless_tentative_and_outscored() {
        let scores = vec![score(1, 4.0)];
        let mut inputs = base_inputs(&scores);
        inputs.planned_race_today = true;
        let preset = Preset::default(); // race_precheck_sv 2.5

        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Race
        );

        inputs.planned_tentative = true;
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Train(1)
        );

        // Tentative but the tile is not strong enough: still race.
        let weak_scores = vec![score(1, 1.5)];
        let mut weak_inputs = base_inputs(&weak_scores);
        weak_inputs.planned_race_today = true;
        weak_inputs.planned_tentative = true;
        assert_eq!(
            choose_training_action(&weak_inputs, &preset),
            TrainingAction::Race
        );
    }

    #[test]
    fn weak_final_season_turn_secures_skills() {
        let scores = vec![score(0, 0.4)];
        let mut inputs = base_inputs(&scores);
        inputs.date = Some(CareerDate::finals());
        let preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Skills
        );
    }

    #[test]
    fn weak_turn_races_for_value() {
        let scores = vec![score(0, 0.4)];
        let inputs = base_inputs(&scores);
        let preset = Preset::default(); // weak_turn_sv 1.0
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Race
        );

        // With the race guard up, train the weak tile anyway.
        let mut guarded = base_inputs(&scores);
        guarded.race_available = false;
        assert_eq!(
            choose_training_action(&guarded, &preset),
            TrainingAction::Train(0)
        );
    }

    #[test]
    fn burst_allow_list_prefers_legal_burst_tiles() {
        let scores = vec![burst_score(0, 4.0, false), burst_score(1, 3.0, true)];
        let mut inputs = base_inputs(&scores);
        inputs.scenario = Scenario::UnityCup;
        let preset = Preset::default();
        assert_eq!(
            choose_training_action(&inputs, &preset),
            TrainingAction::Train(1)
        );

        // Only-remaining-candidate exception.
        let only = vec![burst_score(0, 4.0, false)];
        let mut only_inputs = base_inputs(&only);
        only_inputs.scenario = Scenario::UnityCup;
        only_inputs.race_available = false;
        assert_eq!(
            choose_training_action(&only_inputs, &preset),
            TrainingAction::Train(0)
        );
    }
}
