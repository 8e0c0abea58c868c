//! Agent loop: one tick = capture -> detect -> classify -> dispatch -> act ->
//! update memories.
//!
//! The loop is cooperatively single-threaded. The only blocking points are
//! Waiter polls, every one of which honors the shared stop flag. Soft
//! failures set skip guards and the loop keeps going; only stalls, hotkey
//! stops and unrecoverable loss loops are fatal.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::events::{EventCatalog, EventPrefs};
use crate::catalog::races::RaceIndex;
use crate::catalog::skills::SkillMatcher;
use crate::config::{Config, GeneralConfig, Preset, Scenario};
use crate::flows::event::EventFlow;
use crate::flows::lobby::LobbyFlow;
use crate::flows::race::{RaceArgs, RaceFlow, RaceOutcome};
use crate::flows::skills::{SkillsFlow, SkillsOutcome};
use crate::memory::{PalMemory, PlannedRaceIndex, SkillMemory};
use crate::perception::{find_best, DetClass, Detection, FrameImage};
use crate::screen::ScreenLabel;
use crate::stop::{Aborted, Stalled};
use crate::style::StyleSchedule;
use crate::training::{
    choose_training_action, evaluate_tiles, scan_training_screen, EvalContext, PolicyInputs,
    TrainingAction,
};
use crate::types::ActionOutcome;
use crate::waiter::{ClickSpec, SeenSpec, Waiter};

use super::scenario::{ScenarioPolicy, ScenarioRegistry};

const FALLBACK_PATIENCE_STAGE_1: u32 = 6;
const MIN_FALLBACK_CONF: f32 = 0.15;
const SINGLE_EVENT_OPTION_THRESHOLD: u32 = 5;
const PLANNED_SKIP_COOLDOWN: u32 = 2;
const SKIP_RELEASE_TICKS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Handled(ScreenLabel),
    Stopped,
    CareerComplete,
}

#[derive(Debug, Default)]
pub struct AgentCounters {
    pub relaxed_classifications: u32,
    pub soft_fails: BTreeMap<&'static str, u32>,
}

impl AgentCounters {
    fn soft_fail(&mut self, reason: &'static str) {
        *self.soft_fails.entry(reason).or_insert(0) += 1;
    }
}

pub struct AgentDeps {
    pub waiter: Waiter,
    pub config: Config,
    pub skill_matcher: SkillMatcher,
    pub race_index: RaceIndex,
    pub event_catalog: EventCatalog,
    pub event_prefs: EventPrefs,
    pub skill_memory: SkillMemory,
    pub pal_memory: PalMemory,
}

pub struct Agent {
    waiter: Waiter,
    general: GeneralConfig,
    preset: Preset,
    preset_id: String,
    policy: Rc<ScenarioPolicy>,
    registry: ScenarioRegistry,

    pub lobby: LobbyFlow,
    pub race: RaceFlow,
    pub skills: SkillsFlow,
    events: EventFlow,
    style_schedule: StyleSchedule,
    race_index: RaceIndex,

    pub skill_memory: SkillMemory,
    pub pal_memory: PalMemory,
    pub planned: PlannedRaceIndex,

    pub counters: AgentCounters,
    pub stall_limit: u32,
    patience: u32,
    relaxed_next: bool,
    skip_release_cooldown: u32,

    // Skills shop gating.
    last_skill_pts_seen: Option<u32>,
    last_skill_buy_succeeded: bool,
    first_race_day: bool,

    // EventStale loop breaker.
    single_event_counter: u32,
    consecutive_event_stale_clicks: u32,
    force_unknown_once: bool,
}

impl Agent {
    pub fn new(deps: AgentDeps) -> anyhow::Result<Self> {
        let (preset_id, preset) = deps.config.active_preset()?;
        let general = deps.config.general.clone();
        let registry = ScenarioRegistry::with_defaults();
        let policy = registry.get(general.scenario);

        let mut race = RaceFlow::new(deps.race_index.clone());
        race.accept_consecutive_race = preset.accept_consecutive_race;
        race.try_again_on_failed_goal = preset.try_again_on_failed_goal;

        let style_schedule = StyleSchedule::new(preset.debut_style, &preset.style_schedule);
        let planned = PlannedRaceIndex::from_preset(&preset.planned_races);
        let lobby = LobbyFlow::new(general.auto_rest_minimum);

        info!(
            "[agent] start scenario={} preset={} skills={} planned_races={}",
            general.scenario.as_str(),
            preset_id,
            preset.skills.len(),
            preset.planned_races.len()
        );

        Ok(Self {
            waiter: deps.waiter,
            general,
            preset,
            preset_id,
            policy,
            registry,
            lobby,
            race,
            skills: SkillsFlow::new(deps.skill_matcher),
            events: EventFlow::new(deps.event_catalog, deps.event_prefs),
            style_schedule,
            race_index: deps.race_index,
            skill_memory: deps.skill_memory,
            pal_memory: deps.pal_memory,
            planned,
            counters: AgentCounters::default(),
            stall_limit: 40,
            patience: 0,
            relaxed_next: false,
            skip_release_cooldown: 0,
            last_skill_pts_seen: None,
            last_skill_buy_succeeded: false,
            first_race_day: true,
            single_event_counter: 0,
            consecutive_event_stale_clicks: 0,
            force_unknown_once: false,
        })
    }

    pub fn registry(&self) -> &ScenarioRegistry {
        &self.registry
    }

    pub fn scenario(&self) -> Scenario {
        self.policy.scenario
    }

    /// One loop iteration. Fatal conditions (stall, abort) surface as errors;
    /// everything else is absorbed into guards and counters.
    pub fn tick(&mut self) -> anyhow::Result<TickOutcome> {
        if self.waiter.stop_flag().is_set() {
            return Ok(TickOutcome::Stopped);
        }

        self.planned.tick();
        if self.skip_release_cooldown > 0 {
            self.skip_release_cooldown -= 1;
            if self.skip_release_cooldown == 0 {
                self.lobby.release_skip_race();
            }
        }

        let (frame, dets) = self.waiter.snap("screen")?;
        let classification = self.policy.classify(&dets, self.relaxed_next);
        if classification.relaxed_hit {
            self.counters.relaxed_classifications += 1;
        }
        let mut label = classification.label;
        if self.force_unknown_once {
            info!("[agent] Forcing Unknown screen behavior to break EventStale loop.");
            label = ScreenLabel::Unknown;
            self.force_unknown_once = false;
            self.consecutive_event_stale_clicks = 0;
        }
        debug!("[classifier] screen={}", label.as_str());

        match label {
            ScreenLabel::Unknown => {
                let outcome = self.handle_unknown(&dets)?;
                debug!("[agent] unknown-screen outcome={:?}", outcome);
            }
            ScreenLabel::EventStale => {
                self.handle_event_stale(&dets)?;
            }
            ScreenLabel::Event => {
                self.patience = 0;
                self.single_event_counter = 0;
                self.consecutive_event_stale_clicks = 0;
                let energy = self.lobby.state.energy.map(|e| e as i32);
                let decision =
                    self.events
                        .process(&mut self.waiter, &frame, &dets, energy, 100)?;
                debug!("[event] decision={:?}", decision);
            }
            ScreenLabel::Training => {
                self.patience = 0;
                self.handle_training()?;
            }
            ScreenLabel::Inspiration => {
                self.patience = 0;
                if let Some(golden) = find_best(&dets, DetClass::ButtonGolden, 0.4) {
                    self.waiter.click_bbox(golden.bbox, 1)?;
                }
            }
            ScreenLabel::KashimotoTeam => {
                self.patience = 0;
                if let Some(golden) = find_best(&dets, DetClass::ButtonGolden, 0.4) {
                    self.waiter.click_bbox(golden.bbox, 1)?;
                    self.waiter.settle(2.0)?;
                    self.begin_showdown()?;
                }
            }
            ScreenLabel::Raceday => {
                self.patience = 0;
                self.handle_raceday(&frame, &dets)?;
            }
            ScreenLabel::UnityCupRaceday => {
                self.handle_unity_raceday(&dets)?;
            }
            ScreenLabel::Lobby | ScreenLabel::LobbySummer => {
                self.patience = 0;
                self.handle_lobby(&frame, &dets)?;
            }
            ScreenLabel::RaceLobby => {
                self.patience = 0;
                // Mid-race lobby reached outside a flow (skipped states or
                // user input racing); drive it to completion.
                let args = RaceArgs {
                    from_raceday: true,
                    reason: "re-entered race lobby".to_string(),
                    ..RaceArgs::default()
                };
                let outcome = self.race.finish(&mut self.waiter, &args)?;
                self.absorb_race_outcome(outcome, None)?;
            }
            ScreenLabel::FinalScreen => {
                self.patience = 0;
                self.handle_final_screen()?;
                return Ok(TickOutcome::CareerComplete);
            }
            ScreenLabel::ClawGame => {
                self.patience = 0;
                let spec = ClickSpec::new(&[DetClass::ButtonClawAction], "claw_play")
                    .timeout(self.waiter.fraction_timeout(0.5));
                if self.waiter.click_when(&spec)?.is_some() {
                    debug!("[agent] claw machine triggered");
                }
                self.waiter.settle(4.0)?;
            }
        }

        // A recognized screen ends the relaxed-classification escalation.
        if !matches!(label, ScreenLabel::Unknown) {
            self.relaxed_next = false;
        }

        Ok(TickOutcome::Handled(label))
    }

    pub fn run(&mut self, delay: Duration, max_iterations: Option<u64>) -> anyhow::Result<()> {
        let mut iterations = 0u64;
        loop {
            match self.tick() {
                Ok(TickOutcome::Stopped) => {
                    info!("[agent] Stop requested; exiting main loop.");
                    break;
                }
                Ok(TickOutcome::CareerComplete) => {
                    info!("[agent] Career complete; exiting main loop.");
                    break;
                }
                Ok(TickOutcome::Handled(_)) => {}
                Err(err) => {
                    self.flush_memories();
                    if err.is::<Aborted>() {
                        info!("[agent] Aborted; exiting main loop.");
                        break;
                    }
                    return Err(err);
                }
            }

            iterations += 1;
            if let Some(max) = max_iterations {
                if iterations >= max {
                    break;
                }
            }
            if self.waiter.sleep(delay).is_err() {
                break;
            }
        }
        self.flush_memories();
        Ok(())
    }

    fn flush_memories(&mut self) {
        if let Err(err) = self.skill_memory.persist() {
            warn!("[skill_memory] final flush failed: {err:#}");
        }
    }

    // ------------------------------------------------------------------
    // Unknown / EventStale
    // ------------------------------------------------------------------

    fn handle_unknown(&mut self, dets: &[Detection]) -> anyhow::Result<ActionOutcome> {
        self.single_event_counter = 0;

        if self.policy.scenario == Scenario::UnityCup
            && self.patience >= FALLBACK_PATIENCE_STAGE_1
            && self.unity_low_conf_fallback(dets)?
        {
            self.relaxed_next = false;
            return Ok(ActionOutcome::Ok);
        }

        let threshold = if self.patience > 20 { 0.55 } else { 0.65 };
        let advance = ClickSpec::new(
            &[
                DetClass::ButtonGreen,
                DetClass::RaceAfterNext,
                DetClass::ButtonWhite,
            ],
            "agent_unknown_advance",
        )
        .texts(&["NEXT", "OK", "CLOSE", "PROCEED", "CANCEL"])
        .no_greedy()
        .forbid(&["complete", "career", "RACE", "try again"])
        .threshold(threshold)
        .timeout(self.waiter.fraction_timeout(0.1));

        if self.waiter.click_when(&advance)?.is_some() {
            self.patience = 0;
            self.relaxed_next = false;
            return Ok(ActionOutcome::Ok);
        }

        self.patience += 1;
        self.relaxed_next = self.patience >= FALLBACK_PATIENCE_STAGE_1;
        if self.patience >= self.stall_limit {
            warn!(
                "[agent] no progress after {} idle ticks; stopping for safety",
                self.patience
            );
            return Err(Stalled {
                ticks: self.patience,
            }
            .into());
        }
        Ok(ActionOutcome::NoMatch)
    }

    /// Low-confidence rescue clicks for the two Unity Cup classes that go
    /// blurry mid-animation. Shares the one patience counter.
    fn unity_low_conf_fallback(&mut self, dets: &[Detection]) -> anyhow::Result<bool> {
        let golden_floor = MIN_FALLBACK_CONF.max(self.policy.thresholds.golden_relaxed);
        if let Some(golden) = find_best(dets, DetClass::ButtonGolden, golden_floor) {
            info!(
                "[agent] fallback button_golden handled (conf={:.2}, patience={})",
                golden.conf, self.patience
            );
            self.waiter.click_bbox(golden.bbox, 1)?;
            self.patience = 0;
            return Ok(true);
        }
        let race_floor = MIN_FALLBACK_CONF.max(self.policy.thresholds.race_day_relaxed);
        if let Some(card) = find_best(dets, DetClass::RaceRaceDay, race_floor) {
            info!(
                "[agent] fallback race_race_day handled (conf={:.2}, patience={})",
                card.conf, self.patience
            );
            self.waiter.click_bbox(card.bbox, 1)?;
            self.patience = 0;
            return Ok(true);
        }
        Ok(false)
    }

    fn handle_event_stale(&mut self, dets: &[Detection]) -> anyhow::Result<()> {
        if self.consecutive_event_stale_clicks == 2 {
            warn!("[event] EventStale loop detected; forcing Unknown handler next tick.");
            self.force_unknown_once = true;
            self.consecutive_event_stale_clicks += 1;
            return Ok(());
        }
        if self.consecutive_event_stale_clicks >= 4 {
            warn!("[event] EventStale loop persists; trying green-button fallback.");
            let spec = ClickSpec::new(&[DetClass::ButtonGreen], "event_stale_fallback")
                .texts(&["NEXT", "OK", "CLOSE", "PROCEED"])
                .prefer_bottom()
                .timeout(self.waiter.fraction_timeout(0.1));
            let _ = self.waiter.click_when(&spec)?;
            self.consecutive_event_stale_clicks = 0;
            self.single_event_counter = 0;
            return Ok(());
        }

        let choices: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::EventChoice && d.conf >= 0.60)
            .collect();
        if choices.len() == 1 {
            self.single_event_counter += 1;
            debug!(
                "[event] EventStale: single option ({}/{}); waiting for the rest to render",
                self.single_event_counter, SINGLE_EVENT_OPTION_THRESHOLD
            );
            if self.single_event_counter >= SINGLE_EVENT_OPTION_THRESHOLD {
                info!("[event] EventStale: clicking the only available option.");
                self.waiter.click_bbox(choices[0].bbox, 1)?;
                self.single_event_counter = 0;
                self.consecutive_event_stale_clicks += 1;
            }
        } else {
            self.single_event_counter = 0;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lobby
    // ------------------------------------------------------------------

    fn refresh_memories_from_state(&mut self) {
        let date_key = self.lobby.state.date_key();
        let date_index = self.lobby.state.date.and_then(|d| d.index());
        if !self
            .skill_memory
            .is_compatible_run(Some(&self.preset_id), date_index)
        {
            info!("[skill_memory] incompatible run detected -> reset");
            self.skill_memory.reset_career();
        }
        self.skill_memory
            .set_run_metadata(Some(&self.preset_id), date_key.as_deref(), date_index);
        self.pal_memory
            .record_availability(self.lobby.state.pal_available);
    }

    fn handle_lobby(&mut self, frame: &FrameImage, dets: &[Detection]) -> anyhow::Result<()> {
        self.lobby.update_state(&mut self.waiter, frame, dets);
        self.refresh_memories_from_state();
        info!(
            "[lobby] goal='{}' energy={:?} skill_pts={} turn={:?} date={:?} mood={:?} infirmary={}",
            self.lobby.state.goal.trim(),
            self.lobby.state.energy,
            self.lobby.state.skill_pts,
            self.lobby.state.turn,
            self.lobby.state.date_key(),
            self.lobby.state.mood,
            self.lobby.state.infirmary_on
        );

        // Critical goal races outrank everything else.
        if self.lobby.race_available() && !self.lobby.raced_today() {
            if let Some(reason) = self.lobby.critical_goal_reason() {
                let force_deadline = self
                    .lobby
                    .state
                    .turn
                    .map(|t| t >= 0 && (t as u32) <= self.preset.goal_race_force_turns)
                    .unwrap_or(false);
                if !force_deadline && self.precheck_allowed() {
                    if let Some(true) = self.peek_training_and_maybe_stay()? {
                        return Ok(());
                    }
                }
                info!("[lobby] critical goal ({reason}) turn={:?}", self.lobby.state.turn);
                let args = RaceArgs {
                    prioritize_g1: reason == "G1",
                    is_g1_goal: reason == "G1",
                    reason: self.lobby.state.goal.clone(),
                    ..RaceArgs::default()
                };
                let outcome = self.race.run(&mut self.waiter, &args)?;
                self.absorb_race_outcome(outcome, None)?;
                return Ok(());
            }

            if let Some((name, tentative)) = self
                .lobby
                .planned_race_today(&self.planned)
                .map(|(n, t)| (n.to_string(), t))
            {
                if tentative && self.precheck_allowed() {
                    if let Some(true) = self.peek_training_and_maybe_stay()? {
                        info!("[lobby] tentative plan deferred for training value");
                        return Ok(());
                    }
                }
                let date_key = self.lobby.state.date_key();
                info!(
                    "[planned_race] attempting desired='{}' key={:?} tentative={}",
                    name, date_key, tentative
                );
                let style = self
                    .lobby
                    .state
                    .date
                    .and_then(|d| self.style_schedule.pending_change(&d));
                let args = RaceArgs {
                    desired_race: Some(name),
                    date_key: date_key.clone(),
                    style,
                    reason: "planned race".to_string(),
                    ..RaceArgs::default()
                };
                let outcome = self.race.run(&mut self.waiter, &args)?;
                if outcome == RaceOutcome::Ok {
                    if let Some(style) = style {
                        self.style_schedule.mark_applied(style);
                    }
                }
                self.absorb_race_outcome(outcome, date_key)?;
                return Ok(());
            }
        }

        if self.lobby.state.infirmary_on {
            self.lobby.go_infirmary(&mut self.waiter)?;
            return Ok(());
        }

        let min_mood = self
            .preset
            .junior_minimum_mood
            .filter(|_| {
                self.lobby
                    .state
                    .date
                    .map(|d| d.year_code <= 1)
                    .unwrap_or(false)
            })
            .unwrap_or(self.preset.minimum_mood);
        if let Some(mood) = self.lobby.state.mood {
            if mood < min_mood {
                self.lobby.go_recreate(
                    &mut self.waiter,
                    &mut self.pal_memory,
                    "Mood is low, recreating",
                )?;
                return Ok(());
            }
        }

        if let Some(energy) = self.lobby.state.energy {
            if energy <= self.lobby.auto_rest_minimum {
                if self.pal_memory.icon_present() && self.pal_memory.any_next_energy() {
                    self.lobby.go_recreate(
                        &mut self.waiter,
                        &mut self.pal_memory,
                        "Low energy, PAL date restores it",
                    )?;
                } else {
                    self.lobby.go_rest(&mut self.waiter, "Low energy, resting")?;
                }
                return Ok(());
            }
        }

        self.lobby
            .go_training(&mut self.waiter, "No critical actions")?;
        Ok(())
    }

    fn precheck_allowed(&self) -> bool {
        if !self.preset.lobby_precheck_enable {
            return false;
        }
        let Some(energy) = self.lobby.state.energy else {
            return false;
        };
        if energy <= self.lobby.auto_rest_minimum {
            return false;
        }
        if energy <= 30
            && self
                .lobby
                .state
                .date
                .map(|d| d.summer_within_turns(2))
                .unwrap_or(false)
        {
            return false;
        }
        true
    }

    /// Enter the training screen and score it. When the best tile clears the
    /// pre-check threshold it is clicked directly and we stay; otherwise
    /// back out to the Lobby. Returns Some(stayed).
    fn peek_training_and_maybe_stay(&mut self) -> anyhow::Result<Option<bool>> {
        if !self
            .lobby
            .go_training(&mut self.waiter, "PRECHECK")?
        {
            return Ok(None);
        }
        let tiles = scan_training_screen(&mut self.waiter)?;
        if tiles.is_empty() {
            self.lobby.go_back(&mut self.waiter)?;
            return Ok(None);
        }
        let ctx = EvalContext {
            scenario: self.policy.scenario,
            preset: &self.preset,
            skill_memory: &self.skill_memory,
            date: self.lobby.state.date,
            stats: &self.lobby.state.stats,
        };
        let scores = evaluate_tiles(&tiles, &ctx);
        let best = scores.iter().find(|s| s.allowed);
        if let Some(best) = best {
            if best.sv >= self.preset.race_precheck_sv {
                if let Some(tile) = tiles.iter().find(|t| t.tile_idx == best.tile_idx) {
                    info!(
                        "[lobby] Pre-check clicked tile_idx={} sv={:.2}",
                        best.tile_idx, best.sv
                    );
                    self.waiter.click_bbox(tile.bbox, 3)?;
                    return Ok(Some(true));
                }
            }
            info!(
                "[lobby] Pre-check SV too low={:.2} (threshold {:.2}), going back",
                best.sv, self.preset.race_precheck_sv
            );
        }
        self.lobby.go_back(&mut self.waiter)?;
        Ok(Some(false))
    }

    // ------------------------------------------------------------------
    // Training
    // ------------------------------------------------------------------

    fn handle_training(&mut self) -> anyhow::Result<()> {
        let tiles = scan_training_screen(&mut self.waiter)?;
        if tiles.is_empty() {
            // Mid-transition frame; back out and let the next tick reclassify.
            self.lobby.go_back(&mut self.waiter)?;
            return Ok(());
        }
        let ctx = EvalContext {
            scenario: self.policy.scenario,
            preset: &self.preset,
            skill_memory: &self.skill_memory,
            date: self.lobby.state.date,
            stats: &self.lobby.state.stats,
        };
        let scores = evaluate_tiles(&tiles, &ctx);

        let planned_today = self.lobby.planned_race_today(&self.planned);
        let inputs = PolicyInputs {
            scenario: self.policy.scenario,
            scores: &scores,
            energy: self.lobby.state.energy,
            mood: self.lobby.state.mood,
            date: self.lobby.state.date,
            infirmary_on: self.lobby.state.infirmary_on,
            pal_available: self.pal_memory.icon_present(),
            pal_next_energy: self.pal_memory.any_next_energy(),
            planned_race_today: planned_today.is_some(),
            planned_tentative: planned_today.map(|(_, t)| t).unwrap_or(false),
            race_available: self.lobby.race_available() && !self.lobby.raced_today(),
            auto_rest_minimum: self.lobby.auto_rest_minimum,
        };
        let action = choose_training_action(&inputs, &self.preset);
        debug!("[training] action={:?}", action);

        match action {
            TrainingAction::Train(tile_idx) => {
                if let Some(tile) = tiles.iter().find(|t| t.tile_idx == tile_idx) {
                    self.waiter.click_bbox(tile.bbox, 3)?;
                    self.waiter.settle(4.0)?;
                } else {
                    warn!("[training] chosen tile {} not found in scan", tile_idx);
                }
            }
            TrainingAction::Race => {
                self.lobby.go_back(&mut self.waiter)?;
                let args = RaceArgs {
                    reason: "training policy -> race".to_string(),
                    ..RaceArgs::default()
                };
                let outcome = self.race.run(&mut self.waiter, &args)?;
                self.absorb_race_outcome(outcome, None)?;
            }
            TrainingAction::Rest => {
                self.lobby.go_back(&mut self.waiter)?;
                self.lobby.go_rest(&mut self.waiter, "Resting...")?;
            }
            TrainingAction::Recreate | TrainingAction::RecreatePal => {
                self.lobby.go_back(&mut self.waiter)?;
                self.lobby.go_recreate(
                    &mut self.waiter,
                    &mut self.pal_memory,
                    "Recreating...",
                )?;
            }
            TrainingAction::Infirmary => {
                self.lobby.go_back(&mut self.waiter)?;
                self.lobby.go_infirmary(&mut self.waiter)?;
            }
            TrainingAction::Skills => {
                self.lobby.go_back(&mut self.waiter)?;
                if self.lobby.go_skills(&mut self.waiter)? {
                    let date_key = self.lobby.state.date_key();
                    let report = self.skills.buy(
                        &mut self.waiter,
                        &mut self.skill_memory,
                        &self.preset.skills,
                        date_key.as_deref(),
                    )?;
                    info!("[agent] secure-skills pass: {:?}", report.outcome);
                }
            }
            TrainingAction::NoOp => {
                debug!("[training] no actionable decision");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raceday
    // ------------------------------------------------------------------

    fn handle_raceday(&mut self, frame: &FrameImage, dets: &[Detection]) -> anyhow::Result<()> {
        self.lobby.update_state(&mut self.waiter, frame, dets);
        self.refresh_memories_from_state();

        if let Some(pts) = find_best(dets, DetClass::UiSkillPts, 0.3) {
            let text = self.waiter.ocr_text(frame, pts.bbox);
            if let Some(v) = text
                .split_whitespace()
                .filter_map(|t| t.parse::<u32>().ok())
                .next()
            {
                self.lobby.state.skill_pts = v;
            }
        }
        info!(
            "[agent] Skill Pts: {}. Stats: {:?}",
            self.lobby.state.skill_pts, self.lobby.state.stats
        );

        let mut proceed_to_race = true;
        if !self.preset.skills.is_empty()
            && self.lobby.state.skill_pts >= self.preset.minimum_skill_pts
        {
            let pts = self.lobby.state.skill_pts;
            let turn = self.lobby.state.turn.unwrap_or(-1);
            let interval = self.general.skill_check_interval.max(1);
            let turn_gate = interval <= 1 || (turn >= 0 && (turn as u32) % interval == 0);
            let delta_gate = self
                .last_skill_pts_seen
                .map(|last| pts.saturating_sub(last) >= self.general.skill_pts_delta)
                .unwrap_or(true);
            let should_open =
                turn_gate || delta_gate || self.last_skill_buy_succeeded || self.first_race_day;
            debug!(
                "[skills] check interval={} turn={} turn_gate={} delta_gate={} last_ok={}",
                interval, turn, turn_gate, delta_gate, self.last_skill_buy_succeeded
            );
            if should_open {
                self.first_race_day = false;
                self.lobby.go_skills(&mut self.waiter)?;
                let date_key = self.lobby.state.date_key();
                let report = self.skills.buy(
                    &mut self.waiter,
                    &mut self.skill_memory,
                    &self.preset.skills,
                    date_key.as_deref(),
                )?;
                info!("[agent] Skills result: {:?}", report.outcome);
                self.last_skill_buy_succeeded = report.succeeded();
                self.last_skill_pts_seen = Some(pts);
                match &report.outcome {
                    SkillsOutcome::FailedExit(reason) => {
                        self.counters.soft_fail("skills_failed_exit");
                        warn!("[skills] failed exit ({reason}); racing only if screen recovered");
                        proceed_to_race = report.exit_recovered;
                    }
                    _ => {}
                }
            } else {
                self.last_skill_pts_seen = Some(pts);
            }
        }

        if !proceed_to_race {
            return Ok(());
        }

        // Debut day races with the configured junior style.
        let pre_debut = self
            .lobby
            .state
            .date
            .map(|d| d.is_pre_debut())
            .unwrap_or(false)
            || self
                .lobby
                .state
                .date_raw
                .as_deref()
                .map(|r| r.to_lowercase().replace('-', "").contains("predebut"))
                .unwrap_or(false);
        let style = if pre_debut {
            self.style_schedule.debut_style()
        } else {
            self.lobby
                .state
                .date
                .and_then(|d| self.style_schedule.pending_change(&d))
        };

        let args = RaceArgs {
            style,
            from_raceday: true,
            reason: if pre_debut {
                "Pre-debut (race day)".to_string()
            } else {
                "Normal (race day)".to_string()
            },
            ..RaceArgs::default()
        };
        let outcome = self.race.run(&mut self.waiter, &args)?;
        if outcome == RaceOutcome::Ok {
            if let Some(style) = style {
                self.style_schedule.mark_applied(style);
            }
        }
        self.absorb_race_outcome(outcome, None)?;
        Ok(())
    }

    /// Soft-fail policy: back out to Lobby, set skip guards, keep looping.
    fn absorb_race_outcome(
        &mut self,
        outcome: RaceOutcome,
        planned_key: Option<String>,
    ) -> anyhow::Result<()> {
        match outcome {
            RaceOutcome::Ok => {
                self.lobby.mark_raced_today();
                self.skip_release_cooldown = SKIP_RELEASE_TICKS;
                if let Some(key) = planned_key {
                    self.planned.mark_completed(&key);
                }
            }
            RaceOutcome::NoPlannedMatch => {
                self.counters.soft_fail("no_planned_match");
                if let Some(key) = planned_key {
                    self.planned.mark_skipped(&key, PLANNED_SKIP_COOLDOWN);
                }
                self.lobby.set_skip_race_once();
                self.skip_release_cooldown = SKIP_RELEASE_TICKS;
                self.lobby.go_back(&mut self.waiter)?;
            }
            RaceOutcome::ConsecutiveRaceRefused => {
                self.counters.soft_fail("consecutive_race_refused");
                info!("[lobby] Consecutive race refused -> backing out; set skip guard.");
                self.lobby.set_skip_race_once();
                self.skip_release_cooldown = SKIP_RELEASE_TICKS;
                self.lobby.go_back(&mut self.waiter)?;
            }
            RaceOutcome::NoRaceFound | RaceOutcome::ButtonsMissing => {
                self.counters.soft_fail(if outcome == RaceOutcome::NoRaceFound {
                    "no_race_found"
                } else {
                    "buttons_missing"
                });
                self.lobby.set_skip_race_once();
                self.skip_release_cooldown = SKIP_RELEASE_TICKS;
                self.lobby.go_back(&mut self.waiter)?;
            }
            RaceOutcome::LossLoop => {
                self.counters.soft_fail("loss_loop");
                warn!("[race] loss loop; backing out to Lobby");
                self.lobby.set_skip_race_once();
                self.skip_release_cooldown = SKIP_RELEASE_TICKS;
                self.lobby.go_back(&mut self.waiter)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unity Cup extras
    // ------------------------------------------------------------------

    fn handle_unity_raceday(&mut self, dets: &[Detection]) -> anyhow::Result<()> {
        let card = ClickSpec::new(&[DetClass::RaceRaceDay], "unity_cup_race_day_button")
            .timeout(self.waiter.fraction_timeout(0.5));
        let mut clicked = self.waiter.click_when(&card)?.is_some();
        if !clicked && self.patience >= FALLBACK_PATIENCE_STAGE_1 {
            clicked = self.unity_low_conf_fallback(dets)?;
        }
        if !clicked {
            self.patience += 1;
            return Ok(());
        }
        self.patience = 0;
        self.waiter.settle(4.0)?;

        // Opponent banners, preferred slot from the preset per race index.
        let deadline = std::time::Instant::now() + self.waiter.fraction_timeout(3.0);
        loop {
            if self.waiter.seen(&SeenSpec::new(
                &[DetClass::UnityOpponentBanner],
                "unity_cup_wait_banner",
            ))? {
                break;
            }
            if std::time::Instant::now() >= deadline {
                warn!("[agent] opponent banners not detected within timeout");
                return Ok(());
            }
            self.waiter.settle(2.0)?;
        }

        let (_frame, dets) = self.waiter.snap("unity_cup_banners")?;
        let mut banners: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::UnityOpponentBanner)
            .collect();
        if banners.is_empty() {
            warn!("[agent] no opponent banners detected");
            return Ok(());
        }
        banners.sort_by(|a, b| {
            b.conf
                .partial_cmp(&a.conf)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        banners.truncate(3);
        banners.sort_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let stage = self
            .lobby
            .state
            .date
            .and_then(|d| self.race_index.unity_preseason_index(&d));
        let slot = self.preset.unity_cup.opponent_selection.slot_for(stage);
        let idx = (slot as usize - 1).min(banners.len() - 1);
        self.waiter.click_bbox(banners[idx].bbox, 1)?;
        info!(
            "[agent] clicked opponent banner stage={:?} slot={}",
            stage,
            idx + 1
        );

        let select = ClickSpec::new(&[DetClass::ButtonGreen], "unity_cup_select")
            .texts(&["SELECT", "OPPONENT"])
            .no_greedy()
            .timeout(self.waiter.fraction_timeout(0.8));
        if self.waiter.click_when(&select)?.is_some() {
            self.waiter.settle(3.0)?;
            self.begin_showdown()?;
        } else {
            warn!("[agent] opponent select button not found");
        }
        Ok(())
    }

    fn begin_showdown(&mut self) -> anyhow::Result<()> {
        let begin = ClickSpec::new(&[DetClass::ButtonGreen], "unity_cup_click_showdown")
            .texts(&["BEGIN", "SHOWDOWN"])
            .no_greedy()
            .timeout(self.waiter.fraction_timeout(0.8));
        if self.waiter.click_when(&begin)?.is_none() {
            return Ok(());
        }
        info!("[agent] begin showdown");
        self.waiter.settle(8.0)?;

        // The after-race button goes active when the result can be fast-run;
        // otherwise fall back to watching the main race.
        let deadline = std::time::Instant::now() + self.waiter.fraction_timeout(2.5);
        let mut after: Option<Detection> = None;
        loop {
            let (_frame, dets) = self.waiter.snap("unity_cup_after_probe")?;
            if let Some(d) = find_best(&dets, DetClass::RaceAfterNext, 0.0) {
                after = Some(d.clone());
                break;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            self.waiter.settle(2.0)?;
        }
        let Some(after) = after else {
            debug!("[agent] no after-race button found");
            return Ok(());
        };

        if after.conf >= 0.51 {
            self.waiter.click_bbox(after.bbox, 1)?;
            self.waiter.settle(4.0)?;
            let skip = ClickSpec::new(&[DetClass::ButtonSkip], "unity_cup_skip")
                .prefer_bottom()
                .clicks(3)
                .timeout(self.waiter.fraction_timeout(0.5));
            let _ = self.waiter.click_when(&skip)?;
            let next = ClickSpec::new(&[DetClass::ButtonGreen], "unity_cup_next")
                .texts(&["NEXT"])
                .timeout(self.waiter.fraction_timeout(0.5));
            let _ = self.waiter.click_when(&next)?;
            let after_next = ClickSpec::new(&[DetClass::RaceAfterNext], "unity_cup_race_after_next")
                .timeout(self.waiter.fraction_timeout(0.5));
            let _ = self.waiter.click_when(&after_next)?;
        } else {
            // Watch the main race instead.
            let pink = ClickSpec::new(&[DetClass::ButtonPink], "unity_cup_watch_main")
                .timeout(self.waiter.fraction_timeout(0.3));
            if self.waiter.click_when(&pink)?.is_some() {
                debug!("[agent] watching main race (after-race button disabled)");
                self.waiter.settle(8.0)?;
                let race = ClickSpec::new(&[DetClass::ButtonGreen], "unity_cup_main_race")
                    .texts(&["RACE", "NEXT"])
                    .prefer_bottom()
                    .timeout(self.waiter.fraction_timeout(1.0));
                let _ = self.waiter.click_when(&race)?;
                let close = ClickSpec::new(&[DetClass::ButtonWhite], "unity_cup_main_close")
                    .texts(&["CLOSE"])
                    .no_greedy()
                    .timeout(self.waiter.fraction_timeout(0.8));
                let _ = self.waiter.click_when(&close)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Career end
    // ------------------------------------------------------------------

    fn handle_final_screen(&mut self) -> anyhow::Result<()> {
        if !self.preset.skills.is_empty() && self.lobby.go_skills(&mut self.waiter)? {
            self.waiter.settle(2.0)?;
            let date_key = self.lobby.state.date_key();
            let report = self.skills.buy(
                &mut self.waiter,
                &mut self.skill_memory,
                &self.preset.skills,
                date_key.as_deref(),
            )?;
            info!("[agent] final skills pass: {:?}", report.outcome);
        }
        info!("[agent] Detected end of career");
        self.skill_memory.reset_career();
        info!("[skill_memory] Reset after career completion");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::skills::SkillCatalog;
    use crate::config::{PlannedRaceEntry, ScenarioConfig};
    use crate::geometry::BBox;
    use crate::stop::StopFlag;
    use crate::testkit::{det_box, FakeBridge, ScriptedFrame};
    use crate::waiter::PollConfig;

    fn fast_cfg() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(0),
            agent: "test".to_string(),
        }
    }

    fn test_config(scenario: Scenario, preset: Preset) -> Config {
        let mut config = Config::default();
        config.general.scenario = scenario;
        let mut sc = ScenarioConfig::default();
        sc.active_preset = "test".to_string();
        sc.presets.insert("test".to_string(), preset);
        config
            .scenarios
            .insert(scenario.as_str().to_string(), sc);
        config
    }

    fn agent_with(bridge: &FakeBridge, config: Config, race_index: RaceIndex) -> Agent {
        let deps = AgentDeps {
            waiter: bridge.waiter(fast_cfg(), StopFlag::new()),
            config,
            skill_matcher: SkillMatcher::new(SkillCatalog::default()),
            race_index,
            event_catalog: EventCatalog::default(),
            event_prefs: EventPrefs::default(),
            skill_memory: SkillMemory::ephemeral("test"),
            pal_memory: PalMemory::ephemeral("test"),
        };
        Agent::new(deps).unwrap()
    }

    fn ui_text_det(class: DetClass, x: f32, y: f32) -> (Detection, BBox) {
        let bbox = BBox::new(x, y, x + 120.0, y + 30.0);
        (det_box(class, bbox, 0.8), bbox)
    }

    /// Raceday screen: coach + race-day card + skills tile + skill points.
    fn raceday_screen(pts: &str) -> ScriptedFrame {
        let (pts_det, pts_box) = ui_text_det(DetClass::UiSkillPts, 900.0, 10.0);
        let (turns_det, turns_box) = ui_text_det(DetClass::UiTurns, 20.0, 80.0);
        let skills = BBox::new(700.0, 640.0, 840.0, 700.0);
        let frame = ScriptedFrame::new(vec![
            det_box(DetClass::LobbyCoach, BBox::new(10.0, 10.0, 60.0, 60.0), 0.9),
            det_box(
                DetClass::RaceRaceDay,
                BBox::new(400.0, 300.0, 700.0, 420.0),
                0.9,
            ),
            det_box(DetClass::LobbySkills, skills, 0.9),
            pts_det,
            turns_det,
        ]);
        frame
            .with_text(pts_box, pts)
            .with_text(turns_box, "12")
            .with_text(
                BBox::new(20.0, turns_box.y1 - 42.0, 140.0, turns_box.y1),
                "Classic Year Early Jun",
            )
    }

    fn skills_screen_without_targets() -> ScriptedFrame {
        let sq = BBox::new(100.0, 100.0, 600.0, 200.0);
        let buy = BBox::new(510.0, 130.0, 590.0, 170.0);
        let back = BBox::new(80.0, 640.0, 220.0, 690.0);
        ScriptedFrame::new(vec![
            det_box(DetClass::SkillsSquare, sq, 0.9),
            det_box(DetClass::SkillsBuy, buy, 0.9),
            det_box(DetClass::ButtonWhite, back, 0.9),
        ])
        .with_text(
            BBox::new(
                sq.x1 + 0.10 * sq.width(),
                sq.y1 + 0.08 * sq.height(),
                sq.x2 - 0.25 * sq.width(),
                sq.y1 + 0.38 * sq.height(),
            ),
            "Groundwork",
        )
        .with_text(back, "BACK")
    }

    fn race_list_screen(badge_label: &str) -> ScriptedFrame {
        let sq = BBox::new(100.0, 120.0, 700.0, 240.0);
        let badge = BBox::new(110.0, 130.0, 160.0, 160.0);
        ScriptedFrame::new(vec![
            det_box(DetClass::RaceSquare, sq, 0.9),
            det_box(DetClass::RaceStar, BBox::new(180.0, 200.0, 200.0, 220.0), 0.9),
            det_box(DetClass::RaceStar, BBox::new(210.0, 200.0, 230.0, 220.0), 0.9),
            det_box(DetClass::RaceBadge, badge, 0.9),
        ])
        .with_text(badge, badge_label)
        .with_text(sq, "Spring Sprint Turf 1400")
    }

    fn green_screen(text: &str) -> ScriptedFrame {
        let bbox = BBox::new(700.0, 560.0, 900.0, 620.0);
        ScriptedFrame::new(vec![det_box(DetClass::ButtonGreen, bbox, 0.9)]).with_text(bbox, text)
    }

    fn pre_lobby_screen() -> ScriptedFrame {
        let race = BBox::new(700.0, 560.0, 900.0, 620.0);
        ScriptedFrame::new(vec![
            det_box(DetClass::ButtonChange, BBox::new(50.0, 560.0, 150.0, 620.0), 0.9),
            det_box(DetClass::ButtonGreen, race, 0.9),
        ])
        .with_text(race, "RACE")
    }

    fn skip_screen() -> ScriptedFrame {
        ScriptedFrame::new(vec![det_box(
            DetClass::ButtonSkip,
            BBox::new(1100.0, 30.0, 1200.0, 80.0),
            0.9,
        )])
    }

    fn close_screen() -> ScriptedFrame {
        let close = BBox::new(500.0, 600.0, 650.0, 660.0);
        ScriptedFrame::new(vec![det_box(DetClass::ButtonWhite, close, 0.9)])
            .with_text(close, "CLOSE")
    }

    fn after_next_screen() -> ScriptedFrame {
        ScriptedFrame::new(vec![det_box(
            DetClass::RaceAfterNext,
            BBox::new(1000.0, 620.0, 1180.0, 690.0),
            0.9,
        )])
    }

    #[test]
    fn raceday_skills_no_match_then_race_completes() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        // Screens advance on first input; probes without clicks stay put.
        bridge.push_frame(raceday_screen("770")); // tick snap + go_skills click
        bridge.push_frame(skills_screen_without_targets()); // scan, BACK click
        bridge.push_frame(raceday_screen("770")); // exit verify; race nav click
        bridge.push_frame(race_list_screen("G1")); // squares seen; pick + click
        bridge.push_frame(green_screen("RACE")); // list RACE click
        bridge.push_frame(green_screen("RACE")); // popup confirm click
        bridge.push_frame(pre_lobby_screen()); // gate seen; drive RACE click
        bridge.push_frame(skip_screen()); // skip click
        bridge.push_frame(close_screen()); // CLOSE click
        bridge.push_frame(green_screen("NEXT")); // no loss; NEXT click
        bridge.push_frame(after_next_screen()); // after-race click
        bridge.push_frame(ScriptedFrame::default());

        let mut preset = Preset::default();
        preset.skills = vec!["Concentration ◎".to_string()];
        let mut agent = agent_with(&bridge, test_config(Scenario::Ura, preset), RaceIndex::default());
        agent.skills.max_scrolls = 1;

        let outcome = agent.tick()?;
        assert_eq!(outcome, TickOutcome::Handled(ScreenLabel::Raceday));
        assert!(!agent.skill_memory.has_any_grade("Concentration"));
        assert!(agent.lobby.raced_today());
        assert_eq!(agent.counters.soft_fails.len(), 0);
        Ok(())
    }

    fn lobby_screen(date_text: &str, energy: &str) -> ScriptedFrame {
        let (energy_det, energy_box) = ui_text_det(DetClass::UiEnergy, 500.0, 10.0);
        let (turns_det, turns_box) = ui_text_det(DetClass::UiTurns, 20.0, 80.0);
        let (mood_det, mood_box) = ui_text_det(DetClass::UiMood, 700.0, 10.0);
        ScriptedFrame::new(vec![
            det_box(DetClass::LobbyCoach, BBox::new(10.0, 10.0, 60.0, 60.0), 0.9),
            det_box(
                DetClass::LobbyInfirmary,
                BBox::new(100.0, 640.0, 200.0, 700.0),
                0.65,
            ),
            det_box(
                DetClass::LobbySkills,
                BBox::new(700.0, 640.0, 840.0, 700.0),
                0.9,
            ),
            det_box(
                DetClass::LobbyTraining,
                BBox::new(250.0, 640.0, 380.0, 700.0),
                0.9,
            ),
            det_box(
                DetClass::LobbyRaces,
                BBox::new(420.0, 640.0, 540.0, 700.0),
                0.9,
            ),
            energy_det,
            turns_det,
            mood_det,
        ])
        .with_text(energy_box, energy)
        .with_text(turns_box, "20")
        .with_text(mood_box, "GOOD")
        .with_text(
            BBox::new(20.0, turns_box.y1 - 42.0, 140.0, turns_box.y1),
            date_text,
        )
    }

    #[test]
    fn planned_race_no_match_sets_skip_guard() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(lobby_screen("Senior Year Late Jun", "80")); // tick; race nav click
        bridge.push_frame(race_list_screen("G1")); // wrong title page
        // After NoPlannedMatch the agent backs out with a BACK click.
        // race_list has no BACK; go_back times out against this screen.
        bridge.push_frame(race_list_screen("G1"));

        let mut preset = Preset::default();
        preset.planned_races.insert(
            "Y3-06-2".to_string(),
            PlannedRaceEntry {
                name: "Takarazuka Crown".to_string(),
                tentative: false,
            },
        );
        let mut agent = agent_with(&bridge, test_config(Scenario::Ura, preset), RaceIndex::default());
        agent.race.max_scrolls = 0;

        let outcome = agent.tick()?;
        assert_eq!(outcome, TickOutcome::Handled(ScreenLabel::Lobby));
        // Skip guard live: the plan is hidden for the cooldown window.
        assert_eq!(agent.planned.race_for("Y3-06-2"), None);
        assert_eq!(agent.counters.soft_fails.get("no_planned_match"), Some(&1));
        assert!(!agent.lobby.race_available());

        // Cooldown elapses after two ticks of the planned index.
        agent.planned.tick();
        agent.planned.tick();
        assert_eq!(
            agent.planned.race_for("Y3-06-2"),
            Some(("Takarazuka Crown", false))
        );
        Ok(())
    }

    fn training_screen_strong() -> ScriptedFrame {
        let mut dets = Vec::new();
        for i in 0..5 {
            dets.push(det_box(
                DetClass::TrainingButton,
                BBox::new(50.0 + 200.0 * i as f32, 500.0, 200.0 + 200.0 * i as f32, 600.0),
                0.8,
            ));
        }
        // SPD column: two blue supports and a rainbow -> strong tile.
        dets.push(det_box(DetClass::SupportBlue, BBox::new(60.0, 100.0, 140.0, 180.0), 0.9));
        dets.push(det_box(DetClass::SupportBlue, BBox::new(60.0, 200.0, 140.0, 280.0), 0.9));
        dets.push(det_box(DetClass::SupportGreen, BBox::new(60.0, 300.0, 140.0, 380.0), 0.9));
        ScriptedFrame::new(dets)
    }

    #[test]
    fn tentative_plan_preempted_by_training_and_preserved() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(training_screen_strong());
        bridge.push_frame(ScriptedFrame::default());

        let mut preset = Preset::default();
        preset.race_precheck_sv = 2.5;
        preset.planned_races.insert(
            "Y3-06-2".to_string(),
            PlannedRaceEntry {
                name: "Summer Crown".to_string(),
                tentative: true,
            },
        );
        let mut agent = agent_with(&bridge, test_config(Scenario::Ura, preset), RaceIndex::default());
        agent.lobby.state.date = Some(crate::date::CareerDate::new(3, 6, 2));
        agent.lobby.state.energy = Some(80);

        let outcome = agent.tick()?;
        assert_eq!(outcome, TickOutcome::Handled(ScreenLabel::Training));
        // The strong SPD tile was clicked (three taps land inside it).
        assert!(bridge.clicked_inside(BBox::new(50.0, 500.0, 200.0, 600.0)));
        // The tentative entry is preserved for a later tick.
        assert_eq!(
            agent.planned.race_for("Y3-06-2"),
            Some(("Summer Crown", true))
        );
        Ok(())
    }

    #[test]
    fn unknown_screens_escalate_to_stall() {
        let bridge = FakeBridge::new();
        bridge.push_frame(ScriptedFrame::default());

        let preset = Preset::default();
        let mut agent = agent_with(&bridge, test_config(Scenario::Ura, preset), RaceIndex::default());
        agent.stall_limit = 3;

        assert!(matches!(agent.tick(), Ok(TickOutcome::Handled(ScreenLabel::Unknown))));
        assert!(matches!(agent.tick(), Ok(TickOutcome::Handled(ScreenLabel::Unknown))));
        let err = agent.tick().unwrap_err();
        assert!(err.is::<Stalled>());
    }

    #[test]
    fn event_stale_waits_then_clicks_single_option() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let choice = BBox::new(200.0, 200.0, 600.0, 260.0);
        for _ in 0..SINGLE_EVENT_OPTION_THRESHOLD {
            bridge.push_frame(ScriptedFrame::new(vec![det_box(
                DetClass::EventChoice,
                choice,
                0.9,
            )]));
        }

        let preset = Preset::default();
        let mut agent = agent_with(&bridge, test_config(Scenario::Ura, preset), RaceIndex::default());

        for i in 0..SINGLE_EVENT_OPTION_THRESHOLD {
            let out = agent.tick()?;
            assert_eq!(out, TickOutcome::Handled(ScreenLabel::EventStale), "tick {i}");
        }
        assert!(bridge.clicked_inside(choice));
        Ok(())
    }

    #[test]
    fn relaxed_mode_engages_after_patience() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        // A golden button below the primary threshold but above the relaxed
        // one; nothing else on screen.
        let golden = BBox::new(500.0, 300.0, 700.0, 400.0);
        bridge.push_frame(ScriptedFrame::new(vec![det_box(
            DetClass::ButtonGolden,
            golden,
            0.45,
        )]));

        let preset = Preset::default();
        let mut agent = agent_with(
            &bridge,
            test_config(Scenario::UnityCup, preset),
            RaceIndex::default(),
        );
        agent.stall_limit = 100;

        // Unknown ticks build patience; once relaxed mode engages the screen
        // classifies as Inspiration and the golden button is clicked.
        for _ in 0..FALLBACK_PATIENCE_STAGE_1 {
            let out = agent.tick()?;
            assert_eq!(out, TickOutcome::Handled(ScreenLabel::Unknown));
        }
        let out = agent.tick()?;
        assert!(
            matches!(
                out,
                TickOutcome::Handled(ScreenLabel::Inspiration)
                    | TickOutcome::Handled(ScreenLabel::Unknown)
            ),
            "got {out:?}"
        );
        assert!(bridge.clicked_inside(golden));
        assert!(agent.counters.relaxed_classifications > 0 || agent.patience == 0);
        Ok(())
    }
}
