//! Lobby state tracking and the per-turn decision driver.
//!
//! The lobby is where the noisy OCR lands: career date, stats, energy, mood,
//! the goal line. Updates are guarded so one bad frame cannot drag the state
//! backwards, and the accepted date sequence stays monotonic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info};

use crate::date::{date_cmp, parse_career_date, CareerDate};
use crate::geometry::BBox;
use crate::memory::{PalMemory, PlannedRaceIndex};
use crate::perception::{find_best, DetClass, Detection, FrameImage};
use crate::text::{fuzzy_contains, normalize_ocr};
use crate::types::{Mood, StatKey, Stats};
use crate::waiter::{ClickSpec, Waiter};

const DATE_WARMUP_FRAMES: u32 = 2;
const DATE_PERSIST_FRAMES: u32 = 2;
const DATE_MAX_JUMP_HALVES: u32 = 6;

const STAT_MIN: u32 = 0;
const STAT_MAX: u32 = 1200;
const STAT_MAX_UP_STEP: u32 = 150;
const STAT_MAX_DOWN_STEP: u32 = 60;
const STAT_PERSIST_FRAMES: u32 = 2;

/// Detection confidence treated as "button is lit" for the infirmary icon.
const INFIRMARY_ACTIVE_CONF: f32 = 0.80;
const PAL_ICON_CONF: f32 = 0.60;

#[derive(Debug, Default)]
pub struct LobbyState {
    pub goal: String,
    pub energy: Option<u32>,
    pub skill_pts: u32,
    pub mood: Option<Mood>,
    pub turn: Option<i32>,
    pub date: Option<CareerDate>,
    pub date_raw: Option<String>,
    pub stats: Stats,
    pub infirmary_on: bool,
    pub pal_available: bool,
}

impl LobbyState {
    pub fn date_key(&self) -> Option<String> {
        self.date.as_ref().map(|d| d.key())
    }
}

#[derive(Debug)]
pub struct LobbyFlow {
    pub state: LobbyState,
    pub auto_rest_minimum: u32,
    pub max_critical_turn: i32,

    // One-shot race guard after a failed or refused race attempt.
    skip_race_once: bool,
    raced_keys: BTreeSet<String>,

    // Date acceptance guards.
    date_stable: u32,
    date_artificial: bool,
    pending_jump: Option<CareerDate>,
    pending_back: Option<CareerDate>,
    pending_back_count: u32,
    last_turn_at_date_update: Option<i32>,

    // Stat acceptance guards.
    stat_pending_up: HashMap<StatKey, (u32, u32)>,
    stat_pending_down: HashMap<StatKey, (u32, u32)>,
}

impl LobbyFlow {
    pub fn new(auto_rest_minimum: u32) -> Self {
        Self {
            state: LobbyState::default(),
            auto_rest_minimum,
            max_critical_turn: 8,
            skip_race_once: false,
            raced_keys: BTreeSet::new(),
            date_stable: 0,
            date_artificial: false,
            pending_jump: None,
            pending_back: None,
            pending_back_count: 0,
            last_turn_at_date_update: None,
            stat_pending_up: HashMap::new(),
            stat_pending_down: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Race guards
    // ------------------------------------------------------------------

    pub fn race_available(&self) -> bool {
        !self.skip_race_once
    }

    pub fn set_skip_race_once(&mut self) {
        self.skip_race_once = true;
    }

    pub fn release_skip_race(&mut self) {
        if self.skip_race_once {
            info!("[planned_race] releasing skip guard");
        }
        self.skip_race_once = false;
    }

    pub fn mark_raced_today(&mut self) {
        if let Some(key) = self.state.date_key() {
            self.raced_keys.insert(key);
        }
        self.skip_race_once = true;
    }

    pub fn raced_today(&self) -> bool {
        self.state
            .date_key()
            .map(|k| self.raced_keys.contains(&k))
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // State extraction
    // ------------------------------------------------------------------

    /// Region holding the career date line: just above the turn counter.
    fn date_roi(turns: &BBox) -> BBox {
        let h = turns.height();
        BBox::new(turns.x1, (turns.y1 - 1.4 * h).max(0.0), turns.x2, turns.y1)
    }

    pub fn update_state(
        &mut self,
        waiter: &mut Waiter,
        frame: &FrameImage,
        dets: &[Detection],
    ) {
        if let Some(energy) = find_best(dets, DetClass::UiEnergy, 0.3) {
            if let Some(v) = parse_number(&waiter.ocr_text(frame, energy.bbox)) {
                self.state.energy = Some(v.min(150));
            }
        }
        if let Some(pts) = find_best(dets, DetClass::UiSkillPts, 0.3) {
            if let Some(v) = parse_number(&waiter.ocr_text(frame, pts.bbox)) {
                self.state.skill_pts = v;
            }
        }
        if let Some(mood) = find_best(dets, DetClass::UiMood, 0.3) {
            if let Some(m) = Mood::parse_ocr(&waiter.ocr_text(frame, mood.bbox)) {
                self.state.mood = Some(m);
            }
        }
        if let Some(goal) = find_best(dets, DetClass::UiGoal, 0.3) {
            let text = waiter.ocr_text(frame, goal.bbox);
            if !text.trim().is_empty() {
                self.state.goal = text;
            }
        }
        if let Some(stats) = find_best(dets, DetClass::UiStats, 0.3) {
            let observed = parse_stats_row(&waiter.ocr_text(frame, stats.bbox));
            if !observed.is_empty() {
                self.observe_stats(&observed);
            }
        }

        let mut date_raw = None;
        if let Some(turns) = find_best(dets, DetClass::UiTurns, 0.3) {
            if let Some(v) = parse_number(&waiter.ocr_text(frame, turns.bbox)) {
                self.state.turn = Some(v as i32);
            }
            let raw = waiter.ocr_text(frame, Self::date_roi(&turns.bbox));
            if !raw.trim().is_empty() {
                date_raw = Some(raw);
            }
        }
        self.observe_date(date_raw.as_deref());

        self.state.infirmary_on = dets
            .iter()
            .any(|d| d.class == DetClass::LobbyInfirmary && d.conf >= INFIRMARY_ACTIVE_CONF);
        self.state.pal_available = dets
            .iter()
            .any(|d| d.class == DetClass::LobbyPal && d.conf >= PAL_ICON_CONF);
    }

    /// Monotonic date acceptance with warm-up backfix, persistence for
    /// suspicious jumps, and turn-driven auto-advance when OCR stalls.
    pub fn observe_date(&mut self, raw: Option<&str>) {
        self.state.date_raw = raw.map(|r| r.to_string());
        let cand = raw.and_then(parse_career_date);
        let prev = self.state.date;

        let Some(cand) = cand else {
            // OCR produced nothing; if the turn counter moved, the half-month
            // was consumed anyway.
            self.maybe_auto_advance();
            return;
        };

        // Final Season lock.
        if let Some(prev) = prev {
            if prev.is_finals() {
                if cand.is_finals() {
                    self.commit_date(cand, false, "monotonic");
                } else {
                    debug!("[date] ignoring non-final date after Final Season lock");
                }
                return;
            }
            if prev.is_regular_year() && cand.is_pre_debut() {
                debug!("[date] ignoring backward date {} after {}", cand.key(), prev.key());
                return;
            }
        }

        let Some(prev) = prev else {
            self.commit_date(cand, false, "initial");
            return;
        };

        match date_cmp(&cand, &prev) {
            std::cmp::Ordering::Less => {
                let gap = prev
                    .index()
                    .zip(cand.index())
                    .map(|(p, c)| p.saturating_sub(c))
                    .unwrap_or(0);
                if self.date_artificial || self.date_stable < DATE_WARMUP_FRAMES {
                    self.pending_back = None;
                    self.pending_back_count = 0;
                    self.commit_date(cand, false, "backfix (warmup/artificial)");
                } else if gap > DATE_MAX_JUMP_HALVES {
                    // Large backward correction: require persistence.
                    if self.pending_back == Some(cand) {
                        self.pending_back_count += 1;
                    } else {
                        self.pending_back = Some(cand);
                        self.pending_back_count = 1;
                    }
                    if self.pending_back_count >= DATE_PERSIST_FRAMES {
                        self.pending_back = None;
                        self.pending_back_count = 0;
                        self.commit_date(cand, false, "backfix (confirmed)");
                    } else {
                        debug!(
                            "[date] holding backward jump {} -> {}",
                            prev.key(),
                            cand.key()
                        );
                    }
                } else {
                    self.commit_date(cand, false, "backfix (small)");
                }
            }
            _ => {
                let gap = prev
                    .index()
                    .zip(cand.index())
                    .map(|(p, c)| c.saturating_sub(p))
                    .unwrap_or(0);
                let finals_boundary = prev.year_code == 3
                    && prev.month == Some(12)
                    && cand.is_finals();
                if gap > DATE_MAX_JUMP_HALVES && !finals_boundary {
                    // More than ~3 months in one frame: likely an OCR glitch.
                    if self.pending_jump == Some(cand) {
                        self.pending_jump = None;
                        self.commit_date(cand, false, "confirmed jump");
                    } else {
                        debug!(
                            "[date] suspicious jump {} -> {} (gap={}); holding",
                            prev.key(),
                            cand.key(),
                            gap
                        );
                        self.pending_jump = Some(cand);
                    }
                    return;
                }
                self.pending_jump = None;
                let merged = CareerDate::merge(Some(&prev), cand);
                if merged == prev {
                    self.date_stable += 1;
                    // Re-reading the same key while turns tick down means the
                    // half advanced without the OCR noticing.
                    self.maybe_auto_advance();
                } else {
                    self.commit_date(merged, false, "monotonic");
                }
            }
        }
    }

    fn maybe_auto_advance(&mut self) {
        let Some(prev) = self.state.date else {
            return;
        };
        if !prev.is_regular_year() {
            return;
        }
        let (Some(turn), Some(last_turn)) = (self.state.turn, self.last_turn_at_date_update)
        else {
            return;
        };
        if turn >= last_turn {
            return;
        }
        if let Some(advanced) = prev.advance_half() {
            info!(
                "[date] auto-advanced by turns: {} -> {}",
                prev.key(),
                advanced.key()
            );
            self.commit_date(advanced, true, "auto-advance");
        }
    }

    fn commit_date(&mut self, date: CareerDate, artificial: bool, reason: &str) {
        let prev_key = self.state.date.map(|d| d.key());
        let new_key = date.key();
        if prev_key.as_deref() != Some(new_key.as_str()) {
            self.raced_keys.clear();
        }
        info!(
            "[date] {}: {} -> {}",
            reason,
            prev_key.unwrap_or_else(|| "None".to_string()),
            new_key
        );
        self.state.date = Some(date);
        self.date_stable = 0;
        self.date_artificial = artificial;
        self.last_turn_at_date_update = self.state.turn;
    }

    /// Guarded stat merge: first valid read is accepted, normal steps pass,
    /// large moves need to repeat before they stick.
    pub fn observe_stats(&mut self, observed: &BTreeMap<StatKey, u32>) {
        let mut changed: Vec<String> = Vec::new();
        for (&key, &new_val) in observed {
            if !(STAT_MIN..=STAT_MAX).contains(&new_val) {
                continue;
            }
            let prev = self.state.stats.get(&key).copied();
            let Some(prev) = prev else {
                self.state.stats.insert(key, new_val);
                changed.push(format!("{}:-1->{}", key.label(), new_val));
                continue;
            };

            if new_val >= prev {
                let delta = new_val - prev;
                if delta <= STAT_MAX_UP_STEP {
                    if delta > 0 {
                        changed.push(format!("{}:{}->{}", key.label(), prev, new_val));
                    }
                    self.state.stats.insert(key, new_val);
                    self.stat_pending_up.remove(&key);
                } else {
                    let entry = self.stat_pending_up.entry(key).or_insert((new_val, 0));
                    if entry.0 == new_val {
                        entry.1 += 1;
                    } else {
                        *entry = (new_val, 1);
                    }
                    if entry.1 >= STAT_PERSIST_FRAMES {
                        self.state.stats.insert(key, new_val);
                        self.stat_pending_up.remove(&key);
                        changed.push(format!("{}:{}->{} (confirmed)", key.label(), prev, new_val));
                    }
                }
            } else {
                let drop = prev - new_val;
                if drop <= STAT_MAX_DOWN_STEP {
                    self.state.stats.insert(key, new_val);
                    self.stat_pending_down.remove(&key);
                    changed.push(format!("{}:{}->{}", key.label(), prev, new_val));
                } else {
                    let entry = self.stat_pending_down.entry(key).or_insert((new_val, 0));
                    if entry.0 == new_val {
                        entry.1 += 1;
                    } else {
                        *entry = (new_val, 1);
                    }
                    if entry.1 >= STAT_PERSIST_FRAMES {
                        self.state.stats.insert(key, new_val);
                        self.stat_pending_down.remove(&key);
                        changed.push(format!("{}:{}->{} (correction)", key.label(), prev, new_val));
                    } else {
                        debug!(
                            "[stats] holding large drop {}:{}->{}",
                            key.label(),
                            prev,
                            new_val
                        );
                    }
                }
            }
        }
        if !changed.is_empty() {
            info!("[stats] update: {}", changed.join(", "));
        }
    }

    // ------------------------------------------------------------------
    // Goal parsing
    // ------------------------------------------------------------------

    /// Critical-goal classification from the OCR'd goal line. Returns the
    /// race reason tag when the current goal demands racing soon.
    pub fn critical_goal_reason(&self) -> Option<&'static str> {
        let goal = self.state.goal.to_lowercase();
        if goal.is_empty() {
            return None;
        }
        let turn = self.state.turn.unwrap_or(i32::MAX);
        if turn > self.max_critical_turn {
            return None;
        }

        let progress = fuzzy_contains(&goal, "progress", 0.58);
        let win_maiden = fuzzy_contains(&goal, "win", 0.7)
            && fuzzy_contains(&goal, "maiden", 0.7)
            && fuzzy_contains(&goal, "race", 0.7);
        let fans = progress
            || win_maiden
            || (fuzzy_contains(&goal, "go", 0.7)
                && fuzzy_contains(&goal, "fan", 0.7)
                && !fuzzy_contains(&goal, "achieve", 0.7));
        let g1 = progress
            && (fuzzy_contains(&goal, "g1", 0.7)
                || fuzzy_contains(&goal, "place within", 0.7)
                || (fuzzy_contains(&goal, "place", 0.7) && fuzzy_contains(&goal, "top", 0.7)));

        if g1 {
            Some("G1")
        } else if fans {
            Some("FANS")
        } else {
            None
        }
    }

    /// Planned race active today: not yet raced, not on cooldown.
    pub fn planned_race_today<'a>(
        &self,
        planned: &'a PlannedRaceIndex,
    ) -> Option<(&'a str, bool)> {
        let key = self.state.date_key()?;
        if self.raced_keys.contains(&key) {
            return None;
        }
        planned.race_for(&key)
    }

    // ------------------------------------------------------------------
    // Navigation helpers
    // ------------------------------------------------------------------

    pub fn go_rest(&self, waiter: &mut Waiter, reason: &str) -> anyhow::Result<bool> {
        info!("[lobby] {}", reason);
        let spec = ClickSpec::new(
            &[DetClass::LobbyRest, DetClass::LobbyRestSummer],
            "lobby_rest",
        )
        .prefer_bottom()
        .timeout(waiter.fraction_timeout(0.6));
        let clicked = waiter.click_when(&spec)?.is_some();
        if clicked {
            waiter.settle(4.0)?;
        }
        Ok(clicked)
    }

    /// Recreation, picking a PAL row when one is on screen. Chain progress is
    /// recorded into the PAL memory for the rest-substitution gate.
    pub fn go_recreate(
        &self,
        waiter: &mut Waiter,
        pal_memory: &mut PalMemory,
        reason: &str,
    ) -> anyhow::Result<bool> {
        info!("[lobby] {}", reason);
        let spec = ClickSpec::new(
            &[DetClass::LobbyRecreation, DetClass::LobbyRestSummer],
            "lobby_recreate",
        )
        .prefer_bottom()
        .timeout(waiter.fraction_timeout(0.6));
        if waiter.click_when(&spec)?.is_none() {
            return Ok(false);
        }
        waiter.settle(3.0)?;

        let (_frame, dets) = waiter.snap("recreation_screen")?;
        let mut rows: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::RecreationRow)
            .collect();
        if rows.is_empty() {
            return Ok(true);
        }
        rows.sort_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // Prefer the row that still advances a PAL chain; otherwise the top.
        let mut chosen = rows[0];
        for (i, &row) in rows.iter().enumerate() {
            let steps = dets
                .iter()
                .filter(|d| d.class == DetClass::EventChain && row.bbox.contains(&d.bbox, 2.0))
                .count() as u32;
            let pal_face = dets
                .iter()
                .any(|d| d.class == DetClass::SupportPal && row.bbox.contains(&d.bbox, 2.0));
            if pal_face {
                pal_memory.record_chain(&format!("recreation_row_{i}"), steps, None);
                chosen = row;
            }
        }
        waiter.click_bbox(chosen.bbox, 1)?;
        waiter.settle(2.0)?;
        Ok(true)
    }

    pub fn go_skills(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        info!("[lobby] Opening Skills");
        let spec = ClickSpec::new(&[DetClass::LobbySkills], "lobby_skills")
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.6));
        let clicked = waiter.click_when(&spec)?.is_some();
        if clicked {
            waiter.settle(2.0)?;
        }
        Ok(clicked)
    }

    pub fn go_infirmary(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        info!("[lobby] Infirmary ON -> going to infirmary");
        let spec = ClickSpec::new(&[DetClass::LobbyInfirmary], "lobby_infirmary")
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.6));
        let clicked = waiter.click_when(&spec)?.is_some();
        if clicked {
            waiter.settle(3.0)?;
        }
        Ok(clicked)
    }

    pub fn go_training(&self, waiter: &mut Waiter, reason: &str) -> anyhow::Result<bool> {
        info!("[lobby] {} -> go Train", reason);
        let spec = ClickSpec::new(&[DetClass::LobbyTraining], "lobby_training")
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.6));
        let clicked = waiter.click_when(&spec)?.is_some();
        if clicked {
            waiter.settle(2.0)?;
        }
        Ok(clicked)
    }

    /// Minimal OCR-gated BACK.
    pub fn go_back(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        let spec = ClickSpec::new(&[DetClass::ButtonWhite], "lobby_back")
            .texts(&["BACK"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.5));
        let clicked = waiter.click_when(&spec)?.is_some();
        if clicked {
            info!("[lobby] GO BACK");
            waiter.settle(2.0)?;
        }
        Ok(clicked)
    }
}

fn parse_number(text: &str) -> Option<u32> {
    let norm = normalize_ocr(text);
    for tok in norm.split_whitespace() {
        let digits: String = tok.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && digits.len() == tok.len() {
            if let Ok(v) = digits.parse::<u32>() {
                return Some(v);
            }
        }
    }
    None
}

/// The stats bar reads as one line; numeric tokens map to SPD, STA, PWR,
/// GUTS, WIT left to right. Label tokens and OCR noise are skipped.
fn parse_stats_row(text: &str) -> BTreeMap<StatKey, u32> {
    let norm = normalize_ocr(text);
    let mut values = norm.split_whitespace().filter_map(|tok| {
        let digits: String = tok.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && digits.len() == tok.len() {
            digits.parse::<u32>().ok()
        } else {
            None
        }
    });
    let mut out = BTreeMap::new();
    for key in StatKey::ALL {
        match values.next() {
            Some(v) => {
                out.insert(key, v);
            }
            None => break,
        }
    }
    out
}
