//! Per-tile support value (SV) computation.
//!
//! URA scores come from gauge colors, rainbows and tile-capped hint bonuses.
//! Unity Cup adds spirit terms (white fills/explosions, blue bursts) with
//! preset weights, seasonal multipliers and deadline boosts. Risk gating
//! relaxes the failure ceiling as SV grows.

use crate::config::{Preset, Scenario};
use crate::date::CareerDate;
use crate::geometry::BBox;
use crate::memory::SkillMemory;
use crate::types::{stat_headroom, StatKey, Stats};

const GREEDY_THRESHOLD_URA: f32 = 2.5;
const GREEDY_THRESHOLD_UNITY: f32 = 3.5;

const DEADLINE_BLUE_BOOST: f32 = 1.5;
const FINAL_WINDOW_BLUE_BOOST: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GaugeColor {
    Gray,
    Blue,
    Green,
    Orange,
    Yellow,
    Max,
    Unknown,
}

impl GaugeColor {
    fn is_blue_green(&self) -> bool {
        matches!(self, GaugeColor::Blue | GaugeColor::Green)
    }

    fn is_orange_max(&self) -> bool {
        matches!(self, GaugeColor::Orange | GaugeColor::Yellow | GaugeColor::Max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportKind {
    Standard,
    Reporter,
    Director,
    Pal,
}

#[derive(Debug, Clone)]
pub struct SupportEntry {
    pub kind: SupportKind,
    pub gauge: GaugeColor,
    pub has_hint: bool,
    pub has_rainbow: bool,
    /// Skills this card's hints teach; when all are already owned the hint
    /// contributes nothing.
    pub hint_skills: Vec<String>,
    /// Per-card hint value override from the preset, if any.
    pub hint_value: Option<f32>,
}

impl SupportEntry {
    pub fn standard(gauge: GaugeColor) -> Self {
        Self {
            kind: SupportKind::Standard,
            gauge,
            has_hint: false,
            has_rainbow: false,
            hint_skills: Vec::new(),
            hint_value: None,
        }
    }

    pub fn with_hint(mut self) -> Self {
        self.has_hint = true;
        self
    }

    pub fn with_rainbow(mut self) -> Self {
        self.has_rainbow = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TrainingTile {
    pub tile_idx: usize,
    pub stat: StatKey,
    pub bbox: BBox,
    /// Parsed "Failure NN%" reading; 255 when the bubble was unreadable.
    pub failure_pct: u8,
    pub supports: Vec<SupportEntry>,
    /// Unity Cup: white spirits currently filled on the tile.
    pub white_spirits_filled: u32,
    /// Unity Cup: white spirits that already exploded this turn.
    pub white_spirits_exploded: u32,
    /// Unity Cup: blue spirits on the tile; a pick triggers the burst.
    pub blue_spirits: u32,
}

impl TrainingTile {
    pub fn new(tile_idx: usize, stat: StatKey, failure_pct: u8) -> Self {
        Self {
            tile_idx,
            stat,
            bbox: BBox::new(0.0, 0.0, 10.0, 10.0),
            failure_pct,
            supports: Vec::new(),
            white_spirits_filled: 0,
            white_spirits_exploded: 0,
            blue_spirits: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileScore {
    pub tile_idx: usize,
    pub stat: StatKey,
    pub sv: f32,
    pub failure_pct: u8,
    pub risk_limit: u8,
    pub allowed: bool,
    pub greedy_hit: bool,
    /// Tile carries blue spirits, i.e. picking it triggers a burst.
    pub blue_burst: bool,
    /// Burst lands on an allowed stat with headroom left. Only meaningful
    /// when `blue_burst` is set.
    pub burst_allowed: bool,
    pub notes: Vec<String>,
}

pub struct EvalContext<'a> {
    pub scenario: Scenario,
    pub preset: &'a Preset,
    pub skill_memory: &'a SkillMemory,
    pub date: Option<CareerDate>,
    pub stats: &'a Stats,
}

fn director_score(gauge: GaugeColor) -> f32 {
    match gauge {
        GaugeColor::Blue => 0.25,
        GaugeColor::Green => 0.15,
        GaugeColor::Orange => 0.10,
        _ => 0.0,
    }
}

fn pal_score(gauge: GaugeColor) -> f32 {
    if gauge == GaugeColor::Blue {
        1.5
    } else {
        0.15
    }
}

fn hint_candidate(
    support: &SupportEntry,
    default_value: f32,
    hint_is_important: bool,
    skill_memory: &SkillMemory,
) -> f32 {
    // A hint whose skills are all already owned is worthless.
    if !support.hint_skills.is_empty()
        && support
            .hint_skills
            .iter()
            .all(|s| skill_memory.has_any_grade(s))
    {
        return 0.0;
    }
    let base = support.hint_value.unwrap_or(default_value);
    if hint_is_important {
        base * 3.0
    } else {
        base
    }
}

/// True when the date falls in the pre-milestone deadline window (before
/// Senior early November) or the terminal explode-everything window.
fn deadline_boost(ctx: &EvalContext, notes: &mut Vec<String>) -> f32 {
    let Some(date) = ctx.date else {
        return 1.0;
    };
    let Some(idx) = date.index() else {
        return 1.0;
    };
    let finals_idx = CareerDate::finals().index().unwrap_or(73);
    let last_window = ctx.preset.unity_cup.burst_deadline.final_season_explode_last_turns;
    if finals_idx.saturating_sub(idx) <= last_window {
        notes.push("burst window: final turns".to_string());
        return FINAL_WINDOW_BLUE_BOOST;
    }
    let milestone = CareerDate::new(3, 11, 1).index().unwrap_or(u32::MAX);
    let pre_window = ctx.preset.unity_cup.burst_deadline.pre_senior_nov_early_turns;
    if milestone >= idx && milestone - idx <= pre_window {
        notes.push("burst window: pre-deadline".to_string());
        return DEADLINE_BLUE_BOOST;
    }
    1.0
}

fn score_tile(tile: &TrainingTile, ctx: &EvalContext) -> TileScore {
    let preset = ctx.preset;
    let mut sv = 0.0f32;
    let mut notes: Vec<String> = Vec::new();

    let mut rainbow_count = 0u32;
    let mut blue_hint_best = 0.0f32;
    let mut orange_hint_best = 0.0f32;
    let mut any_hint = false;

    for s in &tile.supports {
        match s.kind {
            SupportKind::Reporter => {
                sv += 0.1;
                notes.push("reporter +0.10".to_string());
                continue;
            }
            SupportKind::Director => {
                let score = director_score(s.gauge);
                sv += score;
                notes.push(format!("director {:?} +{score:.2}", s.gauge));
                continue;
            }
            SupportKind::Pal => {
                let score = pal_score(s.gauge);
                sv += score;
                notes.push(format!("pal {:?} +{score:.2}", s.gauge));
                continue;
            }
            SupportKind::Standard => {}
        }

        if s.has_rainbow {
            sv += 1.0;
            rainbow_count += 1;
            notes.push("rainbow +1.00".to_string());
        }

        if s.gauge.is_blue_green() {
            sv += 1.0;
            notes.push(format!("card {:?} +1.00", s.gauge));
            if s.has_hint {
                any_hint = true;
                let v = hint_candidate(s, 0.75, preset.hint_is_important, ctx.skill_memory);
                blue_hint_best = blue_hint_best.max(v);
            }
        } else if s.gauge.is_orange_max() {
            if s.has_hint {
                any_hint = true;
                let v = hint_candidate(s, 0.5, preset.hint_is_important, ctx.skill_memory);
                orange_hint_best = orange_hint_best.max(v);
            }
        }
    }

    // Tile-capped hint bonus: one bucket wins, not one per card.
    let hint_bonus = blue_hint_best.max(orange_hint_best);
    if hint_bonus > 0.0 {
        sv += hint_bonus;
        notes.push(format!("hint +{hint_bonus:.2}"));
    }

    let rainbow_combo_weight = match ctx.scenario {
        Scenario::Ura => 0.5,
        Scenario::UnityCup => preset.unity_cup.scores.rainbow_combo,
    };
    if rainbow_count >= 2 {
        sv += rainbow_combo_weight;
        notes.push(format!("rainbow combo +{rainbow_combo_weight:.2}"));
    }

    let mut blue_burst = false;
    let mut burst_allowed = false;
    if ctx.scenario == Scenario::UnityCup {
        let scores = &preset.unity_cup.scores;
        let senior = ctx.date.map(|d| d.year_code >= 3).unwrap_or(false);
        let mult = if senior {
            &preset.unity_cup.multipliers.senior
        } else {
            &preset.unity_cup.multipliers.junior_classic
        };

        let white = tile.white_spirits_filled as f32 * scores.white_spirit_fill * mult.white
            + tile.white_spirits_exploded as f32 * scores.white_spirit_exploded * mult.white;
        if white > 0.0 {
            sv += white;
            notes.push(format!("white spirits +{white:.2}"));
        }
        if tile.white_spirits_filled >= 2 {
            let combo = (scores.white_combo_base
                + (tile.white_spirits_filled - 2) as f32 * scores.white_combo_per_fill
                + tile.white_spirits_exploded as f32 * scores.white_combo_exploded_tiny)
                * mult.white_combo;
            sv += combo;
            notes.push(format!("white combo +{combo:.2}"));
        }

        if tile.blue_spirits > 0 {
            blue_burst = true;
            let boost = deadline_boost(ctx, &mut notes);
            let blue = tile.blue_spirits as f32 * scores.blue_spirit_each * boost;
            sv += blue;
            notes.push(format!("blue spirits +{blue:.2}"));
            if tile.blue_spirits >= 2 {
                let combo = (tile.blue_spirits - 1) as f32
                    * scores.blue_combo_per_extra_fill
                    * mult.blue_combo;
                sv += combo;
                notes.push(format!("blue combo +{combo:.2}"));
            }
            burst_allowed = preset.unity_cup.burst_allows(tile.stat)
                && stat_headroom(ctx.stats, &preset.target_stats, tile.stat) > 0;
            if !burst_allowed {
                notes.push("burst blocked: stat outside allow-list or capped".to_string());
            }
        }
    }

    // Dynamic risk relax: high-SV tiles tolerate more failure. When the hint
    // weighting inflates SV, the middle tiers stay conservative.
    let base_limit = preset.max_failure as f32;
    let hint_inflated = any_hint && preset.hint_is_important;
    let risk_mult = if sv >= 5.0 {
        2.0
    } else if sv >= 3.5 && !hint_inflated {
        1.5
    } else if sv >= 2.75 && !hint_inflated {
        1.35
    } else if sv >= 2.25 {
        1.25
    } else {
        1.0
    };
    let risk_limit = (base_limit * risk_mult).min(100.0) as u8;
    let allowed = tile.failure_pct <= risk_limit;
    notes.push(format!(
        "risk: sv={sv:.2} limit={}% (base {}% x {risk_mult:.2})",
        risk_limit, preset.max_failure
    ));

    let greedy_threshold = match ctx.scenario {
        Scenario::Ura => GREEDY_THRESHOLD_URA,
        Scenario::UnityCup => GREEDY_THRESHOLD_UNITY,
    };

    TileScore {
        tile_idx: tile.tile_idx,
        stat: tile.stat,
        sv,
        failure_pct: tile.failure_pct,
        risk_limit,
        allowed,
        greedy_hit: allowed && sv >= greedy_threshold,
        blue_burst,
        burst_allowed,
        notes,
    }
}

/// Score every tile and order best-first (allowed tiles before disqualified
/// ones, then by SV).
pub fn evaluate_tiles(tiles: &[TrainingTile], ctx: &EvalContext) -> Vec<TileScore> {
    let mut out: Vec<TileScore> = tiles.iter().map(|t| score_tile(t, ctx)).collect();
    out.sort_by(|a, b| {
        b.allowed
            .cmp(&a.allowed)
            .then(b.sv.partial_cmp(&a.sv).unwrap_or(std::cmp::Ordering::Equal))
    });
    out
}
