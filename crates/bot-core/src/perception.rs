//! Perception boundary: labeled boxes with confidences plus ROI OCR.
//!
//! The engine behind this trait may be local or remote; the core treats it as
//! a pure function of the captured frame. Backends must not be assumed
//! thread-safe; the agent loop is the only caller.

use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// Closed vocabulary of detector classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetClass {
    LobbyCoach,
    LobbyInfirmary,
    LobbyRest,
    LobbyRestSummer,
    LobbyRecreation,
    LobbySkills,
    LobbyTraining,
    LobbyRaces,
    LobbyPal,
    TrainingButton,
    EventChoice,
    EventCard,
    EventChain,
    RaceRaceDay,
    RaceSquare,
    RaceStar,
    RaceBadge,
    RaceAfterNext,
    ButtonGreen,
    ButtonWhite,
    ButtonChange,
    ButtonSkip,
    ButtonGolden,
    ButtonPink,
    ButtonClawAction,
    Claw,
    SkillsSquare,
    SkillsBuy,
    SpiritWhite,
    SpiritWhiteExploded,
    SpiritBlue,
    UnityOpponentBanner,
    SupportBlue,
    SupportGreen,
    SupportOrange,
    SupportMax,
    SupportHint,
    SupportRainbow,
    SupportReporter,
    SupportDirector,
    SupportPal,
    UiTurns,
    UiGoal,
    UiSkillPts,
    UiEnergy,
    UiMood,
    UiStats,
    RecreationRow,
}

impl DetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetClass::LobbyCoach => "lobby_coach",
            DetClass::LobbyInfirmary => "lobby_infirmary",
            DetClass::LobbyRest => "lobby_rest",
            DetClass::LobbyRestSummer => "lobby_rest_summer",
            DetClass::LobbyRecreation => "lobby_recreation",
            DetClass::LobbySkills => "lobby_skills",
            DetClass::LobbyTraining => "lobby_training",
            DetClass::LobbyRaces => "lobby_races",
            DetClass::LobbyPal => "lobby_pal",
            DetClass::TrainingButton => "training_button",
            DetClass::EventChoice => "event_choice",
            DetClass::EventCard => "event_card",
            DetClass::EventChain => "event_chain",
            DetClass::RaceRaceDay => "race_race_day",
            DetClass::RaceSquare => "race_square",
            DetClass::RaceStar => "race_star",
            DetClass::RaceBadge => "race_badge",
            DetClass::RaceAfterNext => "race_after_next",
            DetClass::ButtonGreen => "button_green",
            DetClass::ButtonWhite => "button_white",
            DetClass::ButtonChange => "button_change",
            DetClass::ButtonSkip => "button_skip",
            DetClass::ButtonGolden => "button_golden",
            DetClass::ButtonPink => "button_pink",
            DetClass::ButtonClawAction => "button_claw_action",
            DetClass::Claw => "claw",
            DetClass::SkillsSquare => "skills_square",
            DetClass::SkillsBuy => "skills_buy",
            DetClass::SpiritWhite => "spirit_white",
            DetClass::SpiritWhiteExploded => "spirit_white_exploded",
            DetClass::SpiritBlue => "spirit_blue",
            DetClass::UnityOpponentBanner => "unity_opponent_banner",
            DetClass::SupportBlue => "support_blue",
            DetClass::SupportGreen => "support_green",
            DetClass::SupportOrange => "support_orange",
            DetClass::SupportMax => "support_max",
            DetClass::SupportHint => "support_hint",
            DetClass::SupportRainbow => "support_rainbow",
            DetClass::SupportReporter => "support_reporter",
            DetClass::SupportDirector => "support_director",
            DetClass::SupportPal => "support_pal",
            DetClass::UiTurns => "ui_turns",
            DetClass::UiGoal => "ui_goal",
            DetClass::UiSkillPts => "ui_skill_pts",
            DetClass::UiEnergy => "ui_energy",
            DetClass::UiMood => "ui_mood",
            DetClass::UiStats => "ui_stats",
            DetClass::RecreationRow => "recreation_row",
        }
    }
}

impl std::fmt::Display for DetClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One labeled box from the detector, pixel-space relative to the frame.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    pub class: DetClass,
    pub bbox: BBox,
    pub conf: f32,
}

impl Detection {
    pub fn new(class: DetClass, bbox: BBox, conf: f32) -> Self {
        Self { class, bbox, conf }
    }
}

/// Opaque captured frame handle. The core never reads pixels; perception does.
#[derive(Debug, Clone)]
pub struct FrameImage {
    /// Monotonic capture sequence number; keys the per-frame OCR cache.
    pub seq: u64,
    pub width: u32,
    pub height: u32,
}

pub trait Perception {
    fn detect(&mut self, frame: &FrameImage) -> anyhow::Result<Vec<Detection>>;

    /// OCR the region of interest; returns (text, confidence) tokens.
    fn ocr(&mut self, frame: &FrameImage, roi: BBox) -> anyhow::Result<Vec<(String, f32)>>;
}

// ---------------------------------------------------------------------------
// Detection-set helpers shared by the classifier and the flows.
// ---------------------------------------------------------------------------

pub fn filter_class<'a>(dets: &'a [Detection], class: DetClass) -> Vec<&'a Detection> {
    dets.iter().filter(|d| d.class == class).collect()
}

pub fn filter_classes<'a>(
    dets: &'a [Detection],
    classes: &[DetClass],
    conf_min: f32,
) -> Vec<&'a Detection> {
    dets.iter()
        .filter(|d| classes.contains(&d.class) && d.conf >= conf_min)
        .collect()
}

pub fn any_conf(dets: &[Detection], class: DetClass, conf_min: f32) -> bool {
    dets.iter().any(|d| d.class == class && d.conf >= conf_min)
}

pub fn count_conf(dets: &[Detection], class: DetClass, conf_min: f32) -> usize {
    dets.iter()
        .filter(|d| d.class == class && d.conf >= conf_min)
        .count()
}

pub fn find_best<'a>(
    dets: &'a [Detection],
    class: DetClass,
    conf_min: f32,
) -> Option<&'a Detection> {
    dets.iter()
        .filter(|d| d.class == class && d.conf >= conf_min)
        .max_by(|a, b| a.conf.partial_cmp(&b.conf).unwrap_or(std::cmp::Ordering::Equal))
}

pub fn bottom_most<'a>(dets: &[&'a Detection]) -> Option<&'a Detection> {
    dets.iter()
        .copied()
        .max_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Scene signature used by scroll-scan early stopping: (class, coarse center
/// buckets). Two frames with matching signatures look like the same view.
pub fn scene_signature(dets: &[Detection]) -> Vec<(DetClass, i32, i32)> {
    let mut sig: Vec<(DetClass, i32, i32)> = dets
        .iter()
        .map(|d| {
            let (cx, cy) = d.bbox.center();
            (d.class, (cx as i32) / 8, (cy as i32) / 8)
        })
        .collect();
    sig.sort_by_key(|(c, x, y)| (c.as_str(), *x, *y));
    sig
}

/// Bucket-tolerant signature equivalence (|dx| <= 1 and |dy| <= 1 per item,
/// same per-class counts).
pub fn signatures_nearly_same(a: &[(DetClass, i32, i32)], b: &[(DetClass, i32, i32)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut pool: Vec<(DetClass, i32, i32, bool)> =
        b.iter().map(|&(c, x, y)| (c, x, y, false)).collect();
    for &(ca, xa, ya) in a {
        let mut matched = false;
        for entry in pool.iter_mut() {
            if entry.3 || entry.0 != ca {
                continue;
            }
            if (entry.1 - xa).abs() <= 1 && (entry.2 - ya).abs() <= 1 {
                entry.3 = true;
                matched = true;
                break;
            }
        }
        if !matched {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: DetClass, x: f32, y: f32, conf: f32) -> Detection {
        Detection::new(class, BBox::new(x, y, x + 10.0, y + 10.0), conf)
    }

    #[test]
    fn filters_respect_confidence() {
        let dets = vec![
            det(DetClass::ButtonGreen, 0.0, 0.0, 0.4),
            det(DetClass::ButtonGreen, 0.0, 20.0, 0.9),
        ];
        assert_eq!(count_conf(&dets, DetClass::ButtonGreen, 0.5), 1);
        assert!(any_conf(&dets, DetClass::ButtonGreen, 0.5));
        assert!(!any_conf(&dets, DetClass::ButtonWhite, 0.0));
    }

    #[test]
    fn bottom_most_picks_lowest_box() {
        let dets = vec![
            det(DetClass::ButtonWhite, 0.0, 10.0, 0.8),
            det(DetClass::ButtonWhite, 0.0, 90.0, 0.8),
        ];
        let refs: Vec<&Detection> = dets.iter().collect();
        let picked = bottom_most(&refs).unwrap();
        assert_eq!(picked.bbox.y1, 90.0);
    }

    #[test]
    fn signature_tolerates_small_shifts() {
        let a = vec![det(DetClass::SkillsSquare, 40.0, 40.0, 0.9)];
        let b = vec![det(DetClass::SkillsSquare, 44.0, 46.0, 0.9)];
        let c = vec![det(DetClass::SkillsSquare, 140.0, 40.0, 0.9)];
        assert!(signatures_nearly_same(
            &scene_signature(&a),
            &scene_signature(&b)
        ));
        assert!(!signatures_nearly_same(
            &scene_signature(&a),
            &scene_signature(&c)
        ));
    }
}
