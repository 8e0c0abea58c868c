//! Screen classification: detection set -> discrete screen label.
//!
//! Rules are presence/count checks over the detection classes with two
//! confidence tiers for the critical classes. The relaxed tier is only
//! consulted under patience escalation, and every relaxed hit is logged so
//! operators can curate detector training data.

use tracing::info;

use crate::config::Scenario;
use crate::perception::{any_conf, count_conf, DetClass, Detection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenLabel {
    Lobby,
    LobbySummer,
    Raceday,
    UnityCupRaceday,
    Training,
    Event,
    EventStale,
    Inspiration,
    KashimotoTeam,
    ClawGame,
    RaceLobby,
    FinalScreen,
    Unknown,
}

impl ScreenLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenLabel::Lobby => "Lobby",
            ScreenLabel::LobbySummer => "LobbySummer",
            ScreenLabel::Raceday => "Raceday",
            ScreenLabel::UnityCupRaceday => "UnityCupRaceday",
            ScreenLabel::Training => "Training",
            ScreenLabel::Event => "Event",
            ScreenLabel::EventStale => "EventStale",
            ScreenLabel::Inspiration => "Inspiration",
            ScreenLabel::KashimotoTeam => "KashimotoTeam",
            ScreenLabel::ClawGame => "ClawGame",
            ScreenLabel::RaceLobby => "RaceLobby",
            ScreenLabel::FinalScreen => "FinalScreen",
            ScreenLabel::Unknown => "Unknown",
        }
    }
}

/// Primary thresholds classify on their own; relaxed ones only apply under
/// patience escalation.
#[derive(Debug, Clone)]
pub struct ScreenThresholds {
    pub lobby_conf: f32,
    pub training_conf: f32,
    pub event_conf: f32,
    pub race_day_conf: f32,
    pub race_day_relaxed: f32,
    pub golden_conf: f32,
    pub golden_relaxed: f32,
}

impl Default for ScreenThresholds {
    fn default() -> Self {
        Self {
            lobby_conf: 0.60,
            training_conf: 0.50,
            event_conf: 0.60,
            race_day_conf: 0.61,
            race_day_relaxed: 0.35,
            golden_conf: 0.61,
            golden_relaxed: 0.35,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub label: ScreenLabel,
    /// A relaxed threshold decided the outcome; counted by the agent.
    pub relaxed_hit: bool,
}

/// Primary-then-relaxed presence check for one critical class. In Unity Cup
/// the relaxed race-day tier additionally requires supporting button
/// evidence, because the card alone at low confidence misfires.
fn tiered_presence(
    dets: &[Detection],
    class: DetClass,
    primary: f32,
    relaxed_conf: f32,
    relaxed_enabled: bool,
    support_present: bool,
    require_support: bool,
) -> (bool, bool) {
    if any_conf(dets, class, primary) {
        return (true, false);
    }
    if !relaxed_enabled || relaxed_conf >= primary {
        return (false, false);
    }
    let hit = dets
        .iter()
        .filter(|d| d.class == class && d.conf >= relaxed_conf)
        .max_by(|a, b| a.conf.partial_cmp(&b.conf).unwrap_or(std::cmp::Ordering::Equal));
    match hit {
        Some(d) if !require_support || support_present => {
            info!(
                "[classifier] relaxed accept class={} conf={:.2} (primary={:.2} relaxed={:.2})",
                class, d.conf, primary, relaxed_conf
            );
            (true, true)
        }
        _ => (false, false),
    }
}

pub fn classify(
    scenario: Scenario,
    dets: &[Detection],
    th: &ScreenThresholds,
    relaxed: bool,
) -> Classification {
    let n_event = count_conf(dets, DetClass::EventChoice, th.event_conf);
    let n_train = count_conf(dets, DetClass::TrainingButton, th.training_conf);

    let has_coach = any_conf(dets, DetClass::LobbyCoach, th.lobby_conf);
    let has_infirmary = any_conf(dets, DetClass::LobbyInfirmary, th.lobby_conf);
    let has_rest = any_conf(dets, DetClass::LobbyRest, th.lobby_conf);
    let has_rest_summer = any_conf(dets, DetClass::LobbyRestSummer, th.lobby_conf);
    let has_recreation = any_conf(dets, DetClass::LobbyRecreation, th.lobby_conf);
    let has_lobby_skills = any_conf(dets, DetClass::LobbySkills, th.lobby_conf);
    let has_white = any_conf(dets, DetClass::ButtonWhite, th.lobby_conf);
    let has_green = any_conf(dets, DetClass::ButtonGreen, th.lobby_conf);
    let has_pink = any_conf(dets, DetClass::ButtonPink, th.lobby_conf);
    let has_change = any_conf(dets, DetClass::ButtonChange, th.lobby_conf);
    let has_badge = any_conf(dets, DetClass::RaceBadge, th.lobby_conf);
    let has_claw_action = any_conf(dets, DetClass::ButtonClawAction, th.lobby_conf);
    let has_claw = any_conf(dets, DetClass::Claw, th.lobby_conf);

    let (has_race_day, race_day_relaxed) = tiered_presence(
        dets,
        DetClass::RaceRaceDay,
        th.race_day_conf,
        th.race_day_relaxed,
        relaxed,
        has_white || has_green,
        scenario == Scenario::UnityCup,
    );
    let (has_golden, golden_relaxed) = tiered_presence(
        dets,
        DetClass::ButtonGolden,
        th.golden_conf,
        th.golden_relaxed,
        relaxed,
        false,
        false,
    );
    let relaxed_hit = race_day_relaxed || golden_relaxed;

    let done = |label| Classification { label, relaxed_hit };

    if n_event >= 2 {
        return done(ScreenLabel::Event);
    }

    if has_golden {
        if scenario == Scenario::UnityCup && has_white {
            return done(ScreenLabel::KashimotoTeam);
        }
        return done(ScreenLabel::Inspiration);
    }

    if has_race_day {
        if has_coach {
            return done(ScreenLabel::Raceday);
        }
        if scenario == Scenario::UnityCup {
            return done(ScreenLabel::UnityCupRaceday);
        }
    }

    if n_train == 5 {
        return done(ScreenLabel::Training);
    }

    if has_coach && has_rest_summer && !has_rest && !has_recreation {
        return done(ScreenLabel::LobbySummer);
    }

    if has_coach && has_infirmary && has_lobby_skills {
        return done(ScreenLabel::Lobby);
    }

    let final_screen = match scenario {
        Scenario::Ura => dets.len() <= 2 && has_lobby_skills,
        Scenario::UnityCup => dets.len() <= 3 && has_lobby_skills && has_pink,
    };
    if final_screen {
        return done(ScreenLabel::FinalScreen);
    }

    if has_claw_action && has_claw {
        return done(ScreenLabel::ClawGame);
    }

    if n_event == 1 {
        return done(ScreenLabel::EventStale);
    }

    if has_change && has_badge {
        return done(ScreenLabel::RaceLobby);
    }

    done(ScreenLabel::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use crate::perception::Detection;

    fn d(class: DetClass, conf: f32) -> Detection {
        Detection::new(class, BBox::new(0.0, 0.0, 10.0, 10.0), conf)
    }

    #[test]
    fn lobby_requires_coach_infirmary_and_skills() {
        let th = ScreenThresholds::default();
        let dets = vec![
            d(DetClass::LobbyCoach, 0.9),
            d(DetClass::LobbyInfirmary, 0.8),
            d(DetClass::LobbySkills, 0.8),
        ];
        let c = classify(Scenario::Ura, &dets, &th, false);
        assert_eq!(c.label, ScreenLabel::Lobby);
        assert!(!c.relaxed_hit);

        let partial = vec![d(DetClass::LobbyCoach, 0.9)];
        assert_eq!(
            classify(Scenario::Ura, &partial, &th, false).label,
            ScreenLabel::Unknown
        );
    }

    #[test]
    fn event_outranks_everything() {
        let th = ScreenThresholds::default();
        let dets = vec![
            d(DetClass::EventChoice, 0.9),
            d(DetClass::EventChoice, 0.8),
            d(DetClass::LobbyCoach, 0.9),
            d(DetClass::RaceRaceDay, 0.9),
        ];
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::Event
        );
    }

    #[test]
    fn single_event_choice_is_stale() {
        let th = ScreenThresholds::default();
        let dets = vec![d(DetClass::EventChoice, 0.9)];
        assert_eq!(
            classify(Scenario::UnityCup, &dets, &th, false).label,
            ScreenLabel::EventStale
        );
    }

    #[test]
    fn training_needs_exactly_five_tiles() {
        let th = ScreenThresholds::default();
        let mut dets: Vec<Detection> = (0..5).map(|_| d(DetClass::TrainingButton, 0.7)).collect();
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::Training
        );
        dets.pop();
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::Unknown
        );
    }

    #[test]
    fn summer_lobby_when_summer_rest_replaces_rest() {
        let th = ScreenThresholds::default();
        let dets = vec![
            d(DetClass::LobbyCoach, 0.9),
            d(DetClass::LobbyRestSummer, 0.9),
            d(DetClass::LobbyInfirmary, 0.9),
        ];
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::LobbySummer
        );
    }

    #[test]
    fn golden_relaxed_threshold_classifies_inspiration() {
        let th = ScreenThresholds {
            golden_conf: 0.9,
            golden_relaxed: 0.45,
            ..ScreenThresholds::default()
        };
        let dets = vec![d(DetClass::ButtonGolden, 0.5)];

        let strict = classify(Scenario::UnityCup, &dets, &th, false);
        assert_eq!(strict.label, ScreenLabel::Unknown);

        let relaxed = classify(Scenario::UnityCup, &dets, &th, true);
        assert_eq!(relaxed.label, ScreenLabel::Inspiration);
        assert!(relaxed.relaxed_hit);
    }

    #[test]
    fn race_day_relaxed_needs_support_in_unity_cup() {
        let th = ScreenThresholds {
            race_day_conf: 0.85,
            race_day_relaxed: 0.5,
            ..ScreenThresholds::default()
        };

        let alone = vec![d(DetClass::RaceRaceDay, 0.55)];
        assert_eq!(
            classify(Scenario::UnityCup, &alone, &th, true).label,
            ScreenLabel::Unknown
        );

        let supported = vec![d(DetClass::RaceRaceDay, 0.55), d(DetClass::ButtonWhite, 0.7)];
        let c = classify(Scenario::UnityCup, &supported, &th, true);
        assert_eq!(c.label, ScreenLabel::UnityCupRaceday);
        assert!(c.relaxed_hit);
    }

    #[test]
    fn kashimoto_team_is_golden_plus_white() {
        let th = ScreenThresholds::default();
        let dets = vec![d(DetClass::ButtonGolden, 0.8), d(DetClass::ButtonWhite, 0.8)];
        assert_eq!(
            classify(Scenario::UnityCup, &dets, &th, false).label,
            ScreenLabel::KashimotoTeam
        );
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::Inspiration
        );
    }

    #[test]
    fn race_lobby_from_change_and_badge() {
        let th = ScreenThresholds::default();
        let dets = vec![d(DetClass::ButtonChange, 0.8), d(DetClass::RaceBadge, 0.8)];
        assert_eq!(
            classify(Scenario::Ura, &dets, &th, false).label,
            ScreenLabel::RaceLobby
        );
    }
}
