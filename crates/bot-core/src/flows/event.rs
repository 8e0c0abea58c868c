//! Event-option decider.
//!
//! Reads the dialog title band next to the portrait, matches the catalog
//! record, resolves the preferred option, and rotates away from options that
//! would overflow the energy cap when the entity asks for it. Any
//! inconsistency falls back to the top option.

use tracing::{info, warn};

use crate::catalog::events::{
    max_positive_energy, reward_categories, select_candidate_by_priority, EventCatalog,
    EventEntityKind, EventPrefs, EventRecord, RewardCategory,
};
use crate::geometry::BBox;
use crate::perception::{DetClass, Detection, FrameImage};
use crate::waiter::Waiter;

const MIN_MATCH_SCORE: f32 = 0.5;
const PAL_OVERCAP_EXTRA: i32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct EventDecision {
    pub matched_key_step: Option<String>,
    pub pick: u8,
    pub clicked: Option<BBox>,
}

#[derive(Debug)]
pub struct EventFlow {
    catalog: EventCatalog,
    prefs: EventPrefs,
    conf_min_choice: f32,
    /// (key_step, pick, expected options) of the last click; detects
    /// two-phase confirmation dialogs.
    last_clicked: Option<(String, u8, usize)>,
}

impl EventFlow {
    pub fn new(catalog: EventCatalog, prefs: EventPrefs) -> Self {
        Self {
            catalog,
            prefs,
            conf_min_choice: 0.60,
            last_clicked: None,
        }
    }

    /// Banner ROI: the title ribbon sits to the right of the portrait.
    fn banner_roi(card: &BBox, frame: &FrameImage) -> BBox {
        let w = card.width();
        BBox::new(
            card.x2 + 0.05 * w,
            (card.y1 - 0.1 * card.height()).max(0.0),
            (card.x2 + 6.5 * w).min(frame.width as f32 - 1.0),
            (card.y2 + 0.1 * card.height()).min(frame.height as f32 - 1.0),
        )
    }

    fn choices_sorted(&self, dets: &[Detection]) -> Vec<Detection> {
        let mut choices: Vec<Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::EventChoice && d.conf >= self.conf_min_choice)
            .cloned()
            .collect();
        choices.sort_by(|a, b| {
            a.bbox
                .y1
                .partial_cmp(&b.bbox.y1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        choices
    }

    fn fallback_click_top(
        &mut self,
        waiter: &mut Waiter,
        choices: &[Detection],
    ) -> anyhow::Result<EventDecision> {
        self.last_clicked = None;
        let Some(top) = choices.first() else {
            info!("[event] No event choice to click.");
            return Ok(EventDecision {
                matched_key_step: None,
                pick: 1,
                clicked: None,
            });
        };
        waiter.click_bbox(top.bbox, 1)?;
        info!("[event] Fallback: clicked top event choice (conf={:.2}).", top.conf);
        Ok(EventDecision {
            matched_key_step: None,
            pick: 1,
            clicked: Some(top.bbox),
        })
    }

    /// Rotate the pick away from options that would push energy over cap.
    fn adjust_for_energy(
        &self,
        rec: &EventRecord,
        pick: u8,
        current_energy: i32,
        energy_cap: i32,
    ) -> u8 {
        let expected_n = rec.expected_options() as u8;
        if expected_n == 0 {
            return pick;
        }
        let overcap_extra = if rec.is_pal_support() {
            PAL_OVERCAP_EXTRA
        } else {
            0
        };

        let candidate_order: Vec<u8> = (0..expected_n)
            .map(|shift| ((pick - 1 + shift) % expected_n) + 1)
            .collect();
        let mut safe: Vec<u8> = Vec::new();
        let mut categories = std::collections::BTreeMap::new();
        for opt in 1..=expected_n {
            let outcomes = rec.options.get(&opt).map(Vec::as_slice).unwrap_or(&[]);
            let gain = max_positive_energy(outcomes);
            if gain <= 0 || current_energy + gain <= energy_cap + overcap_extra {
                safe.push(opt);
            }
            categories.insert(opt, reward_categories(outcomes));
        }

        if safe.contains(&pick) {
            return pick;
        }
        let priority: Vec<RewardCategory> = self.prefs.reward_priority_for(rec);
        match select_candidate_by_priority(&candidate_order, &safe, &categories, &priority) {
            Some((opt, category)) => {
                info!(
                    "[event] pick adjusted for energy: {} -> {} (reason={:?})",
                    pick, opt, category
                );
                opt
            }
            None => pick,
        }
    }

    pub fn process(
        &mut self,
        waiter: &mut Waiter,
        frame: &FrameImage,
        dets: &[Detection],
        current_energy: Option<i32>,
        energy_cap: i32,
    ) -> anyhow::Result<EventDecision> {
        let choices = self.choices_sorted(dets);

        let card = dets
            .iter()
            .filter(|d| d.class == DetClass::EventCard)
            .max_by(|a, b| a.conf.partial_cmp(&b.conf).unwrap_or(std::cmp::Ordering::Equal));
        let chain_count = dets
            .iter()
            .filter(|d| d.class == DetClass::EventChain)
            .count() as u8;
        let chain_step_hint = if chain_count > 0 {
            Some(chain_count)
        } else if card.is_some() {
            Some(1)
        } else {
            None
        };

        let title = match card {
            Some(card) => waiter.ocr_text(frame, Self::banner_roi(&card.bbox, frame)),
            None => {
                // Central horizontal band; less reliable but better than nothing.
                let band = BBox::new(
                    0.10 * frame.width as f32,
                    0.30 * frame.height as f32,
                    0.90 * frame.width as f32,
                    0.55 * frame.height as f32,
                );
                waiter.ocr_text(frame, band)
            }
        };

        let title_lower = title.to_lowercase();
        let kind_hint = if title_lower.contains("support") {
            Some(EventEntityKind::Support)
        } else if title_lower.contains("trainee") {
            Some(EventEntityKind::Trainee)
        } else {
            None
        };

        let mut matched = self
            .catalog
            .find_best(&title, kind_hint, chain_step_hint, MIN_MATCH_SCORE);
        if matched.is_none() && chain_step_hint.map(|s| s > 1).unwrap_or(false) {
            matched = self.catalog.find_best(&title, kind_hint, Some(1), 0.6);
            if matched.is_some() {
                info!("[event] Chain hint fallback succeeded: {:?} -> 1.", chain_step_hint);
            }
        }

        let Some((rec, score)) = matched else {
            warn!("[event] No candidates from catalog; falling back to top option.");
            return self.fallback_click_top(waiter, &choices);
        };
        let rec = rec.clone();

        let expected_n = rec.expected_options();
        if expected_n == 0 {
            warn!("[event] Matched event has no options in catalog; fallback to top.");
            return self.fallback_click_top(waiter, &choices);
        }

        let mut pick = self.prefs.pick_for(&rec);
        if pick as usize > expected_n || pick == 0 {
            warn!(
                "[event] Preference pick={} out of range 1..{}; fallback to top.",
                pick, expected_n
            );
            return self.fallback_click_top(waiter, &choices);
        }

        if self.prefs.should_avoid_energy(&rec) {
            if let Some(energy) = current_energy {
                pick = self.adjust_for_energy(&rec, pick, energy, energy_cap);
            }
        }

        // Two-phase confirmation (accept/reconsider after a >1 pick): the
        // follow-up shows fewer options than the catalog expects; accept.
        if let Some((last_key, last_pick, last_expected)) = &self.last_clicked {
            if *last_key == rec.key_step && choices.len() < *last_expected && *last_pick > 1 {
                info!(
                    "[event] Confirmation phase for '{}': overriding pick {} -> 1.",
                    rec.event_name, pick
                );
                pick = 1;
            }
        }

        if pick as usize > choices.len() {
            warn!(
                "[event] pick={} exceeds detected {} choices; fallback to top.",
                pick,
                choices.len()
            );
            return self.fallback_click_top(waiter, &choices);
        }

        let target = choices[pick as usize - 1].clone();
        waiter.click_bbox(target.bbox, 2)?;
        self.last_clicked = Some((rec.key_step.clone(), pick, expected_n));
        info!(
            "[event] Clicked option #{} for {} (score={:.2}, energy={:?}/{}).",
            pick, rec.key_step, score, current_energy, energy_cap
        );

        Ok(EventDecision {
            matched_key_step: Some(rec.key_step.clone()),
            pick,
            clicked: Some(target.bbox),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::events::{outcome_energy, record, OutcomeRecord};
    use crate::stop::StopFlag;
    use crate::testkit::{det_box, FakeBridge, ScriptedFrame};
    use crate::waiter::PollConfig;
    use std::time::Duration;

    fn fast_cfg() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(0),
            agent: "test".to_string(),
        }
    }

    fn choice_box(i: usize) -> BBox {
        BBox::new(100.0, 100.0 + 80.0 * i as f32, 500.0, 160.0 + 80.0 * i as f32)
    }

    fn event_screen(n_choices: usize, title: &str) -> ScriptedFrame {
        let card = BBox::new(20.0, 40.0, 120.0, 140.0);
        let mut dets = vec![det_box(DetClass::EventCard, card, 0.9)];
        for i in 0..n_choices {
            dets.push(det_box(DetClass::EventChoice, choice_box(i), 0.9));
        }
        let banner = BBox::new(125.0, 30.0, 700.0, 150.0);
        ScriptedFrame::new(dets).with_text(banner, title)
    }

    fn run_flow(
        flow: &mut EventFlow,
        bridge: &FakeBridge,
        frame: ScriptedFrame,
        energy: Option<i32>,
    ) -> EventDecision {
        bridge.push_frame(frame);
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let (img, dets) = waiter.snap("event_test").unwrap();
        flow.process(&mut waiter, &img, &dets, energy, 100).unwrap()
    }

    fn stats_outcome(v: i32) -> OutcomeRecord {
        let mut o = OutcomeRecord::default();
        o.stats.insert(crate::types::StatKey::Spd, v);
        o
    }

    #[test]
    fn explicit_override_is_obeyed() {
        let rec = record(
            EventEntityKind::Trainee,
            "General",
            "Extra Training",
            1,
            vec![
                (1, vec![stats_outcome(10)]),
                (2, vec![outcome_energy(20)]),
            ],
        );
        let mut prefs = EventPrefs::default();
        prefs.overrides.insert(rec.key_step.clone(), 2);
        let mut flow = EventFlow::new(EventCatalog::from_records(vec![rec]), prefs);

        let bridge = FakeBridge::new();
        let decision = run_flow(&mut flow, &bridge, event_screen(2, "Extra Training"), None);
        assert_eq!(decision.pick, 2);
        assert!(bridge.clicked_inside(choice_box(1)));
    }

    #[test]
    fn energy_overflow_rotates_to_safe_option() {
        // Option 1 restores 40 energy; at 80/100 that overflows, so the
        // decider must rotate to the skill-pts option.
        let rec = record(
            EventEntityKind::Support,
            "Blue Ace",
            "A Day Off",
            1,
            vec![
                (1, vec![outcome_energy(40)]),
                (
                    2,
                    vec![OutcomeRecord {
                        skill_pts: 30,
                        ..OutcomeRecord::default()
                    }],
                ),
            ],
        );
        let mut flow = EventFlow::new(
            EventCatalog::from_records(vec![rec]),
            EventPrefs::default(),
        );

        let bridge = FakeBridge::new();
        let decision = run_flow(&mut flow, &bridge, event_screen(2, "A Day Off"), Some(80));
        assert_eq!(decision.pick, 2);
        assert!(bridge.clicked_inside(choice_box(1)));

        // With room below the cap the preferred option stands.
        let bridge2 = FakeBridge::new();
        let mut flow2 = EventFlow::new(
            EventCatalog::from_records(vec![record(
                EventEntityKind::Support,
                "Blue Ace",
                "A Day Off",
                1,
                vec![
                    (1, vec![outcome_energy(40)]),
                    (
                        2,
                        vec![OutcomeRecord {
                            skill_pts: 30,
                            ..OutcomeRecord::default()
                        }],
                    ),
                ],
            )]),
            EventPrefs::default(),
        );
        let decision = run_flow(&mut flow2, &bridge2, event_screen(2, "A Day Off"), Some(30));
        assert_eq!(decision.pick, 1);
    }

    #[test]
    fn confirmation_phase_auto_confirms_accept() {
        let rec = record(
            EventEntityKind::Trainee,
            "General",
            "Acupuncture Session",
            1,
            vec![
                (1, vec![stats_outcome(5)]),
                (2, vec![stats_outcome(20)]),
                (3, vec![OutcomeRecord::default()]),
            ],
        );
        let mut prefs = EventPrefs::default();
        prefs.overrides.insert(rec.key_step.clone(), 2);
        let mut flow = EventFlow::new(EventCatalog::from_records(vec![rec]), prefs);

        let bridge = FakeBridge::new();
        let first = run_flow(
            &mut flow,
            &bridge,
            event_screen(3, "Acupuncture Session"),
            None,
        );
        assert_eq!(first.pick, 2);

        // Follow-up dialog shows only accept/reconsider: auto-confirm.
        let second = run_flow(
            &mut flow,
            &bridge,
            event_screen(2, "Acupuncture Session"),
            None,
        );
        assert_eq!(second.pick, 1);
        assert!(bridge.clicked_inside(choice_box(0)));
    }

    #[test]
    fn unknown_event_falls_back_to_top_choice() {
        let mut flow = EventFlow::new(EventCatalog::from_records(vec![]), EventPrefs::default());
        let bridge = FakeBridge::new();
        let decision = run_flow(&mut flow, &bridge, event_screen(3, "Mystery"), None);
        assert_eq!(decision.pick, 1);
        assert!(bridge.clicked_inside(choice_box(0)));
    }
}
