//! Skills screen automation (Learn view).
//!
//! Scroll-scan the list, match tile titles against the allow list, click BUY
//! for matches the memory does not already hold, then drive the
//! Confirm -> Learn -> Close -> Back chain. The flow reports a tri-state
//! result and never claims success without the UI verified back on Lobby or
//! Raceday.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::catalog::skills::{canonical_skill_name, grade_from_text, SkillMatcher};
use crate::geometry::BBox;
use crate::memory::SkillMemory;
use crate::perception::{
    scene_signature, signatures_nearly_same, DetClass, Detection, FrameImage,
};
use crate::types::SkillGrade;
use crate::waiter::{ClickSpec, SeenSpec, Waiter};

/// BUY detections below this confidence are treated as inactive (greyed).
const ACTIVE_BUY_MIN_CONF: f32 = 0.55;
const EARLY_STOP_PATIENCE: u32 = 3;
const EXIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkillsOutcome {
    Success,
    NoBuy,
    FailedExit(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkillsReport {
    pub outcome: SkillsOutcome,
    pub clicked_any: bool,
    pub exit_recovered: bool,
    pub purchased: Vec<(String, Option<SkillGrade>)>,
}

impl SkillsReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == SkillsOutcome::Success
    }
}

#[derive(Debug)]
pub struct SkillsFlow {
    matcher: SkillMatcher,
    pub max_scrolls: u32,
    pub ocr_threshold: f32,
}

impl SkillsFlow {
    pub fn new(matcher: SkillMatcher) -> Self {
        Self {
            matcher,
            max_scrolls: 15,
            ocr_threshold: 0.75,
        }
    }

    /// Title band inside a skills square: skip the left icon, stop short of
    /// the price column, keep the upper text line.
    fn title_roi(square: &BBox) -> BBox {
        let w = square.width();
        let h = square.height();
        BBox::new(
            square.x1 + 0.10 * w,
            square.y1 + 0.08 * h,
            square.x2 - 0.25 * w,
            square.y1 + 0.38 * h,
        )
    }

    fn find_buy_inside<'a>(square: &BBox, buys: &[&'a Detection]) -> Option<&'a Detection> {
        buys.iter().find(|b| square.contains(&b.bbox, 4.0)).copied()
    }

    pub fn buy(
        &self,
        waiter: &mut Waiter,
        memory: &mut SkillMemory,
        targets: &[String],
        date_key: Option<&str>,
    ) -> anyhow::Result<SkillsReport> {
        if targets.is_empty() {
            info!("[skills] No targets configured.");
            return Ok(SkillsReport {
                outcome: SkillsOutcome::NoBuy,
                clicked_any: false,
                exit_recovered: true,
                purchased: Vec::new(),
            });
        }
        info!("[skills] Buying targets: {}", targets.join(", "));

        // A double-circle listing wants the base grade bought first, so it
        // may take two BUY clicks across passes.
        let mut desired: HashMap<&str, u32> = HashMap::new();
        for t in targets {
            desired.insert(t.as_str(), if t.contains('◎') { 2 } else { 1 });
        }
        let mut purchases: HashMap<&str, u32> = HashMap::new();
        let mut purchased_log: Vec<(String, Option<SkillGrade>)> = Vec::new();

        let mut any_clicked = false;
        let mut prev_sig: Option<Vec<(DetClass, i32, i32)>> = None;
        let mut prev_titles: Option<Vec<String>> = None;
        let mut patience = EARLY_STOP_PATIENCE;

        for pass in 0..self.max_scrolls {
            let (frame, dets) = waiter.snap("skills_scan")?;
            let clicked = self.scan_and_click(
                waiter,
                &frame,
                &dets,
                targets,
                &desired,
                &mut purchases,
                &mut purchased_log,
                memory,
                date_key,
            )?;
            any_clicked |= clicked;

            let sig = scene_signature(&dets);
            let titles = self.visible_titles(waiter, &frame, &dets);
            let same_view = !clicked
                && prev_sig
                    .as_ref()
                    .map(|p| signatures_nearly_same(p, &sig))
                    .unwrap_or(false)
                && prev_titles
                    .as_ref()
                    .map(|p| titles_overlap(p, &titles))
                    .unwrap_or(true);
            if same_view {
                patience -= 1;
                info!("[skills] Early stop (same view twice) patience -1.");
                if patience == 0 {
                    info!("[skills] Early stop buying.");
                    break;
                }
            } else {
                patience = EARLY_STOP_PATIENCE;
            }
            prev_sig = Some(sig);
            prev_titles = Some(titles);

            if targets
                .iter()
                .all(|t| purchases.get(t.as_str()).copied().unwrap_or(0) >= desired[t.as_str()])
            {
                info!("[skills] All target purchase counts satisfied.");
                break;
            }

            if pass + 1 < self.max_scrolls {
                let anchor = (frame.width as f32 * 0.5, frame.height as f32 * 0.6);
                waiter.scroll(anchor, -(frame.height as f32 * 0.25) as i32)?;
                waiter.settle(0.5)?;
            }
        }

        if any_clicked {
            info!("[skills] Confirming purchases...");
            if self.confirm_learn_close_back(waiter)? {
                if self.lobby_or_raceday_visible(waiter)? {
                    return Ok(SkillsReport {
                        outcome: SkillsOutcome::Success,
                        clicked_any: true,
                        exit_recovered: true,
                        purchased: purchased_log,
                    });
                }
                let recovered = self.ensure_exit(waiter, false)?;
                return Ok(SkillsReport {
                    outcome: if recovered {
                        SkillsOutcome::Success
                    } else {
                        SkillsOutcome::FailedExit("exit_unverified")
                    },
                    clicked_any: true,
                    exit_recovered: recovered,
                    purchased: purchased_log,
                });
            }

            warn!("[skills] Confirmation flow failed; attempting recovery before returning control.");
            let recovered = self.ensure_exit(waiter, false)?;
            if !recovered {
                warn!("[skills] Unable to confirm exit after confirmation failure.");
            }
            return Ok(SkillsReport {
                outcome: SkillsOutcome::FailedExit("no_confirm"),
                clicked_any: true,
                exit_recovered: recovered,
                purchased: purchased_log,
            });
        }

        info!("[skills] No matching skills found to buy.");
        let recovered = self.ensure_exit(waiter, true)?;
        if !recovered {
            warn!("[skills] Unable to confirm exit after no-buy flow.");
        }
        Ok(SkillsReport {
            outcome: if recovered {
                SkillsOutcome::NoBuy
            } else {
                SkillsOutcome::FailedExit("no_buy_exit")
            },
            clicked_any: false,
            exit_recovered: recovered,
            purchased: Vec::new(),
        })
    }

    fn visible_titles(
        &self,
        waiter: &mut Waiter,
        frame: &FrameImage,
        dets: &[Detection],
    ) -> Vec<String> {
        let mut titles: Vec<String> = dets
            .iter()
            .filter(|d| d.class == DetClass::SkillsSquare)
            .map(|sq| {
                crate::text::normalize_ocr(&waiter.ocr_text(frame, Self::title_roi(&sq.bbox)))
            })
            .filter(|t| !t.is_empty())
            .collect();
        titles.sort();
        titles
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_and_click<'a>(
        &self,
        waiter: &mut Waiter,
        frame: &FrameImage,
        dets: &[Detection],
        targets: &'a [String],
        desired: &HashMap<&'a str, u32>,
        purchases: &mut HashMap<&'a str, u32>,
        purchased_log: &mut Vec<(String, Option<SkillGrade>)>,
        memory: &mut SkillMemory,
        date_key: Option<&str>,
    ) -> anyhow::Result<bool> {
        let squares: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::SkillsSquare)
            .collect();
        let buys: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::SkillsBuy)
            .collect();

        let mut clicked_any = false;
        for sq in squares {
            let Some(buy) = Self::find_buy_inside(&sq.bbox, &buys) else {
                continue;
            };
            if buy.conf < ACTIVE_BUY_MIN_CONF {
                // Greyed-out BUY: owned at this grade or not affordable.
                continue;
            }

            let raw_title = waiter.ocr_text(frame, Self::title_roi(&sq.bbox));
            let fixed = crate::text::fix_common_ocr_confusions(&raw_title);
            let title_norm = crate::text::normalize_ocr(&fixed);
            if title_norm.is_empty() {
                continue;
            }

            let mut best: Option<(&String, f32)> = None;
            for target in targets {
                let eval = self.matcher.evaluate(&title_norm, target, self.ocr_threshold);
                if eval.ok && best.map(|(_, s)| eval.score > s).unwrap_or(true) {
                    best = Some((target, eval.score));
                }
            }
            let Some((target, score)) = best else {
                continue;
            };

            let grade = grade_from_text(target).or_else(|| grade_from_text(&raw_title));
            let canonical = canonical_skill_name(target);
            memory.record_seen(&canonical, grade, date_key);

            if purchases.get(target.as_str()).copied().unwrap_or(0)
                >= desired.get(target.as_str()).copied().unwrap_or(1)
            {
                continue;
            }
            if memory.is_purchased(&canonical, grade) {
                info!(
                    "[skills] skipping '{}' grade={:?} (already purchased)",
                    target, grade
                );
                continue;
            }

            // Click slightly above center to counter scroll inertia.
            let dy = (buy.bbox.height() * 0.05).max(2.0);
            waiter.click_bbox(buy.bbox.shifted(0.0, -dy), 1)?;
            *purchases.entry(target.as_str()).or_insert(0) += 1;
            memory.mark_purchased(&canonical, grade, date_key);
            purchased_log.push((canonical.clone(), grade));
            info!(
                "[skills] Clicked BUY for '{}' (score={:.2}) [{}/{}]",
                target,
                score,
                purchases[target.as_str()],
                desired.get(target.as_str()).copied().unwrap_or(1)
            );
            clicked_any = true;
        }
        Ok(clicked_any)
    }

    /// Confirm -> Learn -> Close -> Back, each step within its own timeout.
    fn confirm_learn_close_back(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        let confirm = ClickSpec::new(&[DetClass::ButtonGreen], "skills_flow_confirm")
            .texts(&["CONFIRM"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.75));
        if waiter.click_when(&confirm)?.is_none() {
            warn!("[skills] Confirm button not found");
            return Ok(false);
        }
        waiter.settle(1.2)?;

        let learn = ClickSpec::new(&[DetClass::ButtonGreen], "skills_flow_learn")
            .texts(&["LEARN"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.3));
        if waiter.click_when(&learn)?.is_none() {
            warn!("[skills] Learn button not found");
            return Ok(false);
        }
        waiter.settle(2.4)?;

        let close = ClickSpec::new(&[DetClass::ButtonWhite], "skills_flow_close")
            .texts(&["CLOSE"])
            .no_greedy()
            .timeout(waiter.fraction_timeout(0.5));
        if waiter.click_when(&close)?.is_none() {
            warn!("[skills] Close button not found");
            return Ok(false);
        }
        waiter.settle(1.2)?;

        let back = ClickSpec::new(&[DetClass::ButtonWhite], "skills_back")
            .texts(&["BACK"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.3));
        if waiter.click_when(&back)?.is_none() {
            warn!("[skills] Back button not found");
            return Ok(false);
        }
        Ok(true)
    }

    fn lobby_or_raceday_visible(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        if waiter.seen(&SeenSpec::new(
            &[DetClass::LobbyRaces, DetClass::RaceRaceDay],
            "skills_exit_seen_lobby",
        ))? {
            return Ok(true);
        }
        waiter.seen(
            &SeenSpec::new(&[DetClass::ButtonGreen], "skills_exit_seen_green")
                .texts(&["RACE", "NEXT"])
                .threshold(0.5),
        )
    }

    /// Bounded recovery: press BACK (and CLOSE/OK when allowed) until the
    /// Lobby or Raceday markers reappear.
    fn ensure_exit(&self, waiter: &mut Waiter, prefer_back_only: bool) -> anyhow::Result<bool> {
        let mut attempts: Vec<(Vec<DetClass>, Vec<&str>)> =
            vec![(vec![DetClass::ButtonWhite], vec!["BACK"])];
        if !prefer_back_only {
            attempts.push((vec![DetClass::ButtonWhite], vec!["CLOSE"]));
            attempts.push((vec![DetClass::ButtonGreen], vec!["OK", "NEXT", "PROCEED"]));
        }

        for _ in 0..EXIT_ATTEMPTS {
            for (classes, texts) in &attempts {
                let spec = ClickSpec::new(classes, "skills_flow_exit")
                    .texts(texts)
                    .prefer_bottom()
                    .no_greedy()
                    .timeout(waiter.fraction_timeout(0.4));
                if waiter.click_when(&spec)?.is_some() {
                    waiter.settle(0.8)?;
                    if self.lobby_or_raceday_visible(waiter)? {
                        return Ok(true);
                    }
                }
            }
        }
        self.lobby_or_raceday_visible(waiter)
    }
}

fn titles_overlap(a: &[String], b: &[String]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    let matched = a.iter().filter(|t| b.contains(t)).count();
    matched >= 2 && matched * 10 >= a.len() * 6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::skills::SkillCatalog;
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

    fn flow() -> SkillsFlow {
        let mut f = SkillsFlow::new(SkillMatcher::new(SkillCatalog::default()));
        f.max_scrolls = 1;
        f
    }

    fn square_at(y: f32) -> BBox {
        BBox::new(100.0, y, 600.0, y + 100.0)
    }

    fn buy_in(square: &BBox) -> BBox {
        BBox::new(square.x2 - 90.0, square.y1 + 30.0, square.x2 - 10.0, square.y1 + 70.0)
    }

    /// Skills screen with the given (title, buy-active) tiles and a BACK
    /// button at the bottom.
    fn skills_screen(tiles: &[(&str, bool)]) -> ScriptedFrame {
        let mut dets = Vec::new();
        let mut frame = ScriptedFrame::default();
        for (i, (title, active)) in tiles.iter().enumerate() {
            let sq = square_at(80.0 + 130.0 * i as f32);
            let buy = buy_in(&sq);
            dets.push(det_box(DetClass::SkillsSquare, sq, 0.9));
            dets.push(det_box(
                DetClass::SkillsBuy,
                buy,
                if *active { 0.9 } else { 0.3 },
            ));
            frame = frame.with_text(SkillsFlow::title_roi(&sq), title);
        }
        let back = BBox::new(80.0, 640.0, 220.0, 690.0);
        dets.push(det_box(DetClass::ButtonWhite, back, 0.9));
        frame.detections = dets;
        frame.with_text(back, "BACK")
    }

    fn button_screen(class: DetClass, text: &str) -> ScriptedFrame {
        let bbox = BBox::new(400.0, 500.0, 600.0, 560.0);
        ScriptedFrame::new(vec![det_box(class, bbox, 0.9)]).with_text(bbox, text)
    }

    fn raceday_screen() -> ScriptedFrame {
        ScriptedFrame::new(vec![det_box(
            DetClass::RaceRaceDay,
            BBox::new(500.0, 300.0, 700.0, 400.0),
            0.9,
        )])
    }

    #[test]
    fn no_match_exits_back_and_reports_no_buy() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(skills_screen(&[("Groundwork", true)]));
        bridge.push_frame(raceday_screen());

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let mut memory = SkillMemory::ephemeral("ura");
        let report = flow().buy(
            &mut waiter,
            &mut memory,
            &["Concentration ◎".to_string()],
            None,
        )?;

        assert_eq!(report.outcome, SkillsOutcome::NoBuy);
        assert!(!report.clicked_any);
        assert!(report.exit_recovered);
        assert!(!memory.has_any_grade("Concentration"));
        Ok(())
    }

    #[test]
    fn buy_then_confirm_chain_succeeds_and_records_memory() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(skills_screen(&[
            ("Concentration ◎", true),
            ("Focus ○", true),
        ]));
        bridge.push_frame(button_screen(DetClass::ButtonGreen, "CONFIRM"));
        bridge.push_frame(button_screen(DetClass::ButtonGreen, "LEARN"));
        bridge.push_frame(button_screen(DetClass::ButtonWhite, "CLOSE"));
        bridge.push_frame(button_screen(DetClass::ButtonWhite, "BACK"));
        bridge.push_frame(raceday_screen());

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let mut memory = SkillMemory::ephemeral("ura");
        let report = flow().buy(
            &mut waiter,
            &mut memory,
            &["Concentration ◎".to_string(), "Focus ○".to_string()],
            Some("Y2-06-1"),
        )?;

        assert_eq!(report.outcome, SkillsOutcome::Success);
        assert!(report.clicked_any);
        assert_eq!(report.purchased.len(), 2);
        assert!(memory.is_purchased("Concentration", Some(SkillGrade::Double)));
        assert!(memory.is_purchased("Focus", Some(SkillGrade::Single)));
        Ok(())
    }

    #[test]
    fn missing_confirm_fails_but_recovers() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(skills_screen(&[("Focus ○", true)]));
        // After BUY the shop stays put; Confirm never appears. Recovery taps
        // BACK and lands on Raceday markers.
        bridge.push_frame(button_screen(DetClass::ButtonWhite, "BACK"));
        bridge.push_frame(raceday_screen());

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let mut memory = SkillMemory::ephemeral("ura");
        let report = flow().buy(&mut waiter, &mut memory, &["Focus ○".to_string()], None)?;

        assert_eq!(report.outcome, SkillsOutcome::FailedExit("no_confirm"));
        assert!(report.clicked_any);
        assert!(report.exit_recovered);
        Ok(())
    }

    #[test]
    fn owned_grade_is_not_rebought() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(skills_screen(&[("Focus ○", true)]));
        bridge.push_frame(raceday_screen());

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let mut memory = SkillMemory::ephemeral("ura");
        memory.mark_purchased("Focus", Some(SkillGrade::Single), None);
        let clicks_before = bridge.click_count();

        let report = flow().buy(&mut waiter, &mut memory, &["Focus ○".to_string()], None)?;
        assert_eq!(report.outcome, SkillsOutcome::NoBuy);
        // Only the exit BACK click, no BUY click.
        assert_eq!(bridge.click_count(), clicks_before + 1);
        Ok(())
    }

    #[test]
    fn inactive_buy_button_is_ignored() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(skills_screen(&[("Focus ○", false)]));
        bridge.push_frame(raceday_screen());

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let mut memory = SkillMemory::ephemeral("ura");
        let report = flow().buy(&mut waiter, &mut memory, &["Focus ○".to_string()], None)?;
        assert_eq!(report.outcome, SkillsOutcome::NoBuy);
        assert!(!memory.has_any_grade("Focus"));
        Ok(())
    }
}
