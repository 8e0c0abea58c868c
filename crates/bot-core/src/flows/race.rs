//! Race-day state machine.
//!
//! EnsureRaceday -> PickRaceSquare -> ClickRaceButton -> PreLobbyGate ->
//! SetStrategy -> RunRace -> PostRaceLobby -> LossRetry. Soft failures come
//! back as outcome values; the caller backs out to the Lobby and sets skip
//! guards.

use tracing::{debug, info, warn};

use crate::catalog::races::{RaceIndex, RaceRank};
use crate::geometry::BBox;
use crate::perception::{DetClass, Detection, FrameImage};
use crate::text::{fuzzy_ratio, normalize_ocr};
use crate::types::Style;
use crate::waiter::{ClickSpec, SeenSpec, Waiter};

const MIN_STARS: usize = 2;
const MINIMUM_RACE_OCR_MATCH: f32 = 0.91;
const BADGE_MISMATCH_PENALTY: f32 = 0.20;
/// Stand-in for the active-button classifier: a View Results detection below
/// this confidence is treated as not-ready.
const ACTIVE_VIEW_MIN_CONF: f32 = 0.51;
const LOSS_PROBE_THRESHOLD: f32 = 0.62;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    Ok,
    NoRaceFound,
    NoPlannedMatch,
    ButtonsMissing,
    ConsecutiveRaceRefused,
    LossLoop,
}

impl RaceOutcome {
    pub fn is_soft_fail(&self) -> bool {
        !matches!(self, RaceOutcome::Ok)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RaceArgs {
    pub prioritize_g1: bool,
    pub is_g1_goal: bool,
    pub desired_race: Option<String>,
    pub date_key: Option<String>,
    pub style: Option<Style>,
    /// Invoked from inside Raceday: the consecutive-race penalty is always
    /// accepted because there is no other way forward.
    pub from_raceday: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct RaceCounters {
    pub loss_indicators: u32,
    pub retry_clicks: u32,
    pub retry_skipped: u32,
    pub wins_or_no_loss: u32,
}

#[derive(Debug)]
pub struct RaceFlow {
    race_index: RaceIndex,
    pub accept_consecutive_race: bool,
    pub try_again_on_failed_goal: bool,
    pub max_loss_retries: u32,
    pub max_scrolls: u32,
    pub counters: RaceCounters,
}

enum EnsureOutcome {
    InRaceday,
    Refused,
    Failed,
}

impl RaceFlow {
    pub fn new(race_index: RaceIndex) -> Self {
        Self {
            race_index,
            accept_consecutive_race: true,
            try_again_on_failed_goal: true,
            max_loss_retries: 1,
            max_scrolls: 3,
            counters: RaceCounters::default(),
        }
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    pub fn run(&mut self, waiter: &mut Waiter, args: &RaceArgs) -> anyhow::Result<RaceOutcome> {
        info!(
            "[race] RaceDay begin (prioritize_g1={}, is_g1_goal={}) reason='{}'",
            args.prioritize_g1, args.is_g1_goal, args.reason
        );
        match self.ensure_in_raceday(waiter, args)? {
            EnsureOutcome::InRaceday => {}
            EnsureOutcome::Refused => return Ok(RaceOutcome::ConsecutiveRaceRefused),
            EnsureOutcome::Failed => return Ok(RaceOutcome::NoRaceFound),
        }
        waiter.settle(1.0)?;

        let square = self.pick_race_square(waiter, args)?;
        let Some(square) = square else {
            if args.desired_race.is_some() {
                return Ok(RaceOutcome::NoPlannedMatch);
            }
            debug!("[race] race square not found");
            return Ok(RaceOutcome::NoRaceFound);
        };

        waiter.click_bbox(square.bbox, 1)?;
        waiter.settle(0.8)?;
        info!("[race] Clicked race square");

        // Green RACE on the list, then the confirmation popup.
        let list_race = ClickSpec::new(&[DetClass::ButtonGreen], "race_list_race")
            .texts(&["RACE"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.5));
        if waiter.click_when(&list_race)?.is_none() {
            warn!("[race] couldn't find green 'Race' button (list).");
            return Ok(RaceOutcome::NoRaceFound);
        }
        waiter.settle(1.2)?;
        let popup = ClickSpec::new(&[DetClass::ButtonGreen], "race_popup_confirm_try")
            .texts(&["RACE"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.3));
        if waiter.click_when(&popup)?.is_some() {
            info!("[race] Clicked green 'Race' button (popup) confirmation");
        }

        // Pre-lobby gate: the strategy-change affordance marks the pre-race
        // lobby; without it the later buttons cannot exist either.
        if !self.wait_pre_lobby(waiter)? {
            return Ok(RaceOutcome::ButtonsMissing);
        }

        if let Some(style) = args.style {
            if !self.set_strategy(waiter, style)? {
                warn!("[race] could not apply strategy {}", style.label());
            }
        }

        self.finish(waiter, args)
    }

    /// Post-race handling, including the loss-retry loop. Public so the
    /// Raceday handler can drive an already-running race to completion.
    pub fn finish(&mut self, waiter: &mut Waiter, args: &RaceArgs) -> anyhow::Result<RaceOutcome> {
        let goal_race = args.from_raceday || args.is_g1_goal;
        let mut attempt = 0u32;
        loop {
            if !self.drive_race_to_results(waiter)? {
                return Ok(RaceOutcome::ButtonsMissing);
            }

            let loss_seen = waiter.seen(
                &SeenSpec::new(&[DetClass::ButtonGreen], "race_try_again_probe")
                    .texts(&["TRY AGAIN"])
                    .threshold(LOSS_PROBE_THRESHOLD),
            )?;
            if !loss_seen {
                self.counters.wins_or_no_loss += 1;
                return self.leave_results(waiter);
            }

            self.counters.loss_indicators += 1;
            info!(
                "[race] Loss indicator detected (toggle={}) | counters={:?}",
                self.try_again_on_failed_goal, self.counters
            );

            if self.try_again_on_failed_goal && goal_race {
                if attempt >= self.max_loss_retries {
                    warn!("[race] loss retry bound reached | counters={:?}", self.counters);
                    return Ok(RaceOutcome::LossLoop);
                }
                if self.click_try_again(waiter)? {
                    attempt += 1;
                    self.retry_transition(waiter)?;
                    continue;
                }
                // Loss without a clickable retry: fall through and continue.
                self.counters.retry_skipped += 1;
                return self.leave_results(waiter);
            }

            self.counters.retry_skipped += 1;
            info!(
                "[race] Retry disabled despite loss indicator | counters={:?}",
                self.counters
            );
            return self.leave_results(waiter);
        }
    }

    // ------------------------------------------------------------------
    // EnsureRaceday
    // ------------------------------------------------------------------

    fn ensure_in_raceday(
        &mut self,
        waiter: &mut Waiter,
        args: &RaceArgs,
    ) -> anyhow::Result<EnsureOutcome> {
        // Quick probe: already inside?
        if waiter.seen(&SeenSpec::new(&[DetClass::RaceSquare], "race_nav_probe"))? {
            return Ok(EnsureOutcome::InRaceday);
        }

        let enter = ClickSpec::new(
            &[DetClass::LobbyRaces, DetClass::RaceRaceDay],
            "race_nav_from_lobby",
        )
        .prefer_bottom()
        .timeout(waiter.fraction_timeout(0.6));
        if waiter.click_when(&enter)?.is_none() {
            return Ok(EnsureOutcome::Failed);
        }
        debug!("[race] Clicked 'RACES'. Probing for squares vs penalty popup");

        let deadline = std::time::Instant::now() + waiter.fraction_timeout(0.55);
        loop {
            if waiter.seen(&SeenSpec::new(&[DetClass::RaceSquare], "race_nav_seen_squares"))? {
                return Ok(EnsureOutcome::InRaceday);
            }
            if waiter.seen(
                &SeenSpec::new(&[DetClass::ButtonGreen], "race_nav_penalty_seen").texts(&["OK"]),
            )? {
                if !self.accept_consecutive_race && !args.from_raceday {
                    info!("[race] Consecutive race detected and refused by settings.");
                    return Ok(EnsureOutcome::Refused);
                }
                let ok = ClickSpec::new(&[DetClass::ButtonGreen], "race_nav_penalty_ok_click")
                    .texts(&["OK"])
                    .no_greedy()
                    .timeout(waiter.fraction_timeout(0.1));
                waiter.click_when(&ok)?;
                debug!("[race] Consecutive race. Accepted penalization per settings.");
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            waiter.settle(0.5)?;
        }
        if waiter.seen(&SeenSpec::new(&[DetClass::RaceSquare], "race_nav_seen_final"))? {
            return Ok(EnsureOutcome::InRaceday);
        }
        Ok(EnsureOutcome::Failed)
    }

    // ------------------------------------------------------------------
    // PickRaceSquare
    // ------------------------------------------------------------------

    fn clean_race_title(text: &str) -> String {
        let mut cleaned = normalize_ocr(text)
            .replace("turt", "turf")
            .replace("dirf", "dirt");
        for noise in ["right", "left", "inner", "outer"] {
            cleaned = cleaned.replace(noise, " ");
        }
        cleaned
            .split_whitespace()
            .filter(|w| w.len() > 1)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Duplicate star boxes from the detector are collapsed by overlap.
    fn dedupe_stars(stars: Vec<&Detection>) -> Vec<&Detection> {
        let mut sorted = stars;
        sorted.sort_by(|a, b| b.conf.partial_cmp(&a.conf).unwrap_or(std::cmp::Ordering::Equal));
        let mut keep: Vec<&Detection> = Vec::new();
        for star in sorted {
            let dup = keep
                .iter()
                .any(|k| star.bbox.overlap_ratio(&k.bbox) > 0.5);
            if !dup {
                keep.push(star);
            }
        }
        keep
    }

    fn badge_rank(&self, waiter: &mut Waiter, frame: &FrameImage, badge: &Detection) -> Option<RaceRank> {
        let label = waiter.ocr_text(frame, badge.bbox);
        RaceRank::parse_label(&label)
    }

    fn pick_race_square(
        &mut self,
        waiter: &mut Waiter,
        args: &RaceArgs,
    ) -> anyhow::Result<Option<Detection>> {
        // Expected card titles for the planned race, rank attached when the
        // date binds it.
        let mut expected: Vec<(String, Option<RaceRank>)> = Vec::new();
        if let Some(desired) = args.desired_race.as_deref() {
            if let Some(date_key) = args.date_key.as_deref() {
                if let Some(e) = self.race_index.entry_for_name_on_date(desired, date_key) {
                    info!(
                        "[race] Seeking '{}' on {} -> title='{}' rank={:?}",
                        desired,
                        date_key,
                        e.title_for_matching(),
                        e.rank
                    );
                    expected.push((e.title_for_matching().to_string(), Some(e.rank)));
                }
            }
            if expected.is_empty() {
                for (title, rank) in self.race_index.expected_titles_for_race(desired) {
                    expected.push((title, Some(rank)));
                }
            }
            if expected.is_empty() {
                warn!(
                    "[race] Dataset has no entries for '{}'; falling back to literal name.",
                    desired
                );
                expected.push((desired.to_string(), None));
            }
        }

        let mut best_recommended: Option<(Detection, u8, f32)> = None; // det, rank prio, y

        for scroll_j in 0..=self.max_scrolls {
            waiter.settle(1.0)?;
            let (frame, dets) = waiter.snap("race_pick")?;
            let mut squares: Vec<&Detection> = dets
                .iter()
                .filter(|d| d.class == DetClass::RaceSquare)
                .collect();
            squares.sort_by(|a, b| {
                a.bbox
                    .center_y()
                    .partial_cmp(&b.bbox.center_y())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            if squares.is_empty() {
                if scroll_j < self.max_scrolls {
                    self.scroll_race_list(waiter, &frame)?;
                }
                continue;
            }

            let stars = Self::dedupe_stars(
                dets.iter()
                    .filter(|d| d.class == DetClass::RaceStar)
                    .collect(),
            );
            let badges: Vec<&Detection> = dets
                .iter()
                .filter(|d| d.class == DetClass::RaceBadge)
                .collect();

            if !expected.is_empty() {
                // One-way forward search for the planned title.
                let mut page_best: Option<(Detection, f32)> = None;
                for sq in &squares {
                    let raw = waiter.ocr_text(&frame, sq.bbox);
                    let title = Self::clean_race_title(&raw);
                    if title.is_empty() {
                        continue;
                    }
                    let badge = badges
                        .iter()
                        .find(|b| sq.bbox.contains(&b.bbox, 3.0))
                        .and_then(|b| self.badge_rank(waiter, &frame, b));
                    let mut score = 0.0f32;
                    for (exp_title, exp_rank) in &expected {
                        let mut s = fuzzy_ratio(&title, &Self::clean_race_title(exp_title));
                        if let (Some(exp), Some(got)) = (exp_rank, badge) {
                            if *exp != got {
                                s -= BADGE_MISMATCH_PENALTY;
                            }
                        }
                        score = score.max(s);
                    }
                    if page_best
                        .as_ref()
                        .map(|(_, s)| score > *s)
                        .unwrap_or(true)
                    {
                        page_best = Some(((*sq).clone(), score));
                    }
                }
                if let Some((sq, score)) = page_best {
                    if score >= MINIMUM_RACE_OCR_MATCH {
                        info!(
                            "[race] picked desired '{}' by card title (score={:.2})",
                            args.desired_race.as_deref().unwrap_or("?"),
                            score
                        );
                        return Ok(Some(sq));
                    }
                    debug!("[race] best title score {:.2} below floor", score);
                }
            } else {
                for sq in &squares {
                    let star_count = stars
                        .iter()
                        .filter(|st| sq.bbox.contains(&st.bbox, 1.0))
                        .count();
                    if star_count < MIN_STARS {
                        debug!("[race] not enough stars: {}", star_count);
                        continue;
                    }
                    let rank = badges
                        .iter()
                        .find(|b| sq.bbox.contains(&b.bbox, 3.0))
                        .and_then(|b| self.badge_rank(waiter, &frame, b));
                    let prio = rank.map(|r| r.priority()).unwrap_or(0);
                    let y = sq.bbox.center_y();

                    if (args.prioritize_g1 || args.is_g1_goal) && rank == Some(RaceRank::G1) {
                        info!("[race] picked G1 with {}* at y={:.1}", star_count, y);
                        return Ok(Some((*sq).clone()));
                    }
                    if args.is_g1_goal {
                        continue;
                    }
                    let better = best_recommended
                        .as_ref()
                        .map(|(_, bp, by)| prio > *bp || (prio == *bp && y < *by))
                        .unwrap_or(true);
                    if better {
                        best_recommended = Some(((*sq).clone(), prio, y));
                    }
                }
                if let Some((det, prio, _)) = &best_recommended {
                    if scroll_j == self.max_scrolls || *prio >= RaceRank::G1.priority() {
                        info!("[race] Picked best race found, rank priority={}", prio);
                        return Ok(Some(det.clone()));
                    }
                }
            }

            if scroll_j < self.max_scrolls {
                self.scroll_race_list(waiter, &frame)?;
            }
        }

        Ok(best_recommended.map(|(det, _, _)| det))
    }

    fn scroll_race_list(&self, waiter: &mut Waiter, frame: &FrameImage) -> anyhow::Result<()> {
        let anchor = (frame.width as f32 * 0.5, frame.height as f32 * 0.55);
        waiter.scroll(anchor, -(frame.height as f32 * 0.2) as i32)?;
        waiter.settle(1.4)
    }

    // ------------------------------------------------------------------
    // PreLobbyGate / SetStrategy
    // ------------------------------------------------------------------

    fn wait_pre_lobby(&self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        info!("[race] Waiting for race lobby to appear");
        let deadline = std::time::Instant::now() + waiter.fraction_timeout(3.5);
        loop {
            if waiter.seen(&SeenSpec::new(&[DetClass::ButtonChange], "race_pre_lobby_gate"))? {
                return Ok(true);
            }
            if std::time::Instant::now() >= deadline {
                warn!("[race] pre-race lobby not reached (button_change missing)");
                return Ok(false);
            }
            waiter.settle(0.6)?;
        }
    }

    /// Pick a running style inside the Change Strategy modal, then confirm.
    pub fn set_strategy(&self, waiter: &mut Waiter, style: Style) -> anyhow::Result<bool> {
        let change = ClickSpec::new(&[DetClass::ButtonChange], "race_style_change")
            .timeout(waiter.fraction_timeout(0.5));
        if waiter.click_when(&change)?.is_none() {
            return Ok(false);
        }
        waiter.settle(2.0)?;

        let (frame, dets) = waiter.snap("change_style_modal")?;
        let mut whites: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::ButtonWhite)
            .collect();
        if whites.is_empty() {
            warn!("[race] set_strategy: no white buttons detected.");
            return Ok(false);
        }

        // Cancel is the bottom-most white; style buttons sit above it.
        whites.sort_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let cancel_y = whites.last().map(|d| d.bbox.center_y()).unwrap_or(0.0);
        let mut style_btns: Vec<&Detection> = whites
            .iter()
            .copied()
            .filter(|d| d.bbox.center_y() < cancel_y - 10.0)
            .collect();
        if style_btns.is_empty() {
            style_btns = whites[..whites.len().saturating_sub(1)].to_vec();
        }
        style_btns.sort_by(|a, b| {
            a.bbox
                .center()
                .0
                .partial_cmp(&b.bbox.center().0)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if style_btns.is_empty() {
            return Ok(false);
        }

        // Expected layout left->right is End, Late, Pace, Front; OCR rescues
        // partial layouts.
        let chosen = if style_btns.len() >= 4 {
            style_btns[style.modal_index().min(style_btns.len() - 1)]
        } else {
            let mut best: Option<(&Detection, f32)> = None;
            for &b in &style_btns {
                let label = waiter.ocr_text(&frame, b.bbox);
                let score = fuzzy_ratio(&normalize_ocr(&label), style.label());
                if best.map(|(_, s)| score > s).unwrap_or(true) {
                    best = Some((b, score));
                }
            }
            match best {
                Some((b, s)) if s >= 0.45 => b,
                _ => style_btns[style.modal_index().min(style_btns.len() - 1)],
            }
        };
        waiter.click_bbox(chosen.bbox, 1)?;
        waiter.settle(0.6)?;

        let greens: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::ButtonGreen)
            .collect();
        if let Some(confirm) = greens.iter().max_by(|a, b| {
            a.bbox
                .center_y()
                .partial_cmp(&b.bbox.center_y())
                .unwrap_or(std::cmp::Ordering::Equal)
        }) {
            waiter.click_bbox(confirm.bbox, 1)?;
            waiter.settle(0.6)?;
            return Ok(true);
        }
        let confirm = ClickSpec::new(&[DetClass::ButtonGreen], "race_style_confirm_text")
            .texts(&["CONFIRM"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(0.5));
        Ok(waiter.click_when(&confirm)?.is_some())
    }

    // ------------------------------------------------------------------
    // RunRace / PostRaceLobby / LossRetry
    // ------------------------------------------------------------------

    /// Drive the UI until race results are on screen. Returns false when the
    /// required buttons never appear.
    fn drive_race_to_results(&mut self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        if let Some(view) = self.pick_view_results(waiter)? {
            // Tap View Results a couple of times to clear residual screens.
            waiter.click_bbox(view, 2)?;
            waiter.settle(3.0)?;
            waiter.click_bbox(view, 2)?;
            waiter.settle(1.0)?;
            return Ok(true);
        }

        // Not watched yet: confirm the race start and skip through it.
        let race = ClickSpec::new(&[DetClass::ButtonGreen], "race_lobby_race_click")
            .texts(&["RACE"])
            .prefer_bottom()
            .timeout(waiter.fraction_timeout(1.5));
        if waiter.click_when(&race)?.is_none() {
            warn!("[race] Race button not found. Cannot determine lobby state.");
            return Ok(false);
        }
        waiter.settle(2.0)?;

        // Reactive confirmation until the skip buttons show up.
        let deadline = std::time::Instant::now() + waiter.fraction_timeout(3.0);
        loop {
            if waiter.seen(&SeenSpec::new(&[DetClass::ButtonSkip], "race_lobby_seen_skip"))? {
                break;
            }
            let confirm = ClickSpec::new(&[DetClass::ButtonGreen], "race_lobby_race_confirm_try")
                .texts(&["RACE", "NEXT"])
                .prefer_bottom()
                .timeout(waiter.fraction_timeout(0.1));
            waiter.click_when(&confirm)?;
            if std::time::Instant::now() >= deadline {
                break;
            }
            waiter.settle(1.0)?;
        }

        // Greedy skip; stop as soon as CLOSE lands or a green button shows.
        debug!("[race] Starting skip loop");
        let mut skip_clicks = 0u32;
        let deadline = std::time::Instant::now() + waiter.fraction_timeout(3.0);
        loop {
            let close = ClickSpec::new(&[DetClass::ButtonWhite], "race_trophy_try_close")
                .texts(&["CLOSE"])
                .no_greedy()
                .timeout(waiter.fraction_timeout(0.1));
            if waiter.click_when(&close)?.is_some() {
                debug!("[race] Clicked close trophy button");
                break;
            }
            if skip_clicks > 2
                && waiter.seen(
                    &SeenSpec::new(&[DetClass::ButtonGreen], "race_skip_probe_next")
                        .conf_min(0.65),
                )?
            {
                break;
            }
            let skip = ClickSpec::new(&[DetClass::ButtonSkip], "race_skip_try")
                .prefer_bottom()
                .clicks(3)
                .timeout(waiter.fraction_timeout(0.25));
            if waiter.click_when(&skip)?.is_some() {
                skip_clicks += 1;
                continue;
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
            waiter.settle(0.5)?;
        }
        Ok(true)
    }

    /// Among white buttons, the one whose OCR best matches "VIEW RESULTS",
    /// provided its detection is confident enough to be an active button.
    fn pick_view_results(&self, waiter: &mut Waiter) -> anyhow::Result<Option<BBox>> {
        let (frame, dets) = waiter.snap("race_view_btn")?;
        let whites: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::ButtonWhite)
            .collect();
        let mut best: Option<(&Detection, f32)> = None;
        for &d in &whites {
            let txt = waiter.ocr_text(&frame, d.bbox);
            let score = fuzzy_ratio(&normalize_ocr(&txt), "view results");
            if score > 0.5 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((d, score));
            }
        }
        match best {
            Some((d, _)) if d.conf >= ACTIVE_VIEW_MIN_CONF => Ok(Some(d.bbox)),
            Some(_) => {
                debug!("[race] View Results present but inactive; results not ready");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn click_try_again(&mut self, waiter: &mut Waiter) -> anyhow::Result<bool> {
        let spec = ClickSpec::new(&[DetClass::ButtonGreen], "race_try_again_try")
            .texts(&["TRY AGAIN"])
            .no_greedy()
            .forbid(&["RACE", "NEXT"])
            .timeout(waiter.fraction_timeout(0.5));
        if let Some(det) = waiter.click_when(&spec)? {
            self.counters.retry_clicks += 1;
            info!(
                "[race] TRY AGAIN clicked (y_center={:.1}) | counters={:?}",
                det.bbox.center_y(),
                self.counters
            );
            return Ok(true);
        }
        info!(
            "[race] TRY AGAIN not clicked before timeout | counters={:?}",
            self.counters
        );
        Ok(false)
    }

    /// Clear alarm-clock confirmations and wait until race buttons reappear.
    fn retry_transition(&self, waiter: &mut Waiter) -> anyhow::Result<()> {
        debug!("[race] Handling retry transition interstitials.");
        let deadline = std::time::Instant::now() + waiter.fraction_timeout(2.5);
        loop {
            let confirm = ClickSpec::new(&[DetClass::ButtonGreen], "race_try_again_confirm")
                .texts(&["USE", "USE ITEM", "TRY AGAIN", "RACE", "YES", "OK", "CONFIRM"])
                .no_greedy()
                .forbid(&["NEXT"]);
            if waiter.try_click_once(&confirm)?.is_some() {
                debug!("[race] Clicked retry interstitial confirmation.");
                waiter.settle(1.8)?;
            } else {
                if waiter.seen(
                    &SeenSpec::new(&[DetClass::ButtonWhite], "race_retry_view_results_ready")
                        .texts(&["VIEW RESULTS"]),
                )? {
                    debug!("[race] View Results ready after retry.");
                    return Ok(());
                }
                if waiter.seen(
                    &SeenSpec::new(&[DetClass::ButtonGreen], "race_retry_race_ready")
                        .texts(&["RACE"]),
                )? {
                    debug!("[race] Race button ready after retry.");
                    return Ok(());
                }
                waiter.settle(1.4)?;
            }
            if std::time::Instant::now() >= deadline {
                warn!("[race] Retry transition timed out; continuing anyway.");
                return Ok(());
            }
        }
    }

    /// Continue-without-retry path: NEXT chain, then the special
    /// after-race button.
    fn leave_results(&mut self, waiter: &mut Waiter) -> anyhow::Result<RaceOutcome> {
        let next = ClickSpec::new(&[DetClass::ButtonGreen], "race_after_flow_next")
            .texts(&["NEXT"])
            .forbid(&["TRY AGAIN"])
            .no_greedy()
            .clicks(3)
            .timeout(waiter.fraction_timeout(1.15));
        waiter.click_when(&next)?;

        let after = ClickSpec::new(&[DetClass::RaceAfterNext], "race_after")
            .texts(&["NEXT"])
            .prefer_bottom()
            .clicks(2)
            .timeout(waiter.fraction_timeout(1.5));
        waiter.click_when(&after)?;

        info!("[race] RaceDay flow finished.");
        Ok(RaceOutcome::Ok)
    }
}
