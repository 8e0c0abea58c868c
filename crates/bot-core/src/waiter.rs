//! The Waiter: the single synchronization primitive guarding all UI
//! interactions.
//!
//! Every interaction is poll-with-timeout over capture -> detect -> compare.
//! Cancellation is honored at the start of every poll via the shared stop
//! flag. Between the detection that authorized a click and the click itself
//! no other captures occur.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::controller::{Controller, ControllerKind};
use crate::geometry::BBox;
use crate::perception::{Detection, DetClass, FrameImage, Perception};
use crate::stop::{Aborted, StopFlag};
use crate::text::{fuzzy_ratio, normalize_ocr};

/// Base polling config. Constructed once and reused; per-call overrides go
/// through the spec structs.
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub agent: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            timeout: Duration::from_secs(4),
            agent: "player".to_string(),
        }
    }
}

impl PollConfig {
    /// Stretch poll timing for higher-latency controller backends.
    pub fn scaled_for(mut self, kind: ControllerKind) -> Self {
        let scale = kind.poll_scale();
        self.interval = self.interval.mul_f32(scale);
        self.timeout = self.timeout.mul_f32(scale);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClickSpec {
    pub classes: Vec<DetClass>,
    pub texts: Vec<String>,
    pub forbid_texts: Vec<String>,
    pub threshold: f32,
    pub forbid_threshold: f32,
    pub prefer_bottom: bool,
    pub allow_greedy: bool,
    pub clicks: u32,
    pub timeout: Option<Duration>,
    pub tag: &'static str,
}

impl ClickSpec {
    pub fn new(classes: &[DetClass], tag: &'static str) -> Self {
        Self {
            classes: classes.to_vec(),
            texts: Vec::new(),
            forbid_texts: Vec::new(),
            threshold: 0.68,
            forbid_threshold: 0.65,
            prefer_bottom: false,
            allow_greedy: true,
            clicks: 1,
            timeout: None,
            tag,
        }
    }

    pub fn texts(mut self, texts: &[&str]) -> Self {
        self.texts = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn forbid(mut self, texts: &[&str]) -> Self {
        self.forbid_texts = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn prefer_bottom(mut self) -> Self {
        self.prefer_bottom = true;
        self
    }

    pub fn no_greedy(mut self) -> Self {
        self.allow_greedy = false;
        self
    }

    pub fn clicks(mut self, clicks: u32) -> Self {
        self.clicks = clicks.max(1);
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct SeenSpec {
    pub classes: Vec<DetClass>,
    pub texts: Vec<String>,
    pub conf_min: f32,
    pub threshold: f32,
    pub tag: &'static str,
}

impl SeenSpec {
    pub fn new(classes: &[DetClass], tag: &'static str) -> Self {
        Self {
            classes: classes.to_vec(),
            texts: Vec::new(),
            conf_min: 0.0,
            threshold: 0.58,
            tag,
        }
    }

    pub fn texts(mut self, texts: &[&str]) -> Self {
        self.texts = texts.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn conf_min(mut self, conf_min: f32) -> Self {
        self.conf_min = conf_min;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

pub struct Waiter {
    ctrl: Box<dyn Controller>,
    percept: Box<dyn Perception>,
    pub cfg: PollConfig,
    stop: StopFlag,
    ocr_cache: HashMap<(u64, (i32, i32, i32, i32)), String>,
    cache_seq: u64,
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("cfg", &self.cfg)
            .field("kind", &self.ctrl.kind())
            .finish()
    }
}

impl Waiter {
    pub fn new(
        ctrl: Box<dyn Controller>,
        percept: Box<dyn Perception>,
        cfg: PollConfig,
        stop: StopFlag,
    ) -> Self {
        let cfg = cfg.scaled_for(ctrl.kind());
        debug!("[waiter] init agent={} kind={:?}", cfg.agent, ctrl.kind());
        Self {
            ctrl,
            percept,
            cfg,
            stop,
            ocr_cache: HashMap::new(),
            cache_seq: 0,
        }
    }

    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    pub fn controller_kind(&self) -> ControllerKind {
        self.ctrl.kind()
    }

    fn check_stop(&self) -> anyhow::Result<()> {
        if self.stop.is_set() {
            return Err(Aborted.into());
        }
        Ok(())
    }

    /// One capture + detect. The OCR cache rolls over to the new frame.
    pub fn snap(&mut self, _tag: &str) -> anyhow::Result<(FrameImage, Vec<Detection>)> {
        self.check_stop()?;
        let frame = self.ctrl.capture()?;
        if frame.seq != self.cache_seq {
            self.ocr_cache.clear();
            self.cache_seq = frame.seq;
        }
        let dets = self.percept.detect(&frame)?;
        Ok((frame, dets))
    }

    /// OCR a region, joined to one line, cached per (frame, ROI).
    pub fn ocr_text(&mut self, frame: &FrameImage, roi: BBox) -> String {
        let key = (frame.seq, roi.cache_key());
        if let Some(cached) = self.ocr_cache.get(&key) {
            return cached.clone();
        }
        let text = match self.percept.ocr(frame, roi) {
            Ok(tokens) => tokens
                .into_iter()
                .map(|(t, _)| t)
                .collect::<Vec<_>>()
                .join(" "),
            Err(_) => String::new(),
        };
        self.ocr_cache.insert(key, text.clone());
        text
    }

    pub fn click_bbox(&mut self, bbox: BBox, clicks: u32) -> anyhow::Result<()> {
        let (cx, cy) = bbox.center();
        for _ in 0..clicks.max(1) {
            self.ctrl.click(cx, cy)?;
        }
        Ok(())
    }

    pub fn scroll(&mut self, anchor: (f32, f32), dy: i32) -> anyhow::Result<()> {
        self.ctrl.scroll(anchor, dy)
    }

    /// Step timeout as a fraction of the base timeout, so per-backend scaling
    /// and test configs propagate to every flow step.
    pub fn fraction_timeout(&self, factor: f32) -> Duration {
        self.cfg.timeout.mul_f32(factor)
    }

    /// Short settle pause between UI steps, proportional to the poll interval.
    pub fn settle(&self, factor: f32) -> anyhow::Result<()> {
        self.sleep(self.cfg.interval.mul_f32(factor))
    }

    /// Stop-aware sleep; returns Aborted as soon as the stop flag is seen.
    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_stop()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }

    /// Snapshot once: any detection of `classes` present (and OCR-matching
    /// any of `texts` when given)?
    pub fn seen(&mut self, spec: &SeenSpec) -> anyhow::Result<bool> {
        let (frame, dets) = self.snap(spec.tag)?;
        let cands: Vec<Detection> = dets
            .into_iter()
            .filter(|d| spec.classes.contains(&d.class) && d.conf >= spec.conf_min)
            .collect();
        if spec.texts.is_empty() {
            return Ok(!cands.is_empty());
        }
        for d in &cands {
            let txt = self.ocr_text(&frame, d.bbox);
            if txt.is_empty() {
                continue;
            }
            let norm = normalize_ocr(&txt);
            for target in &spec.texts {
                let t = normalize_ocr(target);
                if norm.contains(&t) || fuzzy_ratio(&norm, &t) >= spec.threshold {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Wait until a matching object appears and click it using the cascade.
    /// Returns the clicked detection, or None on timeout.
    pub fn click_when(&mut self, spec: &ClickSpec) -> anyhow::Result<Option<Detection>> {
        let timeout = spec.timeout.unwrap_or(self.cfg.timeout);
        let deadline = Instant::now() + timeout;
        loop {
            self.check_stop()?;
            if let Some(det) = self.try_cascade(spec)? {
                return Ok(Some(det));
            }
            if Instant::now() >= deadline {
                debug!(
                    "[waiter] timeout after {:.2}s (tag={})",
                    timeout.as_secs_f32(),
                    spec.tag
                );
                return Ok(None);
            }
            self.sleep(self.cfg.interval)?;
        }
    }

    /// Single-snapshot best-effort click with the same cascade, no polling.
    pub fn try_click_once(&mut self, spec: &ClickSpec) -> anyhow::Result<Option<Detection>> {
        self.try_cascade(spec)
    }

    fn try_cascade(&mut self, spec: &ClickSpec) -> anyhow::Result<Option<Detection>> {
        let (frame, dets) = self.snap(spec.tag)?;
        let cands: Vec<Detection> = dets
            .into_iter()
            .filter(|d| spec.classes.contains(&d.class))
            .collect();
        if cands.is_empty() {
            return Ok(None);
        }

        // 1) Single candidate fast path, guarded by forbid texts.
        if cands.len() == 1 && spec.allow_greedy {
            let pick = cands[0].clone();
            if self.is_forbidden(&frame, &pick, spec) {
                debug!(
                    "[waiter] single candidate rejected by forbid_texts (tag={})",
                    spec.tag
                );
            } else {
                self.click_bbox(pick.bbox, spec.clicks)?;
                return Ok(Some(pick));
            }
        }

        // 2) Bottom-most preference; walk bottom to top, skipping forbiddens.
        if spec.prefer_bottom && spec.allow_greedy {
            let mut ordered = cands.clone();
            ordered.sort_by(|a, b| {
                b.bbox
                    .center_y()
                    .partial_cmp(&a.bbox.center_y())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            for d in ordered {
                if !self.is_forbidden(&frame, &d, spec) {
                    self.click_bbox(d.bbox, spec.clicks)?;
                    return Ok(Some(d));
                }
            }
        }

        // 3) OCR disambiguation by positive texts.
        if !spec.texts.is_empty() {
            let (pick, score) = self.pick_by_text(&frame, &cands, spec);
            if let Some(pick) = pick {
                debug!(
                    "[waiter] text match (tag={}) score={:.2} targets={:?}",
                    spec.tag, score, spec.texts
                );
                self.click_bbox(pick.bbox, spec.clicks)?;
                return Ok(Some(pick));
            }
            debug!(
                "[waiter] text match miss (tag={}) best={:.2} targets={:?}",
                spec.tag, score, spec.texts
            );
        }

        Ok(None)
    }

    fn is_forbidden(&mut self, frame: &FrameImage, det: &Detection, spec: &ClickSpec) -> bool {
        if spec.forbid_texts.is_empty() {
            return false;
        }
        let txt = self.ocr_text(frame, det.bbox);
        if txt.is_empty() {
            return false;
        }
        let norm = normalize_ocr(&txt);
        for forbid in &spec.forbid_texts {
            let f = normalize_ocr(forbid);
            if norm.contains(&f) || fuzzy_ratio(&norm, &f) >= spec.forbid_threshold {
                debug!(
                    "[waiter] candidate forbidden text match text='{}' forbid='{}' (tag={})",
                    norm, f, spec.tag
                );
                return true;
            }
        }
        false
    }

    fn pick_by_text(
        &mut self,
        frame: &FrameImage,
        cands: &[Detection],
        spec: &ClickSpec,
    ) -> (Option<Detection>, f32) {
        let mut best: Option<Detection> = None;
        let mut best_score = 0.0f32;
        for d in cands {
            let txt = self.ocr_text(frame, d.bbox);
            if txt.is_empty() {
                continue;
            }
            if self.is_forbidden(frame, d, spec) {
                continue;
            }
            let norm = normalize_ocr(&txt);
            let mut score = 0.0f32;
            for target in &spec.texts {
                let t = normalize_ocr(target);
                // Direct token match is near-certain; fuzzy covers the rest.
                if norm.split_whitespace().any(|tok| tok == t) {
                    score = score.max(0.95);
                }
                score = score.max(fuzzy_ratio(&norm, &t));
            }
            if score > best_score {
                best_score = score;
                best = Some(d.clone());
            }
        }
        if best_score >= spec.threshold {
            (best, best_score)
        } else {
            (None, best_score)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::DetClass;
    use crate::testkit::{det, FakeBridge, ScriptedFrame};

    fn fast_cfg() -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(0),
            agent: "test".to_string(),
        }
    }

    #[test]
    fn greedy_click_hits_single_candidate() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(ScriptedFrame::new(vec![det(
            DetClass::ButtonGreen,
            100.0,
            200.0,
            0.9,
        )]));
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        let clicked = waiter.click_when(&ClickSpec::new(&[DetClass::ButtonGreen], "t"))?;
        assert!(clicked.is_some());
        let clicks = bridge.clicks();
        assert_eq!(clicks.len(), 1);
        assert!((clicks[0].0 - 105.0).abs() < 1.0);
        Ok(())
    }

    #[test]
    fn forbid_text_blocks_greedy_click() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let button = det(DetClass::ButtonGreen, 100.0, 200.0, 0.9);
        bridge.push_frame(
            ScriptedFrame::new(vec![button.clone()]).with_text(button.bbox, "TRY AGAIN"),
        );
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        let spec = ClickSpec::new(&[DetClass::ButtonGreen], "t").forbid(&["TRY AGAIN"]);
        let clicked = waiter.click_when(&spec)?;
        assert!(clicked.is_none());
        assert!(bridge.clicks().is_empty());
        Ok(())
    }

    #[test]
    fn prefer_bottom_skips_forbidden_bottom_candidate() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let top = det(DetClass::ButtonWhite, 100.0, 50.0, 0.9);
        let bottom = det(DetClass::ButtonWhite, 100.0, 400.0, 0.9);
        bridge.push_frame(
            ScriptedFrame::new(vec![top.clone(), bottom.clone()])
                .with_text(bottom.bbox, "CANCEL")
                .with_text(top.bbox, "BACK"),
        );
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        let spec = ClickSpec::new(&[DetClass::ButtonWhite], "t")
            .prefer_bottom()
            .forbid(&["CANCEL"]);
        let clicked = waiter.click_when(&spec)?.expect("click");
        assert!((clicked.bbox.center_y() - top.bbox.center_y()).abs() < 1.0);
        Ok(())
    }

    #[test]
    fn ocr_disambiguation_picks_matching_text() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let a = det(DetClass::ButtonGreen, 100.0, 50.0, 0.9);
        let b = det(DetClass::ButtonGreen, 100.0, 300.0, 0.9);
        bridge.push_frame(
            ScriptedFrame::new(vec![a.clone(), b.clone()])
                .with_text(a.bbox, "CANCEL")
                .with_text(b.bbox, "RACE"),
        );
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        let spec = ClickSpec::new(&[DetClass::ButtonGreen], "t")
            .no_greedy()
            .texts(&["RACE"]);
        let clicked = waiter.click_when(&spec)?.expect("click");
        assert!((clicked.bbox.center_y() - b.bbox.center_y()).abs() < 1.0);
        Ok(())
    }

    #[test]
    fn timeout_returns_none_without_clicking() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        bridge.push_frame(ScriptedFrame::new(vec![]));
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        let clicked = waiter.click_when(&ClickSpec::new(&[DetClass::ButtonSkip], "t"))?;
        assert!(clicked.is_none());
        assert!(bridge.clicks().is_empty());
        Ok(())
    }

    #[test]
    fn stop_flag_aborts_the_poll() {
        let bridge = FakeBridge::new();
        bridge.push_frame(ScriptedFrame::new(vec![]));
        let stop = StopFlag::new();
        stop.request_stop();
        let mut waiter = bridge.waiter(fast_cfg(), stop);

        let err = waiter
            .click_when(&ClickSpec::new(&[DetClass::ButtonSkip], "t"))
            .unwrap_err();
        assert!(err.is::<Aborted>());
    }

    #[test]
    fn seen_matches_class_and_text() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let b = det(DetClass::ButtonWhite, 10.0, 10.0, 0.8);
        bridge.push_frame(ScriptedFrame::new(vec![b.clone()]).with_text(b.bbox, "VIEW RESULTS"));
        bridge.push_frame(ScriptedFrame::new(vec![b.clone()]).with_text(b.bbox, "VIEW RESULTS"));
        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());

        assert!(waiter.seen(&SeenSpec::new(&[DetClass::ButtonWhite], "t"))?);
        assert!(waiter.seen(&SeenSpec::new(&[DetClass::ButtonWhite], "t").texts(&["VIEW RESULTS"]))?);
        Ok(())
    }
}
