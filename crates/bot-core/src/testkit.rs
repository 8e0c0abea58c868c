//! Scripted controller + perception fakes shared across unit tests.
//!
//! A `FakeBridge` models the UI as a queue of screens: captures serve the
//! current screen, and the first input (click or scroll) since the last
//! capture advances to the next queued screen, the way a real UI transitions
//! on interaction. Detect returns the current screen's boxes and OCR answers
//! from its text table by ROI overlap. Clicks and scrolls are recorded for
//! assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::controller::{Controller, ControllerKind};
use crate::geometry::BBox;
use crate::perception::{Detection, DetClass, FrameImage, Perception};
use crate::stop::StopFlag;
use crate::waiter::{PollConfig, Waiter};

pub fn det(class: DetClass, x: f32, y: f32, conf: f32) -> Detection {
    Detection::new(class, BBox::new(x, y, x + 10.0, y + 20.0), conf)
}

pub fn det_box(class: DetClass, bbox: BBox, conf: f32) -> Detection {
    Detection::new(class, bbox, conf)
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedFrame {
    pub detections: Vec<Detection>,
    pub texts: Vec<(BBox, String)>,
}

impl ScriptedFrame {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self {
            detections,
            texts: Vec::new(),
        }
    }

    pub fn with_text(mut self, roi: BBox, text: &str) -> Self {
        self.texts.push((roi, text.to_string()));
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    frames: VecDeque<ScriptedFrame>,
    current: Option<ScriptedFrame>,
    input_since_capture: bool,
    seq: u64,
    clicks: Vec<(f32, f32)>,
    scrolls: Vec<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBridge {
    inner: Arc<Mutex<Inner>>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, frame: ScriptedFrame) {
        self.inner.lock().unwrap().frames.push_back(frame);
    }

    pub fn clicks(&self) -> Vec<(f32, f32)> {
        self.inner.lock().unwrap().clicks.clone()
    }

    pub fn scrolls(&self) -> Vec<i32> {
        self.inner.lock().unwrap().scrolls.clone()
    }

    pub fn click_count(&self) -> usize {
        self.inner.lock().unwrap().clicks.len()
    }

    /// True when any recorded click landed inside `bbox`.
    pub fn clicked_inside(&self, bbox: BBox) -> bool {
        self.inner
            .lock()
            .unwrap()
            .clicks
            .iter()
            .any(|&(x, y)| bbox.contains_point(x, y))
    }

    pub fn waiter(&self, cfg: PollConfig, stop: StopFlag) -> Waiter {
        Waiter::new(Box::new(self.clone()), Box::new(self.clone()), cfg, stop)
    }
}

impl Controller for FakeBridge {
    fn capture(&mut self) -> anyhow::Result<FrameImage> {
        let mut inner = self.inner.lock().unwrap();
        let advance = inner.current.is_none()
            || (inner.input_since_capture && !inner.frames.is_empty());
        if advance {
            let next = inner.frames.pop_front().unwrap_or_default();
            inner.current = Some(next);
        }
        inner.input_since_capture = false;
        inner.seq += 1;
        Ok(FrameImage {
            seq: inner.seq,
            width: 1280,
            height: 720,
        })
    }

    fn click(&mut self, x: f32, y: f32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.clicks.push((x, y));
        inner.input_since_capture = true;
        Ok(())
    }

    fn scroll(&mut self, _from: (f32, f32), dy: i32) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.scrolls.push(dy);
        inner.input_since_capture = true;
        Ok(())
    }

    fn kind(&self) -> ControllerKind {
        ControllerKind::Desktop
    }
}

impl Perception for FakeBridge {
    fn detect(&mut self, _frame: &FrameImage) -> anyhow::Result<Vec<Detection>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .current
            .as_ref()
            .map(|f| f.detections.clone())
            .unwrap_or_default())
    }

    fn ocr(&mut self, _frame: &FrameImage, roi: BBox) -> anyhow::Result<Vec<(String, f32)>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        if let Some(frame) = inner.current.as_ref() {
            for (bbox, text) in &frame.texts {
                // Only text that lies mostly inside the ROI, the way a
                // cropped OCR pass would see it.
                if bbox.overlap_ratio(&roi) > 0.5 {
                    out.push((text.clone(), 0.9));
                }
            }
        }
        Ok(out)
    }
}
