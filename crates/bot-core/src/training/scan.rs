//! Training-screen scan: turn one snapshot into per-tile evidence.
//!
//! Tiles are the five training buttons left to right (SPD, STA, PWR, GUTS,
//! WIT). Support, hint, rainbow and spirit detections belong to the tile
//! whose horizontal span contains their center. The failure percentage is
//! OCR'd from the tile button itself.

use crate::perception::{DetClass, Detection, FrameImage};
use crate::training::evaluator::{GaugeColor, SupportEntry, SupportKind, TrainingTile};
use crate::types::StatKey;
use crate::waiter::Waiter;

fn parse_failure_pct(text: &str) -> Option<u8> {
    let norm = crate::text::normalize_ocr(text);
    let mut tokens = norm.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok.starts_with("fail") {
            if let Some(next) = tokens.peek() {
                let digits: String = next.chars().filter(|c| c.is_ascii_digit()).collect();
                if let Ok(v) = digits.parse::<u8>() {
                    return Some(v.min(100));
                }
            }
        }
        // Bare "NN%"-style reading survives normalization as a number token.
        let digits: String = tok.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() == tok.len() && !digits.is_empty() {
            if let Ok(v) = digits.parse::<u8>() {
                return Some(v.min(100));
            }
        }
    }
    None
}

fn support_from_detection(class: DetClass) -> Option<(SupportKind, GaugeColor)> {
    match class {
        DetClass::SupportBlue => Some((SupportKind::Standard, GaugeColor::Blue)),
        DetClass::SupportGreen => Some((SupportKind::Standard, GaugeColor::Green)),
        DetClass::SupportOrange => Some((SupportKind::Standard, GaugeColor::Orange)),
        DetClass::SupportMax => Some((SupportKind::Standard, GaugeColor::Max)),
        DetClass::SupportReporter => Some((SupportKind::Reporter, GaugeColor::Unknown)),
        DetClass::SupportDirector => Some((SupportKind::Director, GaugeColor::Unknown)),
        DetClass::SupportPal => Some((SupportKind::Pal, GaugeColor::Unknown)),
        _ => None,
    }
}

/// Snapshot the training screen and assemble per-tile evidence. Returns an
/// empty list when fewer than two tiles are visible (mid-transition frame).
pub fn scan_training_screen(waiter: &mut Waiter) -> anyhow::Result<Vec<TrainingTile>> {
    let (frame, dets) = waiter.snap("training_scan")?;
    Ok(assemble_tiles(waiter, &frame, &dets))
}

pub fn assemble_tiles(
    waiter: &mut Waiter,
    frame: &FrameImage,
    dets: &[Detection],
) -> Vec<TrainingTile> {
    let mut buttons: Vec<&Detection> = dets
        .iter()
        .filter(|d| d.class == DetClass::TrainingButton)
        .collect();
    if buttons.len() < 2 {
        return Vec::new();
    }
    buttons.sort_by(|a, b| {
        a.bbox
            .center()
            .0
            .partial_cmp(&b.bbox.center().0)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut tiles = Vec::with_capacity(buttons.len());
    for (idx, button) in buttons.iter().enumerate() {
        let stat = StatKey::ALL.get(idx).copied().unwrap_or(StatKey::Wit);
        let failure = parse_failure_pct(&waiter.ocr_text(frame, button.bbox)).unwrap_or(0);
        let mut tile = TrainingTile::new(idx, stat, failure);
        tile.bbox = button.bbox;

        let in_column = |d: &Detection| {
            let (cx, _) = d.bbox.center();
            cx >= button.bbox.x1 && cx <= button.bbox.x2
        };

        // Supports and their attached badges.
        let hints: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::SupportHint && in_column(d))
            .collect();
        let rainbows: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.class == DetClass::SupportRainbow && in_column(d))
            .collect();
        for d in dets.iter().filter(|d| in_column(d)) {
            let Some((kind, gauge)) = support_from_detection(d.class) else {
                continue;
            };
            let mut entry = SupportEntry {
                kind,
                gauge,
                has_hint: false,
                has_rainbow: false,
                hint_skills: Vec::new(),
                hint_value: None,
            };
            entry.has_hint = hints.iter().any(|h| d.bbox.contains(&h.bbox, 12.0));
            entry.has_rainbow = rainbows.iter().any(|r| d.bbox.contains(&r.bbox, 12.0));
            tile.supports.push(entry);
        }

        tile.white_spirits_filled = dets
            .iter()
            .filter(|d| d.class == DetClass::SpiritWhite && in_column(d))
            .count() as u32;
        tile.white_spirits_exploded = dets
            .iter()
            .filter(|d| d.class == DetClass::SpiritWhiteExploded && in_column(d))
            .count() as u32;
        tile.blue_spirits = dets
            .iter()
            .filter(|d| d.class == DetClass::SpiritBlue && in_column(d))
            .count() as u32;

        tiles.push(tile);
    }
    tiles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
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

    fn tile_button(i: usize) -> BBox {
        BBox::new(50.0 + 200.0 * i as f32, 500.0, 200.0 + 200.0 * i as f32, 600.0)
    }

    #[test]
    fn failure_pct_parses_common_shapes() {
        assert_eq!(parse_failure_pct("Failure 15%"), Some(15));
        assert_eq!(parse_failure_pct("fai1ure 30"), Some(30));
        assert_eq!(parse_failure_pct("22"), Some(22));
        assert_eq!(parse_failure_pct("no reading"), None);
    }

    #[test]
    fn tiles_get_stat_order_supports_and_spirits() -> anyhow::Result<()> {
        let bridge = FakeBridge::new();
        let mut dets = Vec::new();
        let mut frame = ScriptedFrame::default();
        for i in 0..5 {
            dets.push(det_box(DetClass::TrainingButton, tile_button(i), 0.8));
        }
        frame = frame.with_text(tile_button(0), "Failure 12%");
        // SPD column: blue support with a hint badge on it.
        let support = BBox::new(80.0, 100.0, 160.0, 180.0);
        dets.push(det_box(DetClass::SupportBlue, support, 0.9));
        dets.push(det_box(
            DetClass::SupportHint,
            BBox::new(140.0, 95.0, 170.0, 125.0),
            0.9,
        ));
        // STA column: a white and a blue spirit.
        dets.push(det_box(
            DetClass::SpiritWhite,
            BBox::new(300.0, 200.0, 330.0, 230.0),
            0.9,
        ));
        dets.push(det_box(
            DetClass::SpiritBlue,
            BBox::new(340.0, 200.0, 370.0, 230.0),
            0.9,
        ));
        frame.detections = dets;
        bridge.push_frame(frame);

        let mut waiter = bridge.waiter(fast_cfg(), StopFlag::new());
        let tiles = scan_training_screen(&mut waiter)?;
        assert_eq!(tiles.len(), 5);
        assert_eq!(tiles[0].stat, StatKey::Spd);
        assert_eq!(tiles[0].failure_pct, 12);
        assert_eq!(tiles[0].supports.len(), 1);
        assert!(tiles[0].supports[0].has_hint);
        assert_eq!(tiles[1].stat, StatKey::Sta);
        assert_eq!(tiles[1].white_spirits_filled, 1);
        assert_eq!(tiles[1].blue_spirits, 1);
        assert_eq!(tiles[4].stat, StatKey::Wit);
        Ok(())
    }
}
