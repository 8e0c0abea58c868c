//! Date-driven running-style schedule.
//!
//! The preset lists (date, style) entries; the latest entry at or before the
//! current date wins. A change is applied at most once per style so the
//! strategy modal is not reopened needlessly.

use tracing::debug;

use crate::config::StyleScheduleEntry;
use crate::date::{date_cmp, CareerDate};
use crate::types::Style;

#[derive(Debug)]
pub struct StyleSchedule {
    debut_style: Option<Style>,
    entries: Vec<(CareerDate, Style)>,
    last_applied: Option<Style>,
}

impl StyleSchedule {
    pub fn new(debut_style: Option<Style>, schedule: &[StyleScheduleEntry]) -> Self {
        let mut entries: Vec<(CareerDate, Style)> = schedule
            .iter()
            .map(|e| (CareerDate::new(e.year_code, e.month, e.half), e.style))
            .collect();
        entries.sort_by(|a, b| date_cmp(&a.0, &b.0));
        Self {
            debut_style,
            entries,
            last_applied: None,
        }
    }

    pub fn debut_style(&self) -> Option<Style> {
        self.debut_style
    }

    pub fn has_schedule(&self) -> bool {
        !self.entries.is_empty()
    }

    /// Style that should be active at `date`: the latest entry <= date, or
    /// the debut style when nothing matched yet.
    pub fn style_for_date(&self, date: &CareerDate) -> Option<Style> {
        let mut active = self.debut_style;
        for (entry_date, style) in &self.entries {
            if date_cmp(entry_date, date) != std::cmp::Ordering::Greater {
                active = Some(*style);
            } else {
                break;
            }
        }
        active
    }

    /// Some(style) when the scheduled style differs from the last applied one.
    pub fn pending_change(&self, date: &CareerDate) -> Option<Style> {
        let style = self.style_for_date(date)?;
        if Some(style) != self.last_applied {
            debug!(
                "[race] style change due at {}: {:?} -> {}",
                date.key(),
                self.last_applied.map(|s| s.label()),
                style.label()
            );
            return Some(style);
        }
        None
    }

    pub fn mark_applied(&mut self, style: Style) {
        self.last_applied = Some(style);
    }

    pub fn reset(&mut self) {
        self.last_applied = None;
    }
}
