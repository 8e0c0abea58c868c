//! Career calendar: (year_code, month, half) with a total order over
//! half-month turns. Year 0 is pre-debut, 4 is the final season.

use serde::{Deserialize, Serialize};

use crate::text::normalize_ocr;

pub const YEAR_PRE_DEBUT: u8 = 0;
pub const YEAR_FINALS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct CareerDate {
    pub year_code: u8,
    /// 1..=12; None for pre-debut and the final season.
    pub month: Option<u8>,
    /// 1 = early, 2 = late; None when unknown.
    pub half: Option<u8>,
}

impl CareerDate {
    pub fn new(year_code: u8, month: u8, half: u8) -> Self {
        Self {
            year_code,
            month: Some(month),
            half: Some(half),
        }
    }

    pub fn pre_debut() -> Self {
        Self {
            year_code: YEAR_PRE_DEBUT,
            month: None,
            half: None,
        }
    }

    pub fn finals() -> Self {
        Self {
            year_code: YEAR_FINALS,
            month: None,
            half: None,
        }
    }

    pub fn is_pre_debut(&self) -> bool {
        self.year_code == YEAR_PRE_DEBUT
    }

    pub fn is_finals(&self) -> bool {
        self.year_code == YEAR_FINALS
    }

    pub fn is_regular_year(&self) -> bool {
        (1..=3).contains(&self.year_code)
    }

    /// Half-month index over the whole career. Pre-debut is 0, regular years
    /// count 24 halves each, the final season sits past Senior December.
    pub fn index(&self) -> Option<u32> {
        match self.year_code {
            YEAR_PRE_DEBUT => Some(0),
            y @ 1..=3 => {
                let m = self.month? as u32;
                let h = self.half? as u32;
                if !(1..=12).contains(&(m as u8)) || !(1..=2).contains(&(h as u8)) {
                    return None;
                }
                Some((y as u32 - 1) * 24 + (m - 1) * 2 + (h - 1) + 1)
            }
            YEAR_FINALS => Some(73),
            _ => None,
        }
    }

    /// "Y3-06-2" style key used by planned races and memories.
    pub fn key(&self) -> String {
        match (self.month, self.half) {
            (Some(m), Some(h)) => format!("Y{}-{:02}-{}", self.year_code, m, h),
            _ => format!("Y{}", self.year_code),
        }
    }

    /// Advance by one half-month; Senior late December rolls into finals.
    pub fn advance_half(&self) -> Option<CareerDate> {
        if !self.is_regular_year() {
            return None;
        }
        let m = self.month?;
        let h = self.half?;
        Some(if h == 1 {
            CareerDate::new(self.year_code, m, 2)
        } else if m == 12 {
            if self.year_code < 3 {
                CareerDate::new(self.year_code + 1, 1, 1)
            } else {
                CareerDate::finals()
            }
        } else {
            CareerDate::new(self.year_code, m + 1, 1)
        })
    }

    pub fn is_summer(&self) -> bool {
        matches!(self.month, Some(7) | Some(8))
    }

    /// True when the summer break (July early) starts within `turns` halves.
    pub fn summer_within_turns(&self, turns: u32) -> bool {
        if !self.is_regular_year() {
            return false;
        }
        let idx = match self.index() {
            Some(i) => i,
            None => return false,
        };
        let summer_start = CareerDate::new(self.year_code, 7, 1)
            .index()
            .unwrap_or(u32::MAX);
        summer_start >= idx && summer_start - idx <= turns
    }

    /// Merge a fresh (possibly partial) read with the previous date: a missing
    /// half is kept from `prev` when the month did not change.
    pub fn merge(prev: Option<&CareerDate>, cand: CareerDate) -> CareerDate {
        let prev = match prev {
            Some(p) => p,
            None => return cand,
        };
        let mut merged = cand;
        if merged.half.is_none() && merged.month.is_some() && merged.month == prev.month {
            merged.half = prev.half;
        }
        merged
    }
}

/// Total order over careers; partial dates compare by the earliest turn they
/// could denote.
pub fn date_cmp(a: &CareerDate, b: &CareerDate) -> std::cmp::Ordering {
    let ia = a
        .index()
        .unwrap_or_else(|| (a.year_code.min(4) as u32) * 24);
    let ib = b
        .index()
        .unwrap_or_else(|| (b.year_code.min(4) as u32) * 24);
    ia.cmp(&ib)
}

/// Parse an OCR'd career date line.
///
/// Accepts forms like "Junior Year Early Jun", "Classic Year Late Dec",
/// "Pre-Debut", "Final Season". Returns None for unusable text.
pub fn parse_career_date(raw: &str) -> Option<CareerDate> {
    let norm = normalize_ocr(raw);
    if norm.is_empty() {
        return None;
    }
    if norm.contains("pre") && norm.contains("debut") {
        return Some(CareerDate::pre_debut());
    }
    if norm.contains("final") || norm.contains("finale") {
        return Some(CareerDate::finals());
    }

    let year_code = if norm.contains("junior") {
        1
    } else if norm.contains("classic") {
        2
    } else if norm.contains("senior") {
        3
    } else {
        return None;
    };

    let half = if norm.contains("early") {
        Some(1)
    } else if norm.contains("late") {
        Some(2)
    } else {
        None
    };

    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let mut month = None;
    for tok in norm.split_whitespace() {
        // Year/half words first; "junior" must not read as June.
        if matches!(tok, "junior" | "classic" | "senior" | "year" | "early" | "late") {
            continue;
        }
        for (i, name) in MONTHS.iter().enumerate() {
            if tok.starts_with(name) {
                month = Some(i as u8 + 1);
                break;
            }
        }
        if month.is_some() {
            break;
        }
    }

    Some(CareerDate {
        year_code,
        month,
        half,
    })
}
