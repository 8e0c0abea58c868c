//! Runtime persistence for skill sightings and purchases.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::SkillGrade;

const VERSION: u32 = 1;
const STALE_SECS: u64 = 6 * 60 * 60;
const ANY_GRADE: &str = "any";

fn grade_key(grade: Option<SkillGrade>) -> &'static str {
    match grade {
        Some(SkillGrade::Single) => "single",
        Some(SkillGrade::Double) => "double",
        None => ANY_GRADE,
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct SkillEntry {
    count: u32,
    #[serde(default)]
    first_date: Option<String>,
    #[serde(default)]
    last_date: Option<String>,
    updated_at: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SkillMemoryData {
    version: u32,
    #[serde(default)]
    scenario: Option<String>,
    #[serde(default)]
    preset_id: Option<String>,
    #[serde(default)]
    date_key: Option<String>,
    #[serde(default)]
    date_index: Option<u32>,
    updated_at: u64,
    #[serde(default)]
    bought: BTreeMap<String, BTreeMap<String, SkillEntry>>,
    #[serde(default)]
    seen: BTreeMap<String, BTreeMap<String, SkillEntry>>,
}

impl SkillMemoryData {
    fn empty(scenario: Option<&str>) -> Self {
        Self {
            version: VERSION,
            scenario: scenario.map(|s| s.to_string()),
            preset_id: None,
            date_key: None,
            date_index: None,
            updated_at: now_secs(),
            bought: BTreeMap::new(),
            seen: BTreeMap::new(),
        }
    }
}

/// At-most-once purchase memory for the current career. The reloaded snapshot
/// is authoritative; `mark_purchased` is idempotent per (name, grade).
#[derive(Debug)]
pub struct SkillMemory {
    path: Option<PathBuf>,
    scenario: String,
    data: SkillMemoryData,
}

impl SkillMemory {
    /// In-memory only; used by tests and dry runs.
    pub fn ephemeral(scenario: &str) -> Self {
        Self {
            path: None,
            scenario: scenario.to_string(),
            data: SkillMemoryData::empty(Some(scenario)),
        }
    }

    pub fn load(path: PathBuf, scenario: &str) -> Self {
        let data = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<SkillMemoryData>(&text) {
                Ok(data) => {
                    let stored = data.scenario.as_deref().unwrap_or("");
                    if !stored.is_empty() && stored != scenario {
                        info!(
                            "[skill_memory] scenario changed {} -> {}; starting empty",
                            stored, scenario
                        );
                        SkillMemoryData::empty(Some(scenario))
                    } else {
                        data
                    }
                }
                Err(err) => {
                    warn!("[skill_memory] corrupted snapshot ({err}); starting empty");
                    SkillMemoryData::empty(Some(scenario))
                }
            },
            Err(_) => SkillMemoryData::empty(Some(scenario)),
        };
        Self {
            path: Some(path),
            scenario: scenario.to_string(),
            data,
        }
    }

    pub fn persist(&mut self) -> anyhow::Result<()> {
        self.data.version = VERSION;
        self.data.updated_at = now_secs();
        self.data.scenario = Some(self.scenario.clone());
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let serialized = serde_json::to_string_pretty(&self.data)?;
            std::fs::write(path, serialized)
                .with_context(|| format!("write skill memory {}", path.display()))?;
        }
        Ok(())
    }

    pub fn reload(&mut self) {
        if let Some(path) = self.path.clone() {
            *self = SkillMemory::load(path, &self.scenario.clone());
        }
    }

    pub fn mark_purchased(&mut self, name: &str, grade: Option<SkillGrade>, date_key: Option<&str>) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let entry = self
            .data
            .bought
            .entry(name.to_string())
            .or_default()
            .entry(grade_key(grade).to_string())
            .or_default();
        entry.count = entry.count.saturating_add(1);
        if entry.first_date.is_none() {
            entry.first_date = date_key.map(|d| d.to_string());
        }
        if date_key.is_some() {
            entry.last_date = date_key.map(|d| d.to_string());
        }
        entry.updated_at = now_secs();
        if let Err(err) = self.persist() {
            warn!("[skill_memory] persist failed: {err:#}");
        }
    }

    pub fn record_seen(&mut self, name: &str, grade: Option<SkillGrade>, date_key: Option<&str>) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        let entry = self
            .data
            .seen
            .entry(name.to_string())
            .or_default()
            .entry(grade_key(grade).to_string())
            .or_default();
        entry.count = entry.count.saturating_add(1);
        if date_key.is_some() {
            entry.last_date = date_key.map(|d| d.to_string());
        }
        entry.updated_at = now_secs();
    }

    pub fn is_purchased(&self, name: &str, grade: Option<SkillGrade>) -> bool {
        let Some(grades) = self.data.bought.get(name.trim()) else {
            return false;
        };
        match grade {
            None => !grades.is_empty(),
            Some(g) => grades.contains_key(grade_key(Some(g))) || grades.contains_key(ANY_GRADE),
        }
    }

    pub fn has_any_grade(&self, name: &str) -> bool {
        self.is_purchased(name, None)
    }

    pub fn purchased_count(&self, name: &str, grade: Option<SkillGrade>) -> u32 {
        self.data
            .bought
            .get(name.trim())
            .and_then(|grades| {
                grades
                    .get(grade_key(grade))
                    .or_else(|| grades.get(ANY_GRADE))
            })
            .map(|e| e.count)
            .unwrap_or(0)
    }

    /// Reset at career end; removes the persisted snapshot as well.
    pub fn reset_career(&mut self) {
        self.data = SkillMemoryData::empty(Some(&self.scenario));
        let path = self.path.clone();
        if let Some(path) = path {
            if path.exists() && std::fs::remove_file(&path).is_err() {
                let _ = self.persist();
            }
        }
    }

    pub fn set_run_metadata(
        &mut self,
        preset_id: Option<&str>,
        date_key: Option<&str>,
        date_index: Option<u32>,
    ) {
        let mut changed = false;
        if let Some(p) = preset_id {
            if self.data.preset_id.as_deref() != Some(p) {
                self.data.preset_id = Some(p.to_string());
                changed = true;
            }
        }
        if let Some(k) = date_key {
            if self.data.date_key.as_deref() != Some(k) {
                self.data.date_key = Some(k.to_string());
                changed = true;
            }
        }
        if let Some(idx) = date_index {
            // Monotone: the stored index only ever moves forward.
            if self.data.date_index.map(|stored| idx > stored).unwrap_or(true) {
                self.data.date_index = Some(idx);
                changed = true;
            }
        }
        if changed {
            if let Err(err) = self.persist() {
                warn!("[skill_memory] persist failed: {err:#}");
            }
        }
    }

    /// True when the stored snapshot does not contradict the live run: same
    /// preset and scenario, non-regressing date index, and not stale.
    pub fn is_compatible_run(
        &self,
        preset_id: Option<&str>,
        date_index: Option<u32>,
    ) -> bool {
        if let (Some(stored), Some(live)) = (self.data.preset_id.as_deref(), preset_id) {
            if stored != live {
                return false;
            }
        }
        if let (Some(stored), Some(live)) = (self.data.date_index, date_index) {
            if live < stored {
                return false;
            }
        }
        if date_index.is_none() && self.data.date_key.is_some() {
            let age = now_secs().saturating_sub(self.data.updated_at);
            if age >= STALE_SECS {
                return false;
            }
        }
        true
    }
}
