//! PAL chain memory: whether the recreation PAL icon is available this turn
//! and how far each PAL chain has advanced. Consulted before any decision
//! that would otherwise pick Rest or Recreation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChainState {
    pub steps_completed: u32,
    /// Whether the next chain step still restores energy, when predicted.
    #[serde(default)]
    pub next_step_yields_energy: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PalMemoryData {
    scenario: String,
    #[serde(default)]
    icon_present: bool,
    #[serde(default)]
    chains: BTreeMap<String, ChainState>,
}

#[derive(Debug)]
pub struct PalMemory {
    path: Option<PathBuf>,
    data: PalMemoryData,
}

impl PalMemory {
    pub fn ephemeral(scenario: &str) -> Self {
        Self {
            path: None,
            data: PalMemoryData {
                scenario: scenario.to_string(),
                icon_present: false,
                chains: BTreeMap::new(),
            },
        }
    }

    pub fn load(path: PathBuf, scenario: &str) -> Self {
        let data = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<PalMemoryData>(&text).ok())
            .filter(|d| d.scenario == scenario)
            .unwrap_or_else(|| PalMemoryData {
                scenario: scenario.to_string(),
                icon_present: false,
                chains: BTreeMap::new(),
            });
        Self {
            path: Some(path),
            data,
        }
    }

    fn persist(&self) {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            match serde_json::to_string_pretty(&self.data) {
                Ok(text) => {
                    if let Err(err) = std::fs::write(path, text) {
                        warn!("[lobby] pal memory persist failed: {err}");
                    }
                }
                Err(err) => warn!("[lobby] pal memory serialize failed: {err}"),
            }
        }
    }

    /// Record whether the PAL icon is present this turn. When it disappears,
    /// the chain record is cleared (the date chain consumed itself).
    pub fn record_availability(&mut self, icon_present: bool) {
        self.data.icon_present = icon_present;
        if !icon_present {
            self.reset_if_absent();
            return;
        }
        self.persist();
    }

    pub fn record_chain(&mut self, key: &str, steps_completed: u32, next_energy: Option<bool>) {
        let chain = self.data.chains.entry(key.to_string()).or_default();
        chain.steps_completed = steps_completed;
        if next_energy.is_some() {
            chain.next_step_yields_energy = next_energy;
        }
        self.persist();
    }

    pub fn icon_present(&self) -> bool {
        self.data.icon_present
    }

    pub fn chain(&self, key: &str) -> Option<&ChainState> {
        self.data.chains.get(key)
    }

    /// Whether any tracked chain's next step still restores energy. This is
    /// the gate for substituting Recreation-with-PAL for Rest.
    pub fn any_next_energy(&self) -> bool {
        self.data
            .chains
            .values()
            .any(|c| c.next_step_yields_energy == Some(true))
    }

    pub fn reset_if_absent(&mut self) {
        if !self.data.icon_present {
            self.data.chains.clear();
            self.persist();
        }
    }
}
