//! Scenario registry: one policy object per scenario key, stable for the
//! whole run.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::config::Scenario;
use crate::perception::Detection;
use crate::screen::{classify, Classification, ScreenThresholds};

/// Per-scenario policy surface: the classifier thresholds plus the scenario
/// key the agent dispatches on. Scoring knobs live in the preset.
#[derive(Debug)]
pub struct ScenarioPolicy {
    pub scenario: Scenario,
    pub thresholds: ScreenThresholds,
}

impl ScenarioPolicy {
    pub fn classify(&self, dets: &[Detection], relaxed: bool) -> Classification {
        classify(self.scenario, dets, &self.thresholds, relaxed)
    }
}

#[derive(Debug)]
pub struct ScenarioRegistry {
    policies: BTreeMap<Scenario, Rc<ScenarioPolicy>>,
}

impl ScenarioRegistry {
    pub fn with_defaults() -> Self {
        let mut policies = BTreeMap::new();
        for scenario in [Scenario::Ura, Scenario::UnityCup] {
            policies.insert(
                scenario,
                Rc::new(ScenarioPolicy {
                    scenario,
                    thresholds: ScreenThresholds::default(),
                }),
            );
        }
        Self { policies }
    }

    /// The same policy object is returned for a key across calls within a run.
    pub fn get(&self, scenario: Scenario) -> Rc<ScenarioPolicy> {
        self.policies
            .get(&scenario)
            .cloned()
            .expect("registry covers all scenarios")
    }
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_returns_the_same_policy_object() {
        let registry = ScenarioRegistry::with_defaults();
        let a = registry.get(Scenario::UnityCup);
        let b = registry.get(Scenario::UnityCup);
        assert!(Rc::ptr_eq(&a, &b));
        let ura = registry.get(Scenario::Ura);
        assert!(!Rc::ptr_eq(&a, &ura));
        assert_eq!(ura.scenario, Scenario::Ura);
    }
}
