//! Skill metadata and the title matcher used by the skills-buying flow.
//!
//! Matching is token-aware: a catalog entry can require tokens to be present
//! and forbid others, which disambiguates families like "Corner Recovery" vs
//! "Non-Standard Distance Corner Recovery" under noisy OCR.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::text::{fuzzy_ratio, normalize_ocr};
use crate::types::SkillGrade;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SkillMeta {
    /// Tokens that must all appear in the OCR title for this skill.
    #[serde(default)]
    pub require_tokens: Vec<String>,
    /// Tokens whose presence rejects the match outright.
    #[serde(default)]
    pub forbid_tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SkillCatalog {
    #[serde(default)]
    entries: BTreeMap<String, SkillMeta>,
}

impl SkillCatalog {
    pub fn from_entries(entries: BTreeMap<String, SkillMeta>) -> Self {
        Self { entries }
    }

    pub fn load_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn meta(&self, canonical_name: &str) -> Option<&SkillMeta> {
        self.entries.get(canonical_name)
    }
}

/// Strip grade symbols and collapse whitespace.
pub fn canonical_skill_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '◎' | '○' | '×'))
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Grade symbol carried in a target or OCR'd title, if any.
pub fn grade_from_text(text: &str) -> Option<SkillGrade> {
    if text.contains('◎') {
        Some(SkillGrade::Double)
    } else if text.contains('○') {
        Some(SkillGrade::Single)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchEval {
    pub ok: bool,
    pub score: f32,
    pub reason: &'static str,
}

#[derive(Debug)]
pub struct SkillMatcher {
    catalog: SkillCatalog,
}

impl SkillMatcher {
    pub fn new(catalog: SkillCatalog) -> Self {
        Self { catalog }
    }

    /// Decide whether a normalized OCR title names `target`.
    pub fn evaluate(&self, title_norm: &str, target: &str, threshold: f32) -> MatchEval {
        let canonical = canonical_skill_name(target);
        let target_norm = normalize_ocr(&canonical);
        if title_norm.is_empty() || target_norm.is_empty() {
            return MatchEval {
                ok: false,
                score: 0.0,
                reason: "empty",
            };
        }

        if let Some(meta) = self.catalog.meta(&canonical) {
            for forbid in &meta.forbid_tokens {
                if title_norm.contains(&normalize_ocr(forbid)) {
                    return MatchEval {
                        ok: false,
                        score: 0.0,
                        reason: "forbidden_token",
                    };
                }
            }
            for required in &meta.require_tokens {
                if !title_norm.contains(&normalize_ocr(required)) {
                    return MatchEval {
                        ok: false,
                        score: 0.0,
                        reason: "missing_required_token",
                    };
                }
            }
        }

        // Negation guard: "non standard ..." titles must not satisfy plain
        // "standard ..." targets, and the other way round.
        let title_negated = title_norm.starts_with("non ") || title_norm.contains(" non ");
        let target_negated = target_norm.starts_with("non ");
        if title_negated != target_negated {
            let stripped = title_norm.replace("non ", "");
            if fuzzy_ratio(stripped.trim(), &target_norm) >= threshold {
                return MatchEval {
                    ok: false,
                    score: 0.0,
                    reason: "negation_mismatch",
                };
            }
        }

        if title_norm.contains(&target_norm) {
            return MatchEval {
                ok: true,
                score: 1.0,
                reason: "substring",
            };
        }

        let score = fuzzy_ratio(title_norm, &target_norm);
        MatchEval {
            ok: score >= threshold,
            score,
            reason: if score >= threshold { "fuzzy" } else { "below_threshold" },
        }
    }
}
