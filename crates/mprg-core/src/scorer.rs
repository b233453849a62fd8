//! Robustness scoring.
//!
//! The verdict is a pure function of the family count:
//!
//! | families | three-tier          | two-tier            |
//! |----------|---------------------|---------------------|
//! | 0        | INSUFFICIENT_DATA   | INSUFFICIENT_DATA   |
//! | 1        | FRAGILE             | FRAGILE             |
//! | 2        | MODERATE            | ROBUST              |
//! | 3+       | ROBUST              | ROBUST              |

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use mprg_state::{FamilyRecord, RunRecord, Verdict};

use crate::config::VerdictTiers;
use crate::similarity::normalize_assumption;

/// Map a family count onto a verdict.
pub fn verdict_for(family_count: usize, tiers: VerdictTiers) -> Verdict {
    match (family_count, tiers) {
        (0, _) => Verdict::InsufficientData,
        (1, _) => Verdict::Fragile,
        (2, VerdictTiers::ThreeTier) => Verdict::Moderate,
        _ => Verdict::Robust,
    }
}

pub fn confidence_for(verdict: Verdict) -> f64 {
    match verdict {
        Verdict::InsufficientData => 0.0,
        Verdict::Fragile => 0.9,
        Verdict::Moderate => 0.7,
        Verdict::Robust => 0.85,
    }
}

/// One family as shown in a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyBreakdown {
    pub family_id: String,
    pub family_number: usize,
    pub member_count: usize,
    pub member_run_ids: Vec<String>,
    pub representative_run_id: String,
    pub signature: String,
    /// Up to three of the representative's assumptions
    pub assumptions: Vec<String>,
}

/// Verdict plus everything needed to explain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessReport {
    pub verdict: Verdict,
    pub confidence: f64,
    pub total_agents: usize,
    pub valid_runs: usize,
    pub family_count: usize,
    pub answers_agree: Option<bool>,
    /// Normalized assumptions held by members of more than one family
    pub recurring_assumptions: Vec<String>,
    pub explanation: String,
    pub recommendation: String,
    pub breakdown: Vec<FamilyBreakdown>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RobustnessScorer {
    tiers: VerdictTiers,
}

impl RobustnessScorer {
    pub fn new(tiers: VerdictTiers) -> Self {
        Self { tiers }
    }

    /// Score one clustering pass.
    ///
    /// `total_agents` is the number of dispatched slots; `runs` are the task's
    /// runs (invalid ones are only counted, never inspected).
    pub fn score(
        &self,
        total_agents: usize,
        runs: &[RunRecord],
        families: &[FamilyRecord],
        answers_agree: Option<bool>,
    ) -> RobustnessReport {
        let family_count = families.len();
        let valid_runs = runs.iter().filter(|r| r.valid).count();
        let verdict = verdict_for(family_count, self.tiers);
        let recurring = recurring_assumptions(runs, families);

        let (mut explanation, recommendation) = match verdict {
            Verdict::InsufficientData => (
                format!(
                    "None of the {total_agents} agents returned a usable reasoning summary, \
                     so there is nothing to compare."
                ),
                "Re-run the task or check the agents' output format before trusting any plan."
                    .to_string(),
            ),
            Verdict::Fragile => (
                format!(
                    "All {valid_runs} valid agents used the same underlying reasoning. \
                     Agreement is shallow: they are saying the same thing in different words."
                ),
                "Consider revising the task or explicitly requesting alternative approaches. \
                 The plan relies on a single reasoning path."
                    .to_string(),
            ),
            Verdict::Moderate => (
                format!(
                    "Found {family_count} distinct reasoning approaches among {valid_runs} \
                     valid agents. Some diversity exists, but validation is limited."
                ),
                "Check whether both approaches lead to the same outcome and proceed with \
                 the alternative perspective in mind."
                    .to_string(),
            ),
            Verdict::Robust => (
                format!(
                    "Found {family_count} distinct reasoning approaches among {valid_runs} \
                     valid agents. Multiple independent paths support the conclusion."
                ),
                "The plan is backed by diverse reasoning. Proceed with confidence.".to_string(),
            ),
        };
        if !recurring.is_empty() {
            explanation.push_str(&format!(
                " Assumptions shared across families: {}.",
                recurring.join("; ")
            ));
        }
        match answers_agree {
            Some(true) if valid_runs > 1 => {
                explanation.push_str(" Every valid agent reached the same final answer.")
            }
            Some(false) => explanation.push_str(" The agents' final answers differ."),
            _ => {}
        }

        let breakdown = families
            .iter()
            .enumerate()
            .map(|(i, f)| FamilyBreakdown {
                family_id: f.family_id.clone(),
                family_number: i + 1,
                member_count: f.member_run_ids.len(),
                member_run_ids: f.member_run_ids.iter().map(|r| r.0.clone()).collect(),
                representative_run_id: f.representative_run_id.0.clone(),
                signature: f.signature.summary.clone(),
                assumptions: f.signature.assumptions.iter().take(3).cloned().collect(),
            })
            .collect();

        RobustnessReport {
            verdict,
            confidence: confidence_for(verdict),
            total_agents,
            valid_runs,
            family_count,
            answers_agree,
            recurring_assumptions: recurring,
            explanation,
            recommendation,
            breakdown,
        }
    }
}

/// Normalized assumptions that appear in more than one family, sorted.
fn recurring_assumptions(runs: &[RunRecord], families: &[FamilyRecord]) -> Vec<String> {
    let by_id: HashMap<&str, &RunRecord> = runs.iter().map(|r| (r.run_id.0.as_str(), r)).collect();

    let mut seen_in: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
    for (family_idx, family) in families.iter().enumerate() {
        for run_id in &family.member_run_ids {
            let Some(summary) = by_id.get(run_id.0.as_str()).and_then(|r| r.valid_summary())
            else {
                continue;
            };
            for raw in &summary.assumptions {
                let normalized = normalize_assumption(raw);
                if !normalized.is_empty() {
                    seen_in.entry(normalized).or_default().insert(family_idx);
                }
            }
        }
    }

    seen_in
        .into_iter()
        .filter(|(_, fams)| fams.len() > 1)
        .map(|(assumption, _)| assumption)
        .collect()
}
