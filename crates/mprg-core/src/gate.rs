//! Advisory execution gate.
//!
//! Turns a [`RobustnessReport`] into a BLOCK / WARN / ALLOW decision for a
//! downstream executor. Nothing in this crate enforces the decision.

use serde::{Deserialize, Serialize};

use mprg_state::Verdict;

use crate::scorer::RobustnessReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateDecision {
    Block,
    Warn,
    Allow,
}

impl GateDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            GateDecision::Block => "BLOCK",
            GateDecision::Warn => "WARN",
            GateDecision::Allow => "ALLOW",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub decision: GateDecision,
    pub verdict: Verdict,
    pub reason: String,
    pub action: String,
    pub suggestion: Option<String>,
    /// Whether [`ExecutionGate::override_decision`] may turn this into ALLOW
    pub can_override: bool,
    pub override_warning: Option<String>,
    /// Confirmation text when the decision came from an override
    pub overridden_with: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionGate {
    /// MODERATE blocks instead of warning
    pub strict_mode: bool,
}

impl ExecutionGate {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn evaluate(&self, report: &RobustnessReport) -> GateResult {
        match report.verdict {
            Verdict::InsufficientData => GateResult {
                decision: GateDecision::Block,
                verdict: report.verdict,
                reason: format!(
                    "No valid reasoning summaries from {} agents.",
                    report.total_agents
                ),
                action: "Execution blocked. There is no reasoning to validate.".to_string(),
                suggestion: Some(
                    "Re-run the task; if it keeps failing, check the agent provider.".to_string(),
                ),
                can_override: false,
                override_warning: None,
                overridden_with: None,
            },
            Verdict::Fragile => block(report),
            Verdict::Moderate if self.strict_mode => block(report),
            Verdict::Moderate => GateResult {
                decision: GateDecision::Warn,
                verdict: report.verdict,
                reason: format!(
                    "{} reasoning families detected. Moderate diversity among {} valid agents.",
                    report.family_count, report.valid_runs
                ),
                action: "Proceed with caution. Consider the alternatives.".to_string(),
                suggestion: Some(
                    "Review the different approaches before executing and make sure you \
                     understand why they differ."
                        .to_string(),
                ),
                can_override: false,
                override_warning: None,
                overridden_with: None,
            },
            Verdict::Robust => GateResult {
                decision: GateDecision::Allow,
                verdict: report.verdict,
                reason: format!(
                    "{} distinct reasoning approaches found. The plan is validated by diverse logic.",
                    report.family_count
                ),
                action: "Execution allowed. Proceed with confidence.".to_string(),
                suggestion: None,
                can_override: false,
                override_warning: None,
                overridden_with: None,
            },
        }
    }

    /// Turn an overridable BLOCK into ALLOW, recording `confirmation`.
    /// Any other result is returned unchanged.
    pub fn override_decision(&self, result: &GateResult, confirmation: &str) -> GateResult {
        if !result.can_override || result.decision != GateDecision::Block {
            return result.clone();
        }
        GateResult {
            decision: GateDecision::Allow,
            verdict: result.verdict,
            reason: format!("User override: {confirmation}"),
            action: "Execution allowed by user override.".to_string(),
            suggestion: Some(
                "Proceeding despite low reasoning diversity; monitor carefully.".to_string(),
            ),
            can_override: false,
            override_warning: Some(
                "This execution was forced despite low robustness.".to_string(),
            ),
            overridden_with: Some(confirmation.to_string()),
        }
    }
}

fn block(report: &RobustnessReport) -> GateResult {
    GateResult {
        decision: GateDecision::Block,
        verdict: report.verdict,
        reason: format!(
            "Only {} reasoning family(ies) detected. Agreement among {} valid agents is shallow.",
            report.family_count, report.valid_runs
        ),
        action: "Execution blocked. Please revise the plan.".to_string(),
        suggestion: Some(
            "Rephrase the task to encourage diverse approaches, or ask explicitly for \
             alternative solutions."
                .to_string(),
        ),
        can_override: true,
        override_warning: Some(
            "Proceeding with fragile reasoning is risky: the plan relies on a single untested \
             approach."
                .to_string(),
        ),
        overridden_with: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerdictTiers;
    use crate::scorer::RobustnessScorer;
    use mprg_state::{FamilyRecord, FamilySignature, RunId, TaskId};

    fn report_with_families(count: usize) -> RobustnessReport {
        let task_id = TaskId("t".into());
        let families: Vec<FamilyRecord> = (0..count)
            .map(|i| FamilyRecord {
                family_id: format!("family_{}", i + 1),
                task_id: task_id.clone(),
                member_run_ids: vec![RunId::for_slot(&task_id, i as u32)],
                representative_run_id: RunId::for_slot(&task_id, i as u32),
                signature: FamilySignature {
                    plan_steps: vec![],
                    assumptions: vec![],
                    summary: String::new(),
                },
            })
            .collect();
        RobustnessScorer::new(VerdictTiers::ThreeTier).score(4, &[], &families, None)
    }

    #[test]
    fn decision_follows_verdict() {
        let gate = ExecutionGate::default();
        assert_eq!(gate.evaluate(&report_with_families(0)).decision, GateDecision::Block);
        assert_eq!(gate.evaluate(&report_with_families(1)).decision, GateDecision::Block);
        assert_eq!(gate.evaluate(&report_with_families(2)).decision, GateDecision::Warn);
        assert_eq!(gate.evaluate(&report_with_families(3)).decision, GateDecision::Allow);
    }

    #[test]
    fn strict_mode_blocks_moderate() {
        let gate = ExecutionGate::new(true);
        let result = gate.evaluate(&report_with_families(2));
        assert_eq!(result.decision, GateDecision::Block);
        assert!(result.can_override);
    }

    #[test]
    fn fragile_block_can_be_overridden() {
        let gate = ExecutionGate::default();
        let blocked = gate.evaluate(&report_with_families(1));
        let allowed = gate.override_decision(&blocked, "ship it, I accept the risk");
        assert_eq!(allowed.decision, GateDecision::Allow);
        assert_eq!(
            allowed.overridden_with.as_deref(),
            Some("ship it, I accept the risk")
        );
        assert!(!allowed.can_override);
    }

    #[test]
    fn insufficient_data_is_not_overridable() {
        let gate = ExecutionGate::default();
        let blocked = gate.evaluate(&report_with_families(0));
        assert!(!blocked.can_override);
        assert_eq!(gate.override_decision(&blocked, "please"), blocked);
    }

    #[test]
    fn warn_and_allow_pass_through_override_unchanged() {
        let gate = ExecutionGate::default();
        let warn = gate.evaluate(&report_with_families(2));
        assert_eq!(gate.override_decision(&warn, "x"), warn);
    }
}
