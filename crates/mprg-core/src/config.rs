//! Pipeline configuration.
//!
//! `MprgConfig` is built once (defaults, then an optional TOML file, then
//! `MPRG_*` environment overrides) and handed by value to the orchestrator,
//! runner and clusterer. Nothing reads configuration from globals.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MprgError, Result};

/// Maximum retries per run. Larger configured values are clamped to this.
pub const RETRY_CEILING: u32 = 1;

/// One differently-angled agent persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleVariant {
    pub name: String,
    /// Instruction appended to the role line of the prompt
    pub angle: String,
}

impl RoleVariant {
    pub fn new(name: impl Into<String>, angle: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            angle: angle.into(),
        }
    }
}

/// The five built-in role variants, in dispatch order.
pub fn default_roles() -> Vec<RoleVariant> {
    vec![
        RoleVariant::new(
            "Systematic Planner",
            "Break the task into an explicit, ordered sequence of steps.",
        ),
        RoleVariant::new(
            "Risk Analyst",
            "Focus on what could go wrong and plan around the biggest risks first.",
        ),
        RoleVariant::new(
            "Pragmatic Engineer",
            "Prefer the simplest approach that works with the tools at hand.",
        ),
        RoleVariant::new(
            "Skeptical Reviewer",
            "Question the obvious approach and state which assumptions you refuse to make.",
        ),
        RoleVariant::new(
            "Creative Strategist",
            "Look for an unconventional approach that reaches the goal differently.",
        ),
    ]
}

/// How family counts map onto verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictTiers {
    /// FRAGILE / MODERATE / ROBUST
    #[default]
    ThreeTier,
    /// FRAGILE / ROBUST; two families already count as robust
    TwoTier,
}

impl VerdictTiers {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "three_tier" | "three-tier" | "3" => Some(VerdictTiers::ThreeTier),
            "two_tier" | "two-tier" | "2" => Some(VerdictTiers::TwoTier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MprgConfig {
    pub agent_count: usize,
    pub plan_similarity_threshold: f64,
    pub assumption_similarity_threshold: f64,
    pub max_retries: u32,
    pub call_timeout_secs: u64,
    pub verdict_tiers: VerdictTiers,
    pub strict_gate: bool,
    pub lease_ttl_secs: u64,
    pub roles: Vec<RoleVariant>,
}

impl Default for MprgConfig {
    fn default() -> Self {
        Self {
            agent_count: 4,
            plan_similarity_threshold: 0.85,
            assumption_similarity_threshold: 0.70,
            max_retries: 1,
            call_timeout_secs: 60,
            verdict_tiers: VerdictTiers::ThreeTier,
            strict_gate: false,
            lease_ttl_secs: 120,
            roles: default_roles(),
        }
    }
}

impl MprgConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| MprgError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MprgError::Config(e.to_string()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MPRG_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Unparseable values are rejected.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MPRG_AGENT_COUNT") {
            self.agent_count = parse_var("MPRG_AGENT_COUNT", &v)?;
        }
        if let Some(v) = lookup("MPRG_PLAN_THRESHOLD") {
            self.plan_similarity_threshold = parse_var("MPRG_PLAN_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MPRG_ASSUMPTION_THRESHOLD") {
            self.assumption_similarity_threshold = parse_var("MPRG_ASSUMPTION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MPRG_MAX_RETRIES") {
            self.max_retries = parse_var("MPRG_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("MPRG_CALL_TIMEOUT_SECS") {
            self.call_timeout_secs = parse_var("MPRG_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("MPRG_VERDICT_TIERS") {
            self.verdict_tiers = VerdictTiers::parse(&v).ok_or_else(|| {
                MprgError::Config(format!("MPRG_VERDICT_TIERS: unknown value {v:?}"))
            })?;
        }
        if let Some(v) = lookup("MPRG_STRICT_GATE") {
            self.strict_gate = parse_var("MPRG_STRICT_GATE", &v.to_ascii_lowercase())?;
        }
        if let Some(v) = lookup("MPRG_LEASE_TTL_SECS") {
            self.lease_ttl_secs = parse_var("MPRG_LEASE_TTL_SECS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_count == 0 {
            return Err(MprgError::Config("agent_count must be at least 1".into()));
        }
        if self.roles.is_empty() {
            return Err(MprgError::Config("at least one role is required".into()));
        }
        for (field, value) in [
            ("plan_similarity_threshold", self.plan_similarity_threshold),
            (
                "assumption_similarity_threshold",
                self.assumption_similarity_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MprgError::Config(format!(
                    "{field} must be between 0.0 and 1.0, got {value}"
                )));
            }
        }
        if self.call_timeout_secs == 0 {
            return Err(MprgError::Config(
                "call_timeout_secs must be greater than 0".into(),
            ));
        }
        // a zero lease expires on creation and never excludes anyone
        if self.lease_ttl_secs == 0 {
            return Err(MprgError::Config(
                "lease_ttl_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Agent slots actually dispatched: one per role at most.
    pub fn effective_agent_count(&self) -> usize {
        self.agent_count.clamp(1, self.roles.len().max(1))
    }

    pub fn effective_max_retries(&self) -> u32 {
        self.max_retries.min(RETRY_CEILING)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Role for slot `index`, cycling if the role list is short.
    pub fn role_for_slot(&self, index: usize) -> Option<&RoleVariant> {
        if self.roles.is_empty() {
            return None;
        }
        self.roles.get(index % self.roles.len())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| MprgError::Config(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = MprgConfig::default();
        assert_eq!(config.agent_count, 4);
        assert_eq!(config.plan_similarity_threshold, 0.85);
        assert_eq!(config.assumption_similarity_threshold, 0.70);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.call_timeout_secs, 60);
        assert_eq!(config.verdict_tiers, VerdictTiers::ThreeTier);
        assert_eq!(config.lease_ttl_secs, 120);
        assert_eq!(config.roles.len(), 5);
        config.validate().unwrap();
    }

    #[test]
    fn toml_keeps_defaults_for_missing_keys() {
        let config = MprgConfig::from_toml_str(
            r#"
            agent_count = 3
            verdict_tiers = "two_tier"
            "#,
        )
        .unwrap();
        assert_eq!(config.agent_count, 3);
        assert_eq!(config.verdict_tiers, VerdictTiers::TwoTier);
        assert_eq!(config.plan_similarity_threshold, 0.85);
        assert_eq!(config.roles, default_roles());
    }

    #[test]
    fn toml_file_is_loaded_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mprg.toml");
        std::fs::write(&path, "plan_similarity_threshold = 1.5\n").unwrap();
        let err = MprgConfig::from_toml_file(&path).unwrap_err();
        assert!(matches!(err, MprgError::Config(msg) if msg.contains("plan_similarity_threshold")));
    }

    #[test]
    fn overrides_take_precedence() {
        let vars: HashMap<&str, &str> = [
            ("MPRG_AGENT_COUNT", "5"),
            ("MPRG_PLAN_THRESHOLD", "0.9"),
            ("MPRG_STRICT_GATE", "TRUE"),
            ("MPRG_VERDICT_TIERS", "two-tier"),
            ("MPRG_LEASE_TTL_SECS", "30"),
        ]
        .into_iter()
        .collect();
        let mut config = MprgConfig::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.agent_count, 5);
        assert_eq!(config.plan_similarity_threshold, 0.9);
        assert!(config.strict_gate);
        assert_eq!(config.verdict_tiers, VerdictTiers::TwoTier);
        assert_eq!(config.lease_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn bad_override_is_rejected() {
        let mut config = MprgConfig::default();
        let err = config
            .apply_overrides(|k| (k == "MPRG_AGENT_COUNT").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, MprgError::Config(_)));
    }

    #[test]
    fn agent_count_and_retries_are_clamped() {
        let config = MprgConfig {
            agent_count: 12,
            max_retries: 4,
            ..Default::default()
        };
        assert_eq!(config.effective_agent_count(), 5);
        assert_eq!(config.effective_max_retries(), 1);
    }

    #[test]
    fn zero_values_fail_validation() {
        let config = MprgConfig {
            agent_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MprgConfig {
            call_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MprgConfig {
            lease_ttl_secs: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, MprgError::Config(msg) if msg.contains("lease_ttl_secs")));
    }
}
