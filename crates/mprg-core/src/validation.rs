//! Strict parsing of raw agent output into a [`ReasoningSummary`].
//!
//! Accepted shape:
//! - a JSON object, either the whole text or its outermost `{...}` span
//! - `plan_steps`, `assumptions`: arrays of strings (required)
//! - `final_answer`: non-empty string (required)
//! - `tools`, `risks`, `fallbacks`: arrays of strings (optional)
//! - `agent_role`: string (optional); `task_id`: must equal the requested id
//!   when present
//!
//! Any other key is rejected, and plan steps must not carry their own
//! numbering (`1.`, `2)`, `Step 3:`): ordinal prefixes differ between agents
//! that agree and would skew plan similarity.

use serde_json::{Map, Value};

use mprg_state::ReasoningSummary;

use crate::error::AgentOutcome;

const REQUIRED_KEYS: [&str; 3] = ["plan_steps", "assumptions", "final_answer"];
const OPTIONAL_KEYS: [&str; 5] = ["agent_role", "task_id", "tools", "risks", "fallbacks"];

/// Validate `raw` against the reasoning-summary schema.
///
/// Returns [`AgentOutcome::Valid`] or [`AgentOutcome::SchemaError`]; never a
/// transport error.
pub fn validate_output(raw: &str, task_id: &str) -> AgentOutcome {
    match parse_summary(raw, task_id) {
        Ok(summary) => AgentOutcome::Valid(summary),
        Err(detail) => AgentOutcome::SchemaError(detail),
    }
}

fn parse_summary(raw: &str, task_id: &str) -> Result<ReasoningSummary, String> {
    let value = extract_json(raw).ok_or_else(|| "Response was not valid JSON.".to_string())?;
    let Value::Object(object) = value else {
        return Err("Output is not a JSON object.".to_string());
    };

    let missing: Vec<&str> = REQUIRED_KEYS
        .into_iter()
        .filter(|k| !object.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(format!("Missing keys: {}", missing.join(", ")));
    }
    let extra: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|k| !REQUIRED_KEYS.contains(k) && !OPTIONAL_KEYS.contains(k))
        .collect();
    if !extra.is_empty() {
        return Err(format!("Extra keys not allowed: {}", extra.join(", ")));
    }

    if let Some(echoed) = object.get("task_id") {
        if echoed.as_str() != Some(task_id) {
            return Err("task_id must match the requested task_id.".to_string());
        }
    }
    if let Some(role) = object.get("agent_role") {
        if !role.is_string() {
            return Err("agent_role must be a string.".to_string());
        }
    }

    let final_answer = match object.get("final_answer") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err("final_answer must be a non-empty string.".to_string()),
    };

    let plan_steps = string_list(&object, "plan_steps")?.unwrap_or_default();
    if plan_steps.iter().any(|step| is_numbered(step)) {
        return Err("plan_steps must not include numbering or 'Step' prefixes.".to_string());
    }

    Ok(ReasoningSummary {
        plan_steps,
        assumptions: string_list(&object, "assumptions")?.unwrap_or_default(),
        final_answer,
        tools: string_list(&object, "tools")?.unwrap_or_default(),
        risks: string_list(&object, "risks")?.unwrap_or_default(),
        fallbacks: string_list(&object, "fallbacks")?.unwrap_or_default(),
    })
}

fn string_list(object: &Map<String, Value>, field: &str) -> Result<Option<Vec<String>>, String> {
    let Some(value) = object.get(field) else {
        return Ok(None);
    };
    let not_strings = || format!("{field} must be a list of strings.");
    let items = value.as_array().ok_or_else(not_strings)?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(not_strings))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// `1. x`, `12) x`, `3: x`, `Step 2 x`, `step-one`: a step that labels its
/// own position.
fn is_numbered(step: &str) -> bool {
    let step = step.trim_start();
    let digits = step.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let mut rest = step[digits..].chars();
        return match rest.next() {
            None | Some(')') | Some(':') => true,
            // `2.5 GB` is a quantity, `2. drain` an ordinal
            Some('.') => !rest.next().is_some_and(|c| c.is_ascii_digit()),
            Some(_) => false,
        };
    }
    let lowered = step.to_ascii_lowercase();
    match lowered.strip_prefix("step") {
        Some(rest) => rest.is_empty() || rest.starts_with(|c: char| !c.is_alphabetic()),
        None => false,
    }
}

/// Parse the whole text, falling back to the outermost `{...}` span.
pub fn extract_json(raw: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str(raw.trim()) {
        return Some(value);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}
