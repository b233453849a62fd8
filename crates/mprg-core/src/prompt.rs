//! Agent prompt construction.

use serde_json::json;

use crate::config::RoleVariant;

/// Which prompt an attempt used. Stored on the run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    Standard,
    /// Corrective retry demanding bare JSON
    JsonOnly,
}

impl PromptVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptVariant::Standard => "standard",
            PromptVariant::JsonOnly => "json_only",
        }
    }
}

const STANDARD_RULES: &str = "Return JSON only. Do not include chain-of-thought.";
const JSON_ONLY_RULES: &str = "Your previous reply could not be parsed. Return ONLY a single valid \
JSON object that matches the schema. No markdown, no code fences, no commentary.";
const SCHEMA_RULES: &str = "Use exactly the keys of the schema, no others. Write plan_steps \
without numbering: no '1.', '2)' or 'Step 1' prefixes.";

/// Build the prompt for one agent attempt.
pub fn build_prompt(task_id: &str, task: &str, role: &RoleVariant, variant: PromptVariant) -> String {
    let schema = json!({
        "agent_role": role.name,
        "task_id": task_id,
        "final_answer": "string",
        "plan_steps": ["string"],
        "assumptions": ["string"],
        "tools": ["string"],
        "risks": ["string"],
        "fallbacks": ["string"],
    });
    let rules = match variant {
        PromptVariant::Standard => STANDARD_RULES,
        PromptVariant::JsonOnly => JSON_ONLY_RULES,
    };

    format!(
        "You are a {name}. {angle}\n\
         Analyze the task independently and respond as JSON.\n\
         Task ID: {task_id}\n\
         Task: {task}\n\
         {rules} {SCHEMA_RULES}\n\
         Schema example (types only): {schema}",
        name = role.name,
        angle = role.angle,
    )
}
