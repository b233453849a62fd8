//! Row definitions for the MPRG SurrealDB tables
//!
//! Tables:
//! - tasks: one row per task, keyed `tasks:<task_id>`
//! - runs: one row per agent slot, keyed `runs:<task_id>:<run_index>`
//! - families: rows of the latest clustering pass, replaced wholesale
//! - leases: orchestration claims, keyed `leases:<task_id>`
//!
//! Rows are converted to/from the `storage_traits` records at the store
//! boundary so the trait types stay free of database concerns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    ContentDigest, FamilyRecord, FamilySignature, ReasoningSummary, RunFailure, RunId, RunRecord,
    StorageResult, TaskId, TaskRecord, TaskStatus, Verdict,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row stored in `tasks`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub prompt: String,
    pub prompt_digest: String,
    /// "PENDING" | "RUNNING" | "CLUSTERING" | "SCORED" | "DONE" | "FAILED"
    pub status: String,
    pub agent_count: u32,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub family_count: Option<u32>,
    pub total_runs: u32,
    pub valid_runs: u32,
    #[serde(default)]
    pub answers_agree: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "surreal_datetime")]
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for TaskRow {
    fn from(task: &TaskRecord) -> Self {
        TaskRow {
            task_id: task.task_id.0.clone(),
            prompt: task.prompt.clone(),
            prompt_digest: task.prompt_digest.as_str().to_string(),
            status: task.status.as_str().to_string(),
            agent_count: task.agent_count,
            verdict: task.verdict.map(|v| v.as_str().to_string()),
            family_count: task.family_count,
            total_runs: task.total_runs,
            valid_runs: task.valid_runs,
            answers_agree: task.answers_agree,
            error: task.error.clone(),
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StorageError;

    fn try_from(row: TaskRow) -> StorageResult<Self> {
        let status = TaskStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown task status: {}", row.status))
        })?;
        let verdict = row
            .verdict
            .map(|v| {
                Verdict::parse(&v)
                    .ok_or_else(|| StorageError::Serialization(format!("unknown verdict: {v}")))
            })
            .transpose()?;

        Ok(TaskRecord {
            task_id: TaskId(row.task_id),
            prompt: row.prompt,
            prompt_digest: ContentDigest::try_from(row.prompt_digest)?,
            status,
            agent_count: row.agent_count,
            verdict,
            family_count: row.family_count,
            total_runs: row.total_runs,
            valid_runs: row.valid_runs,
            answers_agree: row.answers_agree,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row stored in `runs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    pub run_id: String,
    pub task_id: String,
    pub run_index: u32,
    pub agent_role: String,
    pub prompt_variant: String,
    pub raw_output: String,
    #[serde(default)]
    pub summary: Option<ReasoningSummary>,
    pub valid: bool,
    pub retry_count: u32,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub failure: Option<RunFailure>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl From<&RunRecord> for RunRow {
    fn from(run: &RunRecord) -> Self {
        RunRow {
            run_id: run.run_id.0.clone(),
            task_id: run.task_id.0.clone(),
            run_index: run.run_index,
            agent_role: run.agent_role.clone(),
            prompt_variant: run.prompt_variant.clone(),
            raw_output: run.raw_output.clone(),
            summary: run.summary.clone(),
            valid: run.valid,
            retry_count: run.retry_count,
            embedding: run.embedding.clone(),
            elapsed_ms: run.elapsed_ms,
            failure: run.failure.clone(),
            created_at: run.created_at,
        }
    }
}

impl From<RunRow> for RunRecord {
    fn from(row: RunRow) -> Self {
        RunRecord {
            run_id: RunId(row.run_id),
            task_id: TaskId(row.task_id),
            run_index: row.run_index,
            agent_role: row.agent_role,
            prompt_variant: row.prompt_variant,
            raw_output: row.raw_output,
            summary: row.summary,
            valid: row.valid,
            retry_count: row.retry_count,
            embedding: row.embedding,
            elapsed_ms: row.elapsed_ms,
            failure: row.failure,
            created_at: row.created_at,
        }
    }
}

/// Row stored in `families`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRow {
    pub family_id: String,
    pub task_id: String,
    /// Order of the family within its clustering pass
    pub position: u32,
    pub member_run_ids: Vec<String>,
    pub representative_run_id: String,
    pub signature: FamilySignature,
}

impl FamilyRow {
    pub fn from_record(family: &FamilyRecord, position: u32) -> Self {
        FamilyRow {
            family_id: family.family_id.clone(),
            task_id: family.task_id.0.clone(),
            position,
            member_run_ids: family.member_run_ids.iter().map(|r| r.0.clone()).collect(),
            representative_run_id: family.representative_run_id.0.clone(),
            signature: family.signature.clone(),
        }
    }
}

impl From<FamilyRow> for FamilyRecord {
    fn from(row: FamilyRow) -> Self {
        FamilyRecord {
            family_id: row.family_id,
            task_id: TaskId(row.task_id),
            member_run_ids: row.member_run_ids.into_iter().map(RunId).collect(),
            representative_run_id: RunId(row.representative_run_id),
            signature: row.signature,
        }
    }
}

/// Row stored in `leases`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRow {
    pub task_id: String,
    pub owner: String,
    /// Unix epoch millis after which the lease may be taken over
    pub expires_at_ms: i64,
}
