//! Storage trait definitions for MPRG
//!
//! Records:
//! - `TaskRecord`: one validation task and its lifecycle state
//! - `RunRecord`: one agent slot's attempt, keyed by `(task_id, run_index)`
//! - `FamilyRecord`: one reasoning family from the latest clustering pass
//!
//! `ReasoningStore` is the only shared mutable resource in the system. Every
//! write is an upsert keyed by a unique identifier, so replays after a crash
//! overwrite instead of duplicating. In-memory fakes live in `fakes`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new random TaskId
    pub fn new() -> Self {
        TaskId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one agent run. Derived from the owning task and the slot
/// index, so re-dispatching a slot can never create a second record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn for_slot(task_id: &TaskId, run_index: u32) -> Self {
        RunId(format!("{}:{}", task_id.0, run_index))
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
///
/// `Pending → Running → Clustering → Scored → Done`, with `Failed` reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Clustering,
    Scored,
    Done,
    Failed,
}

impl TaskStatus {
    /// `Done` and `Failed` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Clustering => "CLUSTERING",
            TaskStatus::Scored => "SCORED",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskStatus::Pending),
            "RUNNING" => Some(TaskStatus::Running),
            "CLUSTERING" => Some(TaskStatus::Clustering),
            "SCORED" => Some(TaskStatus::Scored),
            "DONE" => Some(TaskStatus::Done),
            "FAILED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Robustness verdict derived from the number of reasoning families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// No valid runs were available to cluster.
    InsufficientData,
    /// Every valid run followed the same line of reasoning.
    Fragile,
    /// Two distinct lines of reasoning.
    Moderate,
    /// Three or more distinct lines of reasoning.
    Robust,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::InsufficientData => "INSUFFICIENT_DATA",
            Verdict::Fragile => "FRAGILE",
            Verdict::Moderate => "MODERATE",
            Verdict::Robust => "ROBUST",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSUFFICIENT_DATA" => Some(Verdict::InsufficientData),
            "FRAGILE" => Some(Verdict::Fragile),
            "MODERATE" => Some(Verdict::Moderate),
            "ROBUST" => Some(Verdict::Robust),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full task record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub prompt: String,
    /// SHA-256 of the prompt, for correlating repeated submissions
    pub prompt_digest: ContentDigest,
    pub status: TaskStatus,
    /// Number of agent slots fixed at submission; resume compares against it
    pub agent_count: u32,
    pub verdict: Option<Verdict>,
    pub family_count: Option<u32>,
    pub total_runs: u32,
    pub valid_runs: u32,
    pub answers_agree: Option<bool>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Create a new task in `Pending` state
    pub fn new(prompt: impl Into<String>, agent_count: u32) -> Self {
        let prompt = prompt.into();
        let now = Utc::now();
        Self {
            task_id: TaskId::new(),
            prompt_digest: ContentDigest::from_bytes(prompt.as_bytes()),
            prompt,
            status: TaskStatus::Pending,
            agent_count,
            verdict: None,
            family_count: None,
            total_runs: 0,
            valid_runs: 0,
            answers_agree: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `status`, bumping `updated_at`.
    pub fn transition(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Move to `Failed` with the error message attached.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.transition(TaskStatus::Failed);
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Structured summary each agent must return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningSummary {
    /// Ordered plan steps
    pub plan_steps: Vec<String>,
    /// Assumptions the plan relies on (treated as a set when clustering)
    pub assumptions: Vec<String>,
    pub final_answer: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub fallbacks: Vec<String>,
}

impl ReasoningSummary {
    /// Plan steps joined into the text that gets embedded.
    pub fn plan_text(&self) -> String {
        self.plan_steps.join("\n")
    }
}

/// Why a run ended up invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Output did not satisfy the reasoning-summary schema
    Schema,
    /// The provider call itself failed (timeout, network, provider error)
    Transport,
}

/// Error captured on an invalid run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    /// Error text, captured verbatim
    pub detail: String,
}

/// One agent's attempt at a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub task_id: TaskId,
    /// Slot index in `0..agent_count`; doubles as creation order
    pub run_index: u32,
    pub agent_role: String,
    /// Prompt variant that produced `raw_output` ("standard" or "json_only")
    pub prompt_variant: String,
    pub raw_output: String,
    pub summary: Option<ReasoningSummary>,
    pub valid: bool,
    pub retry_count: u32,
    /// Plan embedding; `None` until the clusterer computes it
    pub embedding: Option<Vec<f32>>,
    pub elapsed_ms: u64,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Summary of a valid run, `None` for invalid ones.
    pub fn valid_summary(&self) -> Option<&ReasoningSummary> {
        if self.valid {
            self.summary.as_ref()
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Family
// ---------------------------------------------------------------------------

/// Display signature of a family, taken from its representative run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilySignature {
    pub plan_steps: Vec<String>,
    pub assumptions: Vec<String>,
    /// Short one-line rendering (top assumptions + leading steps)
    pub summary: String,
}

/// A reasoning family produced by one clustering pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyRecord {
    pub family_id: String,
    pub task_id: TaskId,
    /// Members ordered by run index; never empty
    pub member_run_ids: Vec<RunId>,
    pub representative_run_id: RunId,
    pub signature: FamilySignature,
}

// ---------------------------------------------------------------------------
// ReasoningStore
// ---------------------------------------------------------------------------

/// Key-addressed store for tasks, runs and families.
///
/// Guarantees:
/// - `upsert_*` replace any record with the same key.
/// - `list_runs` returns runs ordered by `run_index`.
/// - `upsert_families` replaces the whole family set of the task.
/// - `claim_task` grants at most one live lease per task; `steal_task`
///   replaces it unconditionally.
#[async_trait]
pub trait ReasoningStore: Send + Sync {
    /// Insert or replace a task record.
    async fn upsert_task(&self, task: &TaskRecord) -> StorageResult<()>;

    /// Fetch a task, `None` if unknown.
    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>>;

    /// Most recently created tasks first.
    async fn list_tasks(&self, limit: usize) -> StorageResult<Vec<TaskRecord>>;

    /// Tasks submitted with the same prompt, most recent first.
    async fn find_tasks_by_prompt(
        &self,
        digest: &ContentDigest,
        limit: usize,
    ) -> StorageResult<Vec<TaskRecord>>;

    /// Insert or replace a run record keyed by its `RunId`.
    async fn upsert_run(&self, run: &RunRecord) -> StorageResult<()>;

    /// All runs of a task, ordered by `run_index`.
    async fn list_runs(&self, task_id: &TaskId) -> StorageResult<Vec<RunRecord>>;

    /// Replace the family set of a task.
    async fn upsert_families(
        &self,
        task_id: &TaskId,
        families: &[FamilyRecord],
    ) -> StorageResult<()>;

    /// Families of the latest clustering pass.
    async fn list_families(&self, task_id: &TaskId) -> StorageResult<Vec<FamilyRecord>>;

    /// Take (or refresh) the orchestration lease for a task.
    ///
    /// Returns `false` when another owner holds an unexpired lease.
    async fn claim_task(&self, task_id: &TaskId, owner: &str, ttl: Duration)
        -> StorageResult<bool>;

    /// Give the lease to `owner` whoever holds it. For recovering tasks whose
    /// holder is known to be gone.
    async fn steal_task(&self, task_id: &TaskId, owner: &str, ttl: Duration)
        -> StorageResult<()>;

    /// Drop the lease if `owner` holds it. No-op otherwise.
    async fn release_task(&self, task_id: &TaskId, owner: &str) -> StorageResult<()>;
}
