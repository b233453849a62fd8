//! Task lifecycle.
//!
//! ```text
//! PENDING → RUNNING → CLUSTERING → SCORED → DONE
//!     └──────────┴──────────┴──────────┴──→ FAILED
//! ```
//!
//! Progress is reconstructed from the store on every call, never from memory:
//! a RUNNING task re-dispatches only the slots that have no run record, and a
//! task at CLUSTERING or later re-clusters and re-scores from its persisted
//! runs. Agent calls are therefore never repeated, while the cheap steps are
//! always recomputed.
//!
//! An orchestration holds a TTL lease on its task and renews it every third
//! of the TTL while it works. A crashed holder's lease lapses after one TTL;
//! [`Orchestrator::take_over`] breaks it immediately.

use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn, Instrument};

use mprg_state::{
    ContentDigest, FailureKind, FamilyRecord, ReasoningStore, RunRecord, StorageError, TaskId, TaskRecord,
    TaskStatus,
};

use crate::cluster::{answers_agree, FamilyClusterer, Thresholds};
use crate::config::MprgConfig;
use crate::error::{MprgError, Result};
use crate::gate::{ExecutionGate, GateResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::provider::{EmbeddingProvider, ReasoningProvider};
use crate::runner::{AbortHandle, AgentRunner};
use crate::scorer::{RobustnessReport, RobustnessScorer};

/// Where a task ended up after one orchestration call.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    /// Final task record; `FAILED` tasks carry the reason in `error`
    pub task: TaskRecord,
    pub report: Option<RobustnessReport>,
    pub gate: Option<GateResult>,
}

/// Read-only view of a persisted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInspection {
    pub task: TaskRecord,
    pub runs: Vec<RunRecord>,
    pub families: Vec<FamilyRecord>,
    /// Present once the task has been scored
    pub report: Option<RobustnessReport>,
    pub gate: Option<GateResult>,
}

pub struct Orchestrator {
    store: Arc<dyn ReasoningStore>,
    runner: AgentRunner,
    clusterer: FamilyClusterer,
    scorer: RobustnessScorer,
    gate: ExecutionGate,
    config: Arc<MprgConfig>,
    /// Lease owner id of this instance
    owner: String,
}

impl Orchestrator {
    pub fn new(
        config: MprgConfig,
        provider: Arc<dyn ReasoningProvider>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn ReasoningStore>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            runner: AgentRunner::new(provider, Arc::clone(&store), Arc::clone(&config)),
            clusterer: FamilyClusterer::new(embedder, Thresholds::from(config.as_ref())),
            scorer: RobustnessScorer::new(config.verdict_tiers),
            gate: ExecutionGate::new(config.strict_gate),
            store,
            owner: format!("orchestrator-{}", uuid::Uuid::new_v4()),
            config,
        })
    }

    pub fn config(&self) -> &MprgConfig {
        &self.config
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Create a PENDING task. The slot count is fixed here.
    pub async fn submit(&self, prompt: &str) -> Result<TaskRecord> {
        let task = TaskRecord::new(prompt, self.config.effective_agent_count() as u32);
        self.store.upsert_task(&task).await?;
        obs::emit_task_submitted(&task.task_id.0, task.agent_count);
        Ok(task)
    }

    /// Submit and drive a task to a terminal state.
    pub async fn submit_and_run(&self, prompt: &str, abort: &AbortHandle) -> Result<TaskOutcome> {
        let task = self.submit(prompt).await?;
        self.execute(&task.task_id, abort).await
    }

    /// Continue a task from its persisted state.
    pub async fn resume(&self, task_id: &TaskId) -> Result<TaskOutcome> {
        self.execute(task_id, &AbortHandle::new()).await
    }

    /// Continue a task whose lease is held by an orchestrator that is known
    /// to be dead, breaking that lease first.
    pub async fn take_over(&self, task_id: &TaskId, abort: &AbortHandle) -> Result<TaskOutcome> {
        self.run(task_id, abort, true).await
    }

    /// Drive `task_id` from wherever it stands to DONE or FAILED.
    ///
    /// Task-level failures (store errors, unreachable agents, embedding
    /// failures, abort) are recorded on the task and returned as an `Ok`
    /// outcome with status FAILED. `Err` is reserved for calls that leave the
    /// task resumable: unknown id, already terminal, leased elsewhere, or no
    /// usable reasoning provider.
    pub async fn execute(&self, task_id: &TaskId, abort: &AbortHandle) -> Result<TaskOutcome> {
        self.run(task_id, abort, false).await
    }

    #[instrument(skip(self, abort), fields(task_id = %task_id))]
    async fn run(&self, task_id: &TaskId, abort: &AbortHandle, steal: bool) -> Result<TaskOutcome> {
        let mut task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MprgError::TaskNotFound(task_id.0.clone()))?;
        if task.status.is_terminal() {
            return Err(MprgError::TaskTerminal {
                task_id: task_id.0.clone(),
                status: task.status.to_string(),
            });
        }
        let ttl = self.config.lease_ttl();
        if steal {
            warn!(owner = %self.owner, "breaking task lease");
            self.store.steal_task(task_id, &self.owner, ttl).await?;
        } else if !self.store.claim_task(task_id, &self.owner, ttl).await? {
            return Err(StorageError::LeaseHeld {
                task_id: task_id.0.clone(),
            }
            .into());
        }

        let work = self
            .drive(&mut task, abort)
            .instrument(obs::task_span(&task_id.0));
        let result = tokio::select! {
            result = work => result,
            never = self.heartbeat(task_id) => match never {},
        };

        let outcome = match result {
            Ok((report, gate)) => Ok(TaskOutcome {
                task,
                report: Some(report),
                gate: Some(gate),
            }),
            Err(e @ MprgError::ProviderUnavailable(_)) => {
                warn!(status = %task.status, error = %e, "no reasoning provider, task left resumable");
                Err(e)
            }
            Err(e) => {
                self.fail(&mut task, &e).await;
                Ok(TaskOutcome {
                    task,
                    report: None,
                    gate: None,
                })
            }
        };

        if let Err(e) = self.store.release_task(task_id, &self.owner).await {
            warn!(error = %e, "failed to release task lease");
        }
        METRICS.flush();
        outcome
    }

    /// Renew the lease every third of its TTL. Never completes.
    async fn heartbeat(&self, task_id: &TaskId) -> Infallible {
        let ttl = self.config.lease_ttl();
        let period = (ttl / 3).max(std::time::Duration::from_millis(100));
        loop {
            tokio::time::sleep(period).await;
            match self.store.claim_task(task_id, &self.owner, ttl).await {
                Ok(true) => debug!(task_id = %task_id, "lease renewed"),
                Ok(false) => warn!(task_id = %task_id, "lease taken by another orchestrator"),
                Err(e) => warn!(task_id = %task_id, error = %e, "lease renewal failed"),
            }
        }
    }

    async fn drive(
        &self,
        task: &mut TaskRecord,
        abort: &AbortHandle,
    ) -> Result<(RobustnessReport, GateResult)> {
        if task.status == TaskStatus::Pending {
            self.advance(task, TaskStatus::Running).await?;
        }

        if task.status == TaskStatus::Running {
            self.dispatch_missing(task, abort).await?;
            self.advance(task, TaskStatus::Clustering).await?;
        }

        if abort.is_aborted() {
            return Err(MprgError::Aborted);
        }

        // CLUSTERING or SCORED: always recompute from persisted runs.
        let mut runs = self.store.list_runs(&task.task_id).await?;
        let families = self
            .clusterer
            .cluster(self.store.as_ref(), &task.task_id, &mut runs)
            .await?;
        self.store
            .upsert_families(&task.task_id, &families)
            .await?;

        let agree = answers_agree(&runs);
        let report = self
            .scorer
            .score(task.agent_count as usize, &runs, &families, agree);
        obs::emit_verdict_scored(
            &task.task_id.0,
            report.verdict.as_str(),
            report.family_count,
            report.confidence,
        );

        task.total_runs = runs.len() as u32;
        task.valid_runs = report.valid_runs as u32;
        task.family_count = Some(report.family_count as u32);
        task.verdict = Some(report.verdict);
        task.answers_agree = agree;
        self.advance(task, TaskStatus::Scored).await?;

        let gate = self.gate.evaluate(&report);
        obs::emit_gate_evaluated(&task.task_id.0, gate.decision.as_str(), gate.can_override);

        self.advance(task, TaskStatus::Done).await?;
        Ok((report, gate))
    }

    /// Dispatch every slot without a run record, then check the full set.
    async fn dispatch_missing(&self, task: &mut TaskRecord, abort: &AbortHandle) -> Result<()> {
        let existing = self.store.list_runs(&task.task_id).await?;
        let present: BTreeSet<u32> = existing.iter().map(|r| r.run_index).collect();
        let missing: Vec<u32> = (0..task.agent_count)
            .filter(|i| !present.contains(i))
            .collect();

        if !missing.is_empty() {
            info!(
                missing = missing.len(),
                completed = present.len(),
                "dispatching agent slots"
            );
            let batch = self.runner.run_slots(task, &missing, abort).await?;
            if batch.aborted {
                return Err(MprgError::Aborted);
            }
        }

        let runs = self.store.list_runs(&task.task_id).await?;
        let present: BTreeSet<u32> = runs.iter().map(|r| r.run_index).collect();
        if let Some(run_index) = (0..task.agent_count).find(|i| !present.contains(i)) {
            return Err(MprgError::SlotLost {
                run_index,
                detail: "no run record after dispatch".to_string(),
            });
        }

        let unreachable = runs.iter().all(|r| {
            !r.valid
                && r
                    .failure
                    .as_ref()
                    .is_some_and(|f| f.kind == FailureKind::Transport)
        });
        if unreachable {
            return Err(MprgError::AllAgentsUnreachable {
                attempted: runs.len(),
            });
        }

        task.total_runs = runs.len() as u32;
        task.valid_runs = runs.iter().filter(|r| r.valid).count() as u32;
        Ok(())
    }

    async fn advance(&self, task: &mut TaskRecord, to: TaskStatus) -> Result<()> {
        let from = task.status;
        task.transition(to);
        self.store.upsert_task(task).await?;
        obs::emit_task_status(&task.task_id.0, from.as_str(), to.as_str());
        Ok(())
    }

    /// Mark the task FAILED. Best effort: the store may be the thing that broke.
    async fn fail(&self, task: &mut TaskRecord, error: &MprgError) {
        task.fail(error.to_string());
        METRICS.inc_tasks_failed();
        obs::emit_task_failed(&task.task_id.0, error);
        if let Err(e) = self.store.upsert_task(task).await {
            warn!(task_id = %task.task_id, error = %e, "could not persist FAILED status");
        }
    }

    /// Load a task with its runs and families. Scored tasks are re-scored
    /// from the stored families (pure, no writes).
    pub async fn inspect(&self, task_id: &TaskId) -> Result<TaskInspection> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MprgError::TaskNotFound(task_id.0.clone()))?;
        let runs = self.store.list_runs(task_id).await?;
        let families = self.store.list_families(task_id).await?;

        let scored = matches!(task.status, TaskStatus::Scored | TaskStatus::Done);
        let report = scored.then(|| {
            self.scorer.score(
                task.agent_count as usize,
                &runs,
                &families,
                task.answers_agree,
            )
        });
        let gate = report.as_ref().map(|r| self.gate.evaluate(r));

        Ok(TaskInspection {
            task,
            runs,
            families,
            report,
            gate,
        })
    }

    /// Newest tasks first.
    pub async fn list_tasks(&self, limit: usize) -> Result<Vec<TaskRecord>> {
        Ok(self.store.list_tasks(limit).await?)
    }

    /// Earlier submissions of exactly this prompt, newest first.
    pub async fn tasks_with_prompt(&self, prompt: &str, limit: usize) -> Result<Vec<TaskRecord>> {
        let digest = ContentDigest::from_bytes(prompt.as_bytes());
        Ok(self.store.find_tasks_by_prompt(&digest, limit).await?)
    }
}
