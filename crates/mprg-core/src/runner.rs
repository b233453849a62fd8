//! Concurrent agent dispatch.
//!
//! Every missing slot of a task runs on its own tokio task. A slot makes one
//! attempt with the standard prompt and, if the output is unusable, one more
//! with the JSON-only prompt. The finished run is written to the store before
//! the slot returns, independently of its siblings, so a crash loses at most
//! the in-flight calls.
//!
//! A provider that is not configured at all (no API key) is not an agent
//! failure: the slot writes nothing and the batch fails with
//! [`MprgError::ProviderUnavailable`], leaving the slot open for a later
//! dispatch.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{instrument, warn};

use mprg_state::{
    FailureKind, ReasoningStore, ReasoningSummary, RunFailure, RunId, RunRecord, StorageError,
    TaskRecord,
};

use crate::config::{MprgConfig, RoleVariant};
use crate::error::{AgentOutcome, MprgError, ProviderError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::prompt::{build_prompt, PromptVariant};
use crate::provider::ReasoningProvider;
use crate::validation::validate_output;

/// External cancellation switch for one task.
///
/// Cloning shares the switch. Once aborted, in-flight agent calls are dropped
/// at their next suspend point and no further runs are written.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the flag behind `rx` turns true. Never resolves if the
/// sender is gone.
async fn raised(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs written by one dispatch.
#[derive(Debug, Clone, Default)]
pub struct RunBatch {
    /// Persisted runs, ordered by `run_index`
    pub runs: Vec<RunRecord>,
    /// True if the batch stopped because of an external abort
    pub aborted: bool,
}

/// One attempt's raw text and validated outcome.
struct Attempt {
    raw: String,
    outcome: AgentOutcome,
}

enum SlotResult {
    Persisted(Box<RunRecord>),
    Cancelled,
    StoreFailed(StorageError),
    Unconfigured(ProviderError),
}

pub struct AgentRunner {
    provider: Arc<dyn ReasoningProvider>,
    store: Arc<dyn ReasoningStore>,
    config: Arc<MprgConfig>,
}

impl AgentRunner {
    pub fn new(
        provider: Arc<dyn ReasoningProvider>,
        store: Arc<dyn ReasoningStore>,
        config: Arc<MprgConfig>,
    ) -> Self {
        Self {
            provider,
            store,
            config,
        }
    }

    /// Dispatch `slots` of `task` concurrently and persist each run as it
    /// finishes.
    ///
    /// Schema and transport failures never fail the batch: they are recorded
    /// on the run. A store write failure stops the remaining slots and is
    /// returned as [`MprgError::Persistence`]; an unconfigured provider does
    /// the same as [`MprgError::ProviderUnavailable`].
    #[instrument(skip(self, task, abort), fields(task_id = %task.task_id, slots = slots.len()))]
    pub async fn run_slots(
        &self,
        task: &TaskRecord,
        slots: &[u32],
        abort: &AbortHandle,
    ) -> Result<RunBatch> {
        // Raised by a slot whose store write failed; stops the others.
        let (fail_tx, _fail_rx) = watch::channel(false);
        let fail_flag = Arc::new(fail_tx);

        let mut handles = Vec::with_capacity(slots.len());
        for &run_index in slots {
            let Some(role) = self.config.role_for_slot(run_index as usize).cloned() else {
                return Err(MprgError::Config("no role variants configured".into()));
            };
            let slot = Slot {
                provider: Arc::clone(&self.provider),
                store: Arc::clone(&self.store),
                config: Arc::clone(&self.config),
                task_id: task.task_id.clone(),
                prompt: task.prompt.clone(),
                run_index,
                role,
            };
            let abort_rx = abort.subscribe();
            let fail_flag = Arc::clone(&fail_flag);

            METRICS.inc_runs_dispatched();
            let handle = tokio::spawn(async move {
                let fail_rx = fail_flag.subscribe();
                let result = slot.execute(abort_rx, fail_rx).await;
                if matches!(
                    result,
                    SlotResult::StoreFailed(_) | SlotResult::Unconfigured(_)
                ) {
                    fail_flag.send_replace(true);
                }
                result
            });
            handles.push((run_index, handle));
        }

        let (indices, handles): (Vec<u32>, Vec<_>) = handles.into_iter().unzip();
        let joined = join_all(handles).await;

        let mut batch = RunBatch::default();
        let mut store_error = None;
        let mut unconfigured = None;
        let mut lost = None;
        for (run_index, result) in indices.into_iter().zip(joined) {
            match result {
                Ok(SlotResult::Persisted(run)) => batch.runs.push(*run),
                Ok(SlotResult::Cancelled) => {}
                Ok(SlotResult::StoreFailed(e)) => {
                    store_error.get_or_insert(e);
                }
                Ok(SlotResult::Unconfigured(e)) => {
                    unconfigured.get_or_insert(e);
                }
                Err(e) => {
                    warn!(run_index, error = %e, "agent slot task failed to join");
                    lost.get_or_insert(MprgError::SlotLost {
                        run_index,
                        detail: e.to_string(),
                    });
                }
            }
        }
        batch.runs.sort_by_key(|r| r.run_index);
        batch.aborted = abort.is_aborted();

        if let Some(e) = store_error {
            return Err(MprgError::Persistence(e));
        }
        if let Some(e) = unconfigured {
            return Err(MprgError::ProviderUnavailable(e.to_string()));
        }
        if let Some(e) = lost {
            return Err(e);
        }
        Ok(batch)
    }
}

/// Everything one slot needs, moved into its tokio task.
struct Slot {
    provider: Arc<dyn ReasoningProvider>,
    store: Arc<dyn ReasoningStore>,
    config: Arc<MprgConfig>,
    task_id: mprg_state::TaskId,
    prompt: String,
    run_index: u32,
    role: RoleVariant,
}

impl Slot {
    async fn execute(
        self,
        abort_rx: watch::Receiver<bool>,
        fail_rx: watch::Receiver<bool>,
    ) -> SlotResult {
        let started = Instant::now();
        let cancelled = async move {
            tokio::select! {
                _ = raised(abort_rx) => {}
                _ = raised(fail_rx) => {}
            }
        };

        let record = tokio::select! {
            biased;
            _ = cancelled => return SlotResult::Cancelled,
            record = self.attempt_with_retry(started) => record,
        };
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(run_index = self.run_index, error = %e, "provider not configured, slot left open");
                return SlotResult::Unconfigured(e);
            }
        };

        if let Err(e) = self.store.upsert_run(&record).await {
            warn!(run_index = self.run_index, error = %e, "failed to persist run");
            return SlotResult::StoreFailed(e);
        }

        if !record.valid {
            METRICS.inc_runs_invalid();
        }
        obs::emit_run_completed(
            &self.task_id.0,
            record.run_index,
            &record.agent_role,
            record.valid,
            record.retry_count,
            record.elapsed_ms,
        );
        SlotResult::Persisted(Box::new(record))
    }

    async fn attempt_with_retry(
        &self,
        started: Instant,
    ) -> std::result::Result<RunRecord, ProviderError> {
        let mut variant = PromptVariant::Standard;
        let mut attempt = self.attempt(variant).await?;
        let mut retry_count = 0;

        if !attempt.outcome.is_valid() && self.config.effective_max_retries() > 0 {
            let reason = match &attempt.outcome {
                AgentOutcome::SchemaError(d) | AgentOutcome::TransportError(d) => d.as_str(),
                AgentOutcome::Valid(_) => "",
            };
            obs::emit_run_retry(&self.task_id.0, self.run_index, reason);
            METRICS.inc_runs_retried();

            variant = PromptVariant::JsonOnly;
            retry_count = 1;
            attempt = self.attempt(variant).await?;
        }

        let (summary, failure) = match attempt.outcome {
            AgentOutcome::Valid(summary) => (Some(summary), None),
            AgentOutcome::SchemaError(detail) => (
                None,
                Some(RunFailure {
                    kind: FailureKind::Schema,
                    detail,
                }),
            ),
            AgentOutcome::TransportError(detail) => (
                None,
                Some(RunFailure {
                    kind: FailureKind::Transport,
                    detail,
                }),
            ),
        };

        Ok(build_record(
            &self.task_id,
            self.run_index,
            &self.role.name,
            variant,
            attempt.raw,
            summary,
            failure,
            retry_count,
            started.elapsed().as_millis() as u64,
        ))
    }

    /// `Err` only for configuration failures; everything else is an outcome.
    async fn attempt(&self, variant: PromptVariant) -> std::result::Result<Attempt, ProviderError> {
        let prompt = build_prompt(&self.task_id.0, &self.prompt, &self.role, variant);
        let timeout = self.config.call_timeout();

        let response =
            match tokio::time::timeout(timeout, self.provider.invoke(&prompt, &self.role.name))
                .await
            {
                Ok(response) => response,
                Err(_) => Err(ProviderError::Timeout(self.config.call_timeout_secs)),
            };

        match response {
            Ok(raw) => {
                let outcome = validate_output(&raw, &self.task_id.0);
                Ok(Attempt { raw, outcome })
            }
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => Ok(Attempt {
                raw: String::new(),
                outcome: AgentOutcome::TransportError(e.to_string()),
            }),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    task_id: &mprg_state::TaskId,
    run_index: u32,
    role: &str,
    variant: PromptVariant,
    raw_output: String,
    summary: Option<ReasoningSummary>,
    failure: Option<RunFailure>,
    retry_count: u32,
    elapsed_ms: u64,
) -> RunRecord {
    RunRecord {
        run_id: RunId::for_slot(task_id, run_index),
        task_id: task_id.clone(),
        run_index,
        agent_role: role.to_string(),
        prompt_variant: variant.as_str().to_string(),
        raw_output,
        valid: summary.is_some(),
        summary,
        retry_count,
        embedding: None,
        elapsed_ms,
        failure,
        created_at: Utc::now(),
    }
}
