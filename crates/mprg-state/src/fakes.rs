//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryReasoningStore` satisfies the `ReasoningStore` contract without any
//! external dependencies. It can be flipped "unavailable" to simulate an
//! unreachable backend, and counts writes so tests can assert on them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at_ms: i64,
}

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<String, TaskRecord>,
    runs: HashMap<String, RunRecord>,
    families: HashMap<String, Vec<FamilyRecord>>,
    leases: HashMap<String, Lease>,
}

/// In-memory reasoning store backed by `HashMap`s behind one mutex.
#[derive(Debug, Default)]
pub struct MemoryReasoningStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    run_writes: AtomicU64,
}

impl MemoryReasoningStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StorageError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `upsert_run` calls that succeeded.
    pub fn run_writes(&self) -> u64 {
        self.run_writes.load(Ordering::SeqCst)
    }

    fn tables(&self) -> StorageResult<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "memory store switched off".to_string(),
            ));
        }
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ReasoningStore for MemoryReasoningStore {
    async fn upsert_task(&self, task: &TaskRecord) -> StorageResult<()> {
        let mut tables = self.tables()?;
        tables.tasks.insert(task.task_id.0.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>> {
        let tables = self.tables()?;
        Ok(tables.tasks.get(&task_id.0).cloned())
    }

    async fn list_tasks(&self, limit: usize) -> StorageResult<Vec<TaskRecord>> {
        let tables = self.tables()?;
        let mut tasks: Vec<TaskRecord> = tables.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn find_tasks_by_prompt(
        &self,
        digest: &ContentDigest,
        limit: usize,
    ) -> StorageResult<Vec<TaskRecord>> {
        let tables = self.tables()?;
        let mut tasks: Vec<TaskRecord> = tables
            .tasks
            .values()
            .filter(|t| t.prompt_digest == *digest)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn upsert_run(&self, run: &RunRecord) -> StorageResult<()> {
        let mut tables = self.tables()?;
        tables.runs.insert(run.run_id.0.clone(), run.clone());
        self.run_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_runs(&self, task_id: &TaskId) -> StorageResult<Vec<RunRecord>> {
        let tables = self.tables()?;
        let mut runs: Vec<RunRecord> = tables
            .runs
            .values()
            .filter(|r| r.task_id == *task_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.run_index);
        Ok(runs)
    }

    async fn upsert_families(
        &self,
        task_id: &TaskId,
        families: &[FamilyRecord],
    ) -> StorageResult<()> {
        let mut tables = self.tables()?;
        tables
            .families
            .insert(task_id.0.clone(), families.to_vec());
        Ok(())
    }

    async fn list_families(&self, task_id: &TaskId) -> StorageResult<Vec<FamilyRecord>> {
        let tables = self.tables()?;
        Ok(tables.families.get(&task_id.0).cloned().unwrap_or_default())
    }

    async fn claim_task(
        &self,
        task_id: &TaskId,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let mut tables = self.tables()?;
        let now_ms = Utc::now().timestamp_millis();
        if let Some(lease) = tables.leases.get(&task_id.0) {
            if lease.owner != owner && lease.expires_at_ms > now_ms {
                return Ok(false);
            }
        }
        tables.leases.insert(
            task_id.0.clone(),
            Lease {
                owner: owner.to_string(),
                expires_at_ms: now_ms + ttl.as_millis() as i64,
            },
        );
        Ok(true)
    }

    async fn steal_task(&self, task_id: &TaskId, owner: &str, ttl: Duration) -> StorageResult<()> {
        let mut tables = self.tables()?;
        let expires_at_ms = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
        tables.leases.insert(
            task_id.0.clone(),
            Lease {
                owner: owner.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn release_task(&self, task_id: &TaskId, owner: &str) -> StorageResult<()> {
        let mut tables = self.tables()?;
        if tables
            .leases
            .get(&task_id.0)
            .is_some_and(|lease| lease.owner == owner)
        {
            tables.leases.remove(&task_id.0);
        }
        Ok(())
    }
}
