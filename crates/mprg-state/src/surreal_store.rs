//! SurrealDB-backed ReasoningStore implementation
//!
//! Uses the row types in `schema` for persistence, converting to/from
//! `storage_traits` records at the boundary. Tasks, runs and leases live under
//! deterministic record keys, so every write is an `UPSERT`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::connection;
use crate::error::StorageError;
use crate::schema::{FamilyRow, LeaseRow, RunRow, TaskRow};
use crate::storage_traits::{
    ContentDigest, FamilyRecord, ReasoningStore, RunRecord, StorageResult, TaskId, TaskRecord,
};

/// SurrealDB-backed implementation of [`ReasoningStore`].
#[derive(Clone)]
pub struct SurrealReasoningStore {
    db: Surreal<Any>,
}

impl SurrealReasoningStore {
    /// Wrap an already-connected database. The schema must be initialized.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = connection::connect_url("mem://").await?;
        info!("SurrealReasoningStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables (see [`connection::connect_from_env`]).
    pub async fn from_env() -> crate::Result<Self> {
        let db = connection::connect_from_env().await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    /// Run a single-statement query and decode the first result set.
    async fn select_rows<T>(
        &self,
        sql: &'static str,
        bindings: Vec<(&'static str, serde_json::Value)>,
    ) -> StorageResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut query = self.db.query(sql);
        for binding in bindings {
            query = query.bind(binding);
        }
        let mut res = query.await.map_err(backend)?;
        res.take(0).map_err(backend)
    }
}

fn backend(err: surrealdb::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[async_trait]
impl ReasoningStore for SurrealReasoningStore {
    async fn upsert_task(&self, task: &TaskRecord) -> StorageResult<()> {
        let row = TaskRow::from(task);
        debug!(task_id = %task.task_id, status = %task.status, "upserting task");

        self.db
            .query("UPSERT type::thing('tasks', $id) CONTENT $row")
            .bind(("id", task.task_id.0.clone()))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> StorageResult<Option<TaskRecord>> {
        let rows: Vec<TaskRow> = self
            .select_rows(
                "SELECT * FROM tasks WHERE task_id = $id",
                vec![("id", serde_json::Value::String(task_id.0.clone()))],
            )
            .await?;

        rows.into_iter().next().map(TaskRecord::try_from).transpose()
    }

    async fn list_tasks(&self, limit: usize) -> StorageResult<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = self
            .select_rows(
                "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $limit",
                vec![("limit", serde_json::Value::from(limit as u64))],
            )
            .await?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn find_tasks_by_prompt(
        &self,
        digest: &ContentDigest,
        limit: usize,
    ) -> StorageResult<Vec<TaskRecord>> {
        let rows: Vec<TaskRow> = self
            .select_rows(
                "SELECT * FROM tasks WHERE prompt_digest = $digest \
                 ORDER BY created_at DESC LIMIT $limit",
                vec![
                    ("digest", serde_json::Value::String(digest.as_str().to_string())),
                    ("limit", serde_json::Value::from(limit as u64)),
                ],
            )
            .await?;

        rows.into_iter().map(TaskRecord::try_from).collect()
    }

    async fn upsert_run(&self, run: &RunRecord) -> StorageResult<()> {
        let row = RunRow::from(run);
        debug!(run_id = %run.run_id, valid = run.valid, "upserting run");

        self.db
            .query("UPSERT type::thing('runs', $id) CONTENT $row")
            .bind(("id", run.run_id.0.clone()))
            .bind(("row", row))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn list_runs(&self, task_id: &TaskId) -> StorageResult<Vec<RunRecord>> {
        let rows: Vec<RunRow> = self
            .select_rows(
                "SELECT * FROM runs WHERE task_id = $tid ORDER BY run_index ASC",
                vec![("tid", serde_json::Value::String(task_id.0.clone()))],
            )
            .await?;

        Ok(rows.into_iter().map(RunRecord::from).collect())
    }

    async fn upsert_families(
        &self,
        task_id: &TaskId,
        families: &[FamilyRecord],
    ) -> StorageResult<()> {
        let rows: Vec<FamilyRow> = families
            .iter()
            .enumerate()
            .map(|(i, f)| FamilyRow::from_record(f, i as u32))
            .collect();
        debug!(task_id = %task_id, families = rows.len(), "replacing families");

        let tid = task_id.0.clone();
        let response = if rows.is_empty() {
            self.db
                .query("DELETE families WHERE task_id = $tid")
                .bind(("tid", tid))
                .await
        } else {
            self.db
                .query(
                    "BEGIN TRANSACTION; \
                     DELETE families WHERE task_id = $tid; \
                     INSERT INTO families $rows; \
                     COMMIT TRANSACTION;",
                )
                .bind(("tid", tid))
                .bind(("rows", rows))
                .await
        };

        response.map_err(backend)?.check().map_err(backend)?;
        Ok(())
    }

    async fn list_families(&self, task_id: &TaskId) -> StorageResult<Vec<FamilyRecord>> {
        let rows: Vec<FamilyRow> = self
            .select_rows(
                "SELECT * FROM families WHERE task_id = $tid ORDER BY position ASC",
                vec![("tid", serde_json::Value::String(task_id.0.clone()))],
            )
            .await?;

        Ok(rows.into_iter().map(FamilyRecord::from).collect())
    }

    async fn claim_task(
        &self,
        task_id: &TaskId,
        owner: &str,
        ttl: Duration,
    ) -> StorageResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let lease = LeaseRow {
            task_id: task_id.0.clone(),
            owner: owner.to_string(),
            expires_at_ms: now_ms + ttl.as_millis() as i64,
        };

        // CREATE fails when a lease row already exists for this task.
        let mut created = self
            .db
            .query("CREATE type::thing('leases', $id) CONTENT $lease")
            .bind(("id", task_id.0.clone()))
            .bind(("lease", lease.clone()))
            .await
            .map_err(backend)?;
        let fresh: Result<Vec<LeaseRow>, _> = created.take(0);
        if matches!(fresh, Ok(ref rows) if !rows.is_empty()) {
            debug!(task_id = %task_id, owner, "lease created");
            return Ok(true);
        }

        // Take over only if we already own it or it has expired.
        let mut updated = self
            .db
            .query(
                "UPDATE type::thing('leases', $id) \
                 SET owner = $owner, expires_at_ms = $expires \
                 WHERE owner = $owner OR expires_at_ms < $now \
                 RETURN AFTER",
            )
            .bind(("id", task_id.0.clone()))
            .bind(("owner", lease.owner))
            .bind(("expires", lease.expires_at_ms))
            .bind(("now", now_ms))
            .await
            .map_err(backend)?;
        let rows: Vec<LeaseRow> = updated.take(0).map_err(backend)?;

        debug!(task_id = %task_id, owner, claimed = !rows.is_empty(), "lease takeover attempted");
        Ok(!rows.is_empty())
    }

    async fn steal_task(&self, task_id: &TaskId, owner: &str, ttl: Duration) -> StorageResult<()> {
        let lease = LeaseRow {
            task_id: task_id.0.clone(),
            owner: owner.to_string(),
            expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        };
        debug!(task_id = %task_id, owner, "stealing lease");

        self.db
            .query("UPSERT type::thing('leases', $id) CONTENT $lease")
            .bind(("id", task_id.0.clone()))
            .bind(("lease", lease))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn release_task(&self, task_id: &TaskId, owner: &str) -> StorageResult<()> {
        self.db
            .query("DELETE type::thing('leases', $id) WHERE owner = $owner")
            .bind(("id", task_id.0.clone()))
            .bind(("owner", owner.to_string()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }
}
