//! SurrealDB schema migrations and initialization
//!
//! Sets up the MPRG tables and their indexes. Every definition uses
//! `IF NOT EXISTS`, so running it against an initialized database is a no-op.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all MPRG tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing MPRG SurrealDB schema");

    init_tasks_table(db).await?;
    init_runs_table(db).await?;
    init_families_table(db).await?;
    init_leases_table(db).await?;

    info!("MPRG schema initialization complete");
    Ok(())
}

/// Initialize `tasks` table
///
/// Schema:
/// ```text
/// TABLE tasks {
///   task_id:        STRING (unique; also the record key)
///   prompt:         STRING
///   prompt_digest:  STRING (indexed; same-prompt lookup)
///   status:         STRING (PENDING | RUNNING | CLUSTERING | SCORED | DONE | FAILED)
///   agent_count:    INT
///   verdict:        STRING?
///   family_count:   INT?
///   total_runs:     INT
///   valid_runs:     INT
///   answers_agree:  BOOL?
///   error:          STRING?
///   created_at:     DATETIME (indexed)
///   updated_at:     DATETIME
/// }
/// ```
async fn init_tasks_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing tasks table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS tasks SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_task_id ON TABLE tasks COLUMNS task_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_task_status ON TABLE tasks COLUMNS status;
        DEFINE INDEX IF NOT EXISTS idx_task_prompt_digest ON TABLE tasks COLUMNS prompt_digest;
        DEFINE INDEX IF NOT EXISTS idx_task_created_at ON TABLE tasks COLUMNS created_at;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ tasks table initialized");
    Ok(())
}

/// Initialize `runs` table
///
/// Constraints:
/// - `run_id` is unique (`<task_id>:<run_index>`), so a re-dispatched slot
///   overwrites instead of duplicating
/// - `(task_id, run_index)` is indexed for ordered listing
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_task_slot ON TABLE runs COLUMNS task_id, run_index UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_run_agent_role ON TABLE runs COLUMNS agent_role;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ runs table initialized");
    Ok(())
}

/// Initialize `families` table
async fn init_families_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing families table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS families SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_family_task ON TABLE families COLUMNS task_id;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ families table initialized");
    Ok(())
}

/// Initialize `leases` table
///
/// One row per claimed task; the record key is the task id, so `CREATE`
/// fails while a lease row exists.
async fn init_leases_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing leases table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS leases SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_lease_task ON TABLE leases COLUMNS task_id UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ leases table initialized");
    Ok(())
}
