//! MPRG-State: persistence for the Multi-Path Reasoning Gate
//!
//! This crate owns the records the reasoning pipeline writes while it works
//! (tasks, per-agent runs and reasoning families) and the store they live in.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: keyed upserts, crash-safe replay, at-most-one orchestration per task.
//!
//! ## Key Components
//!
//! - `ReasoningStore`: the storage trait consumed by the core
//! - `MemoryReasoningStore`: in-memory fake for tests
//! - `SurrealReasoningStore`: SurrealDB-backed implementation

pub mod connection;
mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use fakes::MemoryReasoningStore;
pub use storage_traits::{
    ContentDigest, FailureKind, FamilyRecord, FamilySignature, ReasoningStore, ReasoningSummary,
    RunFailure, RunId, RunRecord, StorageResult, TaskId, TaskRecord, TaskStatus, Verdict,
};
pub use surreal_store::SurrealReasoningStore;

/// Result type for mprg-state setup operations
pub type Result<T> = std::result::Result<T, StateError>;
