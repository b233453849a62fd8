//! MPRG Core: the Multi-Path Reasoning Gate
//!
//! Fans a task out to several independently-prompted agents, groups their
//! structured reasoning into families of equivalent logic, and turns the
//! family count into a robustness verdict and an advisory gate decision.
//!
//! Agreement between agents only counts when it is reached by different
//! reasoning: five agents restating one plan form a single family.

pub mod cluster;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod prompt;
pub mod provider;
pub mod runner;
pub mod scorer;
pub mod similarity;
pub mod telemetry;
pub mod validation;

pub use cluster::{answers_agree, build_signature, cluster_runs, FamilyClusterer, Thresholds};
pub use config::{default_roles, MprgConfig, RoleVariant, VerdictTiers};
pub use error::{AgentOutcome, MprgError, ProviderError, Result};
pub use gate::{ExecutionGate, GateDecision, GateResult};
pub use orchestrator::{Orchestrator, TaskInspection, TaskOutcome};
pub use prompt::{build_prompt, PromptVariant};
pub use provider::{
    AnthropicConfig, AnthropicProvider, EmbeddingProvider, LexicalEmbedder, OpenAiChatProvider,
    OpenAiConfig, OpenAiEmbeddingProvider, ProviderKind, ReasoningProvider, VoyageConfig,
    VoyageEmbeddingProvider,
};
pub use runner::{AbortHandle, AgentRunner, RunBatch};
pub use scorer::{FamilyBreakdown, RobustnessReport, RobustnessScorer};
pub use similarity::{cosine_similarity, jaccard_similarity, normalize_assumption};
pub use telemetry::init_tracing;
pub use validation::validate_output;

pub use mprg_state::{
    FamilyRecord, ReasoningStore, ReasoningSummary, RunRecord, TaskId, TaskRecord, TaskStatus,
    Verdict,
};
