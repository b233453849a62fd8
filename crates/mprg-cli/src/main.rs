//! MPRG - Multi-Path Reasoning Gate CLI
//!
//! The `mprg` command fans a task out to several agents, clusters their
//! reasoning into families and reports whether the plan is robust.
//!
//! ## Commands
//!
//! - `run`: submit a task and drive it to a verdict
//! - `resume`: continue an interrupted task from its persisted state
//! - `show`: print a task with its runs, families and verdict
//! - `list`: recent tasks, newest first
//! - `gate`: print (or override) the gate decision of a scored task
//! - `cluster`: re-cluster exported runs offline
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};

use mprg_core::{
    answers_agree, AbortHandle, AnthropicConfig, AnthropicProvider, EmbeddingProvider,
    ExecutionGate, FamilyClusterer, GateResult, LexicalEmbedder, MprgConfig, OpenAiChatProvider,
    OpenAiConfig, OpenAiEmbeddingProvider, Orchestrator, ProviderError, ProviderKind,
    ReasoningProvider, RobustnessReport, RobustnessScorer, TaskInspection, TaskOutcome,
    Thresholds, VoyageConfig, VoyageEmbeddingProvider,
};
use mprg_state::{
    FamilyRecord, MemoryReasoningStore, ReasoningStore, RunRecord, SurrealReasoningStore, TaskId,
    TaskRecord,
};

#[derive(Parser)]
#[command(name = "mprg")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-Path Reasoning Gate (MPRG)", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file (MPRG_* environment variables still apply)
    #[arg(short, long, global = true, env = "MPRG_CONFIG")]
    config: Option<PathBuf>,

    /// Result format on stdout
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    /// Reasoning backend for agent calls: openai or anthropic
    #[arg(long, global = true, env = "MPRG_PROVIDER", default_value = "openai", value_parser = parse_provider)]
    provider: ProviderKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task and drive it to a verdict
    Run {
        /// Task prompt given to every agent
        prompt: String,

        /// Number of agents (overrides configuration)
        #[arg(short, long)]
        agents: Option<usize>,
    },

    /// Continue an interrupted task
    Resume {
        /// Task ID
        task_id: String,

        /// Break the lease of an orchestrator that is known to have died
        #[arg(long)]
        steal_lease: bool,
    },

    /// Show a task with its runs, families and verdict
    Show {
        /// Task ID
        task_id: String,
    },

    /// List recent tasks
    List {
        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Only tasks submitted with exactly this prompt
        #[arg(long)]
        prompt: Option<String>,
    },

    /// Print the gate decision of a scored task
    Gate {
        /// Task ID
        task_id: String,

        /// Force an overridable BLOCK to ALLOW, recording this confirmation.
        /// Advisory only: nothing is persisted.
        #[arg(long = "override", value_name = "CONFIRMATION")]
        confirmation: Option<String>,
    },

    /// Re-cluster exported runs offline with the lexical embedder
    Cluster {
        /// JSON file: an array of runs, or the output of `show --output json`
        path: PathBuf,

        /// Plan cosine threshold (overrides configuration)
        #[arg(long)]
        plan_threshold: Option<f64>,

        /// Assumption Jaccard threshold (overrides configuration)
        #[arg(long)]
        assumption_threshold: Option<f64>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    mprg_core::init_tracing(cli.json, level);

    let mut config = load_config(cli.config.as_deref())?;
    let output = cli.output;

    match cli.command {
        Commands::Config => cmd_config(&config),
        Commands::Cluster {
            path,
            plan_threshold,
            assumption_threshold,
        } => {
            if let Some(t) = plan_threshold {
                config.plan_similarity_threshold = t;
            }
            if let Some(t) = assumption_threshold {
                config.assumption_similarity_threshold = t;
            }
            config.validate()?;
            cmd_cluster(&config, &path, output).await
        }
        command => {
            if let Commands::Run {
                agents: Some(n), ..
            } = &command
            {
                config.agent_count = *n;
            }

            let store: Arc<dyn ReasoningStore> = Arc::new(
                SurrealReasoningStore::from_env()
                    .await
                    .context("Failed to connect to MPRG database")?,
            );
            let requires_agents = matches!(command, Commands::Run { .. });
            let orchestrator = build_orchestrator(config, store, cli.provider, requires_agents)?;

            match command {
                Commands::Run { prompt, .. } => cmd_run(&orchestrator, &prompt, output).await,
                Commands::Resume {
                    task_id,
                    steal_lease,
                } => cmd_resume(&orchestrator, &TaskId(task_id), steal_lease, output).await,
                Commands::Show { task_id } => {
                    cmd_show(&orchestrator, &TaskId(task_id), output).await
                }
                Commands::List { limit, prompt } => {
                    cmd_list(&orchestrator, limit, prompt.as_deref(), output).await
                }
                Commands::Gate {
                    task_id,
                    confirmation,
                } => {
                    cmd_gate(
                        &orchestrator,
                        &TaskId(task_id),
                        confirmation.as_deref(),
                        output,
                    )
                    .await
                }
                Commands::Cluster { .. } | Commands::Config => Ok(()),
            }
        }
    }
}

/// Defaults, then the optional TOML file, then `MPRG_*` overrides.
fn load_config(path: Option<&Path>) -> Result<MprgConfig> {
    let config = match path {
        Some(path) => MprgConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => MprgConfig::from_env().context("Invalid MPRG_* environment configuration")?,
    };
    Ok(config)
}

fn parse_provider(s: &str) -> std::result::Result<ProviderKind, String> {
    ProviderKind::parse(s).ok_or_else(|| format!("unknown provider {s:?} (openai, anthropic)"))
}

/// Stand-in when the selected backend has no API key. Commands that only
/// read stored tasks never call it; a resume that still has open slots gets
/// `MissingApiKey`, which leaves the task RUNNING with those slots unwritten.
struct Unconfigured(&'static str);

#[async_trait]
impl ReasoningProvider for Unconfigured {
    fn name(&self) -> &'static str {
        "unconfigured"
    }

    async fn invoke(&self, _prompt: &str, _role: &str) -> Result<String, ProviderError> {
        Err(ProviderError::MissingApiKey(self.0))
    }
}

fn reasoning_provider(
    kind: ProviderKind,
    requires_agents: bool,
) -> Result<Arc<dyn ReasoningProvider>> {
    let provider: Option<Arc<dyn ReasoningProvider>> = match kind {
        ProviderKind::OpenAi => {
            let config = OpenAiConfig::from_env();
            match config.api_key {
                Some(_) => Some(Arc::new(OpenAiChatProvider::new(config)?)),
                None => None,
            }
        }
        ProviderKind::Anthropic => {
            let config = AnthropicConfig::from_env();
            match config.api_key {
                Some(_) => Some(Arc::new(AnthropicProvider::new(config)?)),
                None => None,
            }
        }
    };

    match provider {
        Some(provider) => Ok(provider),
        None if requires_agents => bail!(
            "{} is not set; no {} reasoning provider is available",
            kind.key_var(),
            kind.as_str()
        ),
        None => Ok(Arc::new(Unconfigured(kind.key_var()))),
    }
}

/// Voyage when `VOYAGE_API_KEY` is set, then OpenAI, else the offline embedder.
fn embedding_provider() -> Result<Arc<dyn EmbeddingProvider>> {
    let voyage = VoyageConfig::from_env();
    if voyage.api_key.is_some() {
        return Ok(Arc::new(VoyageEmbeddingProvider::new(voyage)?));
    }
    let openai = OpenAiConfig::from_env();
    if openai.api_key.is_some() {
        return Ok(Arc::new(OpenAiEmbeddingProvider::new(openai)?));
    }
    info!("no embedding API key set, using the lexical embedder");
    Ok(Arc::new(LexicalEmbedder::default()))
}

fn build_orchestrator(
    config: MprgConfig,
    store: Arc<dyn ReasoningStore>,
    kind: ProviderKind,
    requires_agents: bool,
) -> Result<Orchestrator> {
    let provider = reasoning_provider(kind, requires_agents)?;
    let embedder = embedding_provider()?;
    info!(
        provider = provider.name(),
        embedder = embedder.name(),
        "collaborators selected"
    );
    Ok(Orchestrator::new(config, provider, embedder, store)?)
}

/// Abort the task on Ctrl-C.
fn abort_on_interrupt() -> AbortHandle {
    let abort = AbortHandle::new();
    let trigger = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting task");
            trigger.abort();
        }
    });
    abort
}

async fn cmd_run(orchestrator: &Orchestrator, prompt: &str, output: OutputFormat) -> Result<()> {
    let abort = abort_on_interrupt();
    let outcome = orchestrator
        .submit_and_run(prompt, &abort)
        .await
        .context("Task could not be run")?;
    print_outcome(&outcome, output)
}

async fn cmd_resume(
    orchestrator: &Orchestrator,
    task_id: &TaskId,
    steal_lease: bool,
    output: OutputFormat,
) -> Result<()> {
    let abort = abort_on_interrupt();
    let outcome = if steal_lease {
        orchestrator.take_over(task_id, &abort).await
    } else {
        orchestrator.execute(task_id, &abort).await
    }
    .with_context(|| format!("Task {task_id} could not be resumed"))?;
    print_outcome(&outcome, output)
}

async fn cmd_show(orchestrator: &Orchestrator, task_id: &TaskId, output: OutputFormat) -> Result<()> {
    let inspection = orchestrator.inspect(task_id).await?;
    match output {
        OutputFormat::Json => print_json(&inspection),
        OutputFormat::Text => {
            print_inspection(&inspection);
            Ok(())
        }
    }
}

async fn cmd_list(
    orchestrator: &Orchestrator,
    limit: usize,
    prompt: Option<&str>,
    output: OutputFormat,
) -> Result<()> {
    let tasks = match prompt {
        Some(prompt) => orchestrator.tasks_with_prompt(prompt, limit).await?,
        None => orchestrator.list_tasks(limit).await?,
    };
    if output == OutputFormat::Json {
        return print_json(&tasks);
    }

    if tasks.is_empty() {
        println!("No tasks found");
        return Ok(());
    }
    for task in tasks {
        let verdict = task.verdict.map(|v| v.as_str()).unwrap_or("-");
        println!(
            "{}  {:<10}  {:<17}  {}  {}",
            task.task_id,
            task.status.as_str(),
            verdict,
            task.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            first_line(&task.prompt, 60),
        );
    }
    Ok(())
}

async fn cmd_gate(
    orchestrator: &Orchestrator,
    task_id: &TaskId,
    confirmation: Option<&str>,
    output: OutputFormat,
) -> Result<()> {
    let inspection = orchestrator.inspect(task_id).await?;
    let Some(gate) = inspection.gate else {
        bail!(
            "Task {} has not been scored yet (status {})",
            task_id,
            inspection.task.status
        );
    };

    let gate = match confirmation {
        Some(confirmation) => {
            if !gate.can_override {
                warn!(decision = %gate.decision, "gate decision cannot be overridden");
            }
            orchestrator.gate().override_decision(&gate, confirmation)
        }
        None => gate,
    };

    match output {
        OutputFormat::Json => print_json(&gate),
        OutputFormat::Text => {
            print_gate(task_id, &gate);
            Ok(())
        }
    }
}

/// Runs as written by `show --output json`, or a bare array of runs.
#[derive(Deserialize)]
#[serde(untagged)]
enum RunExport {
    Runs(Vec<RunRecord>),
    Inspection { runs: Vec<RunRecord> },
}

#[derive(Debug, Serialize)]
struct ClusterOutput {
    families: Vec<FamilyRecord>,
    report: RobustnessReport,
    gate: GateResult,
}

async fn cluster_file(config: &MprgConfig, path: &Path) -> Result<ClusterOutput> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read runs from {}", path.display()))?;
    let export: RunExport = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a run export", path.display()))?;
    let mut runs = match export {
        RunExport::Runs(runs) | RunExport::Inspection { runs } => runs,
    };

    let Some(task_id) = runs.first().map(|r| r.task_id.clone()) else {
        bail!("{} contains no runs", path.display());
    };
    if let Some(other) = runs.iter().find(|r| r.task_id != task_id) {
        bail!(
            "runs belong to more than one task ({} and {})",
            task_id,
            other.task_id
        );
    }

    // Scratch store: recomputed embeddings are not written back to the file.
    let store = MemoryReasoningStore::new();
    let clusterer = FamilyClusterer::new(
        Arc::new(LexicalEmbedder::default()),
        Thresholds::from(config),
    );
    let families = clusterer.cluster(&store, &task_id, &mut runs).await?;
    let report = RobustnessScorer::new(config.verdict_tiers).score(
        runs.len(),
        &runs,
        &families,
        answers_agree(&runs),
    );
    let gate = ExecutionGate::new(config.strict_gate).evaluate(&report);

    Ok(ClusterOutput {
        families,
        report,
        gate,
    })
}

async fn cmd_cluster(config: &MprgConfig, path: &Path, output: OutputFormat) -> Result<()> {
    let result = cluster_file(config, path).await?;
    match output {
        OutputFormat::Json => print_json(&result),
        OutputFormat::Text => {
            println!(
                "Thresholds: plan >= {:.2}, assumptions >= {:.2}",
                config.plan_similarity_threshold, config.assumption_similarity_threshold
            );
            print_report(&result.report);
            println!();
            println!("Gate: {} - {}", result.gate.decision, result.gate.reason);
            Ok(())
        }
    }
}

fn cmd_config(config: &MprgConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let cut: String = line.chars().take(max).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn print_task_header(task: &TaskRecord) {
    println!("Task {}  [{}]", task.task_id, task.status);
    println!("Prompt: {}", first_line(&task.prompt, 100));
    if let Some(error) = &task.error {
        println!("Error:  {error}");
    }
}

fn print_report(report: &RobustnessReport) {
    println!(
        "Verdict: {} (confidence {:.2})",
        report.verdict, report.confidence
    );
    println!(
        "Agents:  {} dispatched, {} valid, {} reasoning families",
        report.total_agents, report.valid_runs, report.family_count
    );
    println!();
    println!("{}", report.explanation);
    println!("Recommendation: {}", report.recommendation);

    for family in &report.breakdown {
        println!();
        println!(
            "Family {} ({} run{}), representative {}",
            family.family_number,
            family.member_count,
            if family.member_count == 1 { "" } else { "s" },
            family.representative_run_id
        );
        println!("  {}", family.signature);
    }
}

fn print_gate(task_id: &TaskId, gate: &GateResult) {
    println!("Gate: {}", gate.decision);
    println!("  {}", gate.reason);
    println!("  {}", gate.action);
    if let Some(suggestion) = &gate.suggestion {
        println!("  Suggestion: {suggestion}");
    }
    if let Some(warning) = &gate.override_warning {
        println!("  Warning: {warning}");
    }
    if gate.can_override {
        println!("  Override with: mprg gate {task_id} --override \"<confirmation>\"");
    }
}

fn print_outcome(outcome: &TaskOutcome, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        return print_json(outcome);
    }

    print_task_header(&outcome.task);
    if let Some(report) = &outcome.report {
        println!();
        print_report(report);
    }
    if let Some(gate) = &outcome.gate {
        println!();
        print_gate(&outcome.task.task_id, gate);
    }
    Ok(())
}

fn print_inspection(inspection: &TaskInspection) {
    print_task_header(&inspection.task);
    println!(
        "Runs:   {}/{} recorded",
        inspection.runs.len(),
        inspection.task.agent_count
    );
    for run in &inspection.runs {
        let status = match (&run.failure, run.valid) {
            (_, true) => "valid".to_string(),
            (Some(failure), false) => format!("invalid: {}", failure.detail),
            (None, false) => "invalid".to_string(),
        };
        let retried = if run.retry_count > 0 { " (retried)" } else { "" };
        println!(
            "  #{} {:<20} {}ms  {}{}",
            run.run_index, run.agent_role, run.elapsed_ms, status, retried
        );
    }

    if let Some(report) = &inspection.report {
        println!();
        print_report(report);
    }
    if let Some(gate) = &inspection.gate {
        println!();
        print_gate(&inspection.task.task_id, gate);
    }
}
