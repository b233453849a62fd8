//! Reasoning-family clustering.
//!
//! Valid runs are linked pairwise when their plan embeddings are close enough
//! (cosine) **or** their assumption sets overlap enough (Jaccard); families
//! are the connected components of that graph. A clustering pass is a full
//! recompute from the runs it is given, and its result depends only on the
//! runs and thresholds, never on the order they arrive in.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, instrument};

use mprg_state::{FamilyRecord, FamilySignature, ReasoningStore, RunRecord, TaskId};

use crate::config::MprgConfig;
use crate::error::{MprgError, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::provider::EmbeddingProvider;
use crate::similarity::{
    assumption_set, cosine_similarity, jaccard_similarity, normalize_assumption, PairSimilarity,
};

/// Link thresholds for one clustering pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub plan: f64,
    pub assumption: f64,
}

impl From<&MprgConfig> for Thresholds {
    fn from(config: &MprgConfig) -> Self {
        Self {
            plan: config.plan_similarity_threshold,
            assumption: config.assumption_similarity_threshold,
        }
    }
}

/// Union-find whose root is always the smallest index in the set.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut idx: usize) -> usize {
        while self.parent[idx] != idx {
            self.parent[idx] = self.parent[self.parent[idx]];
            idx = self.parent[idx];
        }
        idx
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[high] = low;
        }
    }
}

/// Partition the valid runs among `runs` into reasoning families.
///
/// Invalid runs are ignored. Every valid run must carry an embedding, and all
/// embeddings must have the same length.
///
/// Output order is deterministic: members by `run_index`, families by their
/// lowest member `run_index`, ids `family_1`, `family_2`, ...
pub fn cluster_runs(
    task_id: &TaskId,
    runs: &[RunRecord],
    thresholds: Thresholds,
) -> Result<Vec<FamilyRecord>> {
    let mut valid: Vec<&RunRecord> = runs.iter().filter(|r| r.valid_summary().is_some()).collect();
    valid.sort_by_key(|r| r.run_index);

    let mut embeddings = Vec::with_capacity(valid.len());
    for run in &valid {
        let embedding = run.embedding.as_deref().ok_or_else(|| {
            MprgError::Embedding(format!("run {} has no plan embedding", run.run_id))
        })?;
        embeddings.push(embedding);
    }
    if let Some(first) = embeddings.first() {
        if let Some(bad) = embeddings.iter().position(|e| e.len() != first.len()) {
            return Err(MprgError::Embedding(format!(
                "embedding dimension mismatch: {} vs {} (run {})",
                first.len(),
                embeddings[bad].len(),
                valid[bad].run_id
            )));
        }
    }

    let assumptions: Vec<BTreeSet<String>> = valid
        .iter()
        .map(|r| {
            r.valid_summary()
                .map(|s| assumption_set(&s.assumptions))
                .unwrap_or_default()
        })
        .collect();

    let n = valid.len();
    let mut pairs = vec![vec![None; n]; n];
    let mut uf = UnionFind::new(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = PairSimilarity {
                plan: cosine_similarity(embeddings[i], embeddings[j]),
                assumptions: jaccard_similarity(&assumptions[i], &assumptions[j]),
            };
            if sim.is_linked(thresholds.plan, thresholds.assumption) {
                uf.union(i, j);
            }
            pairs[i][j] = Some(sim);
            pairs[j][i] = Some(sim);
        }
    }

    let mut components: Vec<(usize, Vec<usize>)> = Vec::new();
    let mut slot_of_root: HashMap<usize, usize> = HashMap::new();
    for idx in 0..n {
        let root = uf.find(idx);
        let slot = *slot_of_root.entry(root).or_insert_with(|| {
            components.push((root, Vec::new()));
            components.len() - 1
        });
        components[slot].1.push(idx);
    }

    let families = components
        .into_iter()
        .enumerate()
        .map(|(number, (_, members))| {
            let representative = pick_representative(&members, &pairs);
            let member_runs: Vec<&RunRecord> = members.iter().map(|&m| valid[m]).collect();
            FamilyRecord {
                family_id: format!("family_{}", number + 1),
                task_id: task_id.clone(),
                member_run_ids: member_runs.iter().map(|r| r.run_id.clone()).collect(),
                representative_run_id: valid[representative].run_id.clone(),
                signature: build_signature(&member_runs, valid[representative]),
            }
        })
        .collect();

    Ok(families)
}

/// Member with the highest summed similarity to the rest of its family.
/// `members` is in run-index order, so the strict `>` keeps the earliest on ties.
fn pick_representative(members: &[usize], pairs: &[Vec<Option<PairSimilarity>>]) -> usize {
    let mut best = members[0];
    let mut best_score = f64::MIN;
    for &m in members {
        let score: f64 = members
            .iter()
            .filter(|&&o| o != m)
            .filter_map(|&o| pairs[m][o].map(|p| p.strength()))
            .sum();
        if score > best_score {
            best = m;
            best_score = score;
        }
    }
    best
}

/// Top three recurring assumptions plus the representative's leading steps.
pub fn build_signature(members: &[&RunRecord], representative: &RunRecord) -> FamilySignature {
    let mut counts: Vec<(String, String, usize)> = Vec::new();
    for run in members {
        let Some(summary) = run.valid_summary() else {
            continue;
        };
        for raw in &summary.assumptions {
            let normalized = normalize_assumption(raw);
            if normalized.is_empty() {
                continue;
            }
            match counts.iter_mut().find(|(n, _, _)| *n == normalized) {
                Some(entry) => entry.2 += 1,
                None => counts.push((normalized, raw.trim().to_string(), 1)),
            }
        }
    }
    // stable: equal counts keep first-seen order
    counts.sort_by(|a, b| b.2.cmp(&a.2));
    let top: Vec<&str> = counts.iter().take(3).map(|(_, label, _)| label.as_str()).collect();

    let (plan_steps, assumptions) = representative
        .valid_summary()
        .map(|s| (s.plan_steps.clone(), s.assumptions.clone()))
        .unwrap_or_default();
    let steps: Vec<&str> = plan_steps.iter().take(3).map(String::as_str).collect();

    let assumption_text = if top.is_empty() {
        "None".to_string()
    } else {
        top.join(", ")
    };
    let steps_text = if steps.is_empty() {
        "N/A".to_string()
    } else {
        steps.join(" | ")
    };

    FamilySignature {
        plan_steps,
        assumptions,
        summary: format!("Assumptions: {assumption_text} | Steps: {steps_text}"),
    }
}

/// Whether every valid run reached the same final answer (trimmed,
/// case-insensitive). `None` when there are no valid runs.
pub fn answers_agree(runs: &[RunRecord]) -> Option<bool> {
    let answers: BTreeSet<String> = runs
        .iter()
        .filter_map(|r| r.valid_summary())
        .map(|s| s.final_answer.trim().to_lowercase())
        .collect();
    if answers.is_empty() {
        None
    } else {
        Some(answers.len() == 1)
    }
}

/// Clusters the persisted runs of a task, computing missing plan embeddings
/// first.
pub struct FamilyClusterer {
    embedder: Arc<dyn EmbeddingProvider>,
    thresholds: Thresholds,
}

impl FamilyClusterer {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, thresholds: Thresholds) -> Self {
        Self {
            embedder,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Embed every valid run lacking an embedding of the embedder's
    /// dimension, writing each one back to the store.
    ///
    /// A cached embedding is reused across passes; one from a provider with a
    /// different dimension is recomputed.
    pub async fn ensure_embeddings(
        &self,
        store: &dyn ReasoningStore,
        runs: &mut [RunRecord],
    ) -> Result<()> {
        let dimension = self.embedder.dimension();
        for run in runs.iter_mut() {
            let Some(summary) = run.valid_summary() else {
                continue;
            };
            if run.embedding.as_ref().is_some_and(|e| e.len() == dimension) {
                continue;
            }
            let embedding = self
                .embedder
                .embed(&summary.plan_text())
                .await
                .map_err(|e| MprgError::Embedding(format!("run {}: {e}", run.run_id)))?;
            if embedding.len() != dimension {
                return Err(MprgError::Embedding(format!(
                    "{} returned {} values, expected {dimension}",
                    self.embedder.name(),
                    embedding.len()
                )));
            }
            debug!(run_id = %run.run_id, "plan embedding computed");
            run.embedding = Some(embedding);
            store.upsert_run(run).await?;
        }
        Ok(())
    }

    /// Full clustering pass over `runs`: embed, then partition.
    #[instrument(skip(self, store, runs), fields(task_id = %task_id, runs = runs.len()))]
    pub async fn cluster(
        &self,
        store: &dyn ReasoningStore,
        task_id: &TaskId,
        runs: &mut [RunRecord],
    ) -> Result<Vec<FamilyRecord>> {
        self.ensure_embeddings(store, runs).await?;
        let families = cluster_runs(task_id, runs, self.thresholds)?;

        METRICS.inc_clustering_passes();
        let valid = runs.iter().filter(|r| r.valid).count();
        obs::emit_cluster_completed(&task_id.0, valid, families.len());
        Ok(families)
    }
}
