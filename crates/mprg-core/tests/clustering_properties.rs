//! Properties of the family clusterer over a fixed, varied run set.
//!
//! Embeddings come from `LexicalEmbedder`, so plans that share words land
//! close together and the thresholds below cut the graph at different points.

use std::collections::BTreeSet;

use chrono::Utc;

use mprg_core::{cluster_runs, LexicalEmbedder, Thresholds};
use mprg_state::storage_traits::*;

const PLANS: &[(&str, &[&str])] = &[
    ("blue green deploy with traffic switch", &["traffic is low", "rollback is cheap"]),
    ("blue green deploy with dns switch", &["traffic is low", "dns ttl is short"]),
    ("rolling deploy one node at a time", &["nodes are stateless"]),
    ("rolling deploy two nodes at a time", &["nodes are stateless", "capacity is spare"]),
    ("feature flag dark launch", &["flags are cheap"]),
    ("schedule a maintenance window", &["users accept downtime", "traffic is low"]),
    ("canary release to five percent", &["metrics are reliable"]),
    ("canary release to ten percent", &["metrics are reliable", "rollback is cheap"]),
];

fn runs() -> Vec<RunRecord> {
    let embedder = LexicalEmbedder::new(64);
    let task_id = TaskId("prop".to_string());
    let mut runs: Vec<RunRecord> = PLANS
        .iter()
        .enumerate()
        .map(|(idx, (plan, assumptions))| RunRecord {
            run_id: RunId::for_slot(&task_id, idx as u32),
            task_id: task_id.clone(),
            run_index: idx as u32,
            agent_role: "role".to_string(),
            prompt_variant: "standard".to_string(),
            raw_output: String::new(),
            summary: Some(ReasoningSummary {
                plan_steps: vec![plan.to_string()],
                assumptions: assumptions.iter().map(|a| a.to_string()).collect(),
                final_answer: "deploy".to_string(),
                tools: vec![],
                risks: vec![],
                fallbacks: vec![],
            }),
            valid: true,
            retry_count: 0,
            embedding: Some(embedder.embed_text(plan)),
            elapsed_ms: 0,
            failure: None,
            created_at: Utc::now(),
        })
        .collect();

    // one invalid run that must never appear in a family
    runs.push(RunRecord {
        run_id: RunId::for_slot(&task_id, 8),
        task_id: task_id.clone(),
        run_index: 8,
        agent_role: "role".to_string(),
        prompt_variant: "json_only".to_string(),
        raw_output: "garbage".to_string(),
        summary: None,
        valid: false,
        retry_count: 1,
        embedding: None,
        elapsed_ms: 0,
        failure: Some(RunFailure {
            kind: FailureKind::Schema,
            detail: "Response was not valid JSON.".to_string(),
        }),
        created_at: Utc::now(),
    });
    runs
}

fn grid() -> Vec<f64> {
    (0..=20).map(|i| i as f64 * 0.05).collect()
}

fn family_count(runs: &[RunRecord], plan: f64, assumption: f64) -> usize {
    cluster_runs(&TaskId("prop".into()), runs, Thresholds { plan, assumption })
        .unwrap()
        .len()
}

#[test]
fn clustering_is_idempotent() {
    let runs = runs();
    let thresholds = Thresholds {
        plan: 0.6,
        assumption: 0.3,
    };
    let first = cluster_runs(&TaskId("prop".into()), &runs, thresholds).unwrap();
    let second = cluster_runs(&TaskId("prop".into()), &runs, thresholds).unwrap();
    assert_eq!(first, second);
}

#[test]
fn clustering_ignores_input_order() {
    let runs = runs();
    let mut reversed = runs.clone();
    reversed.reverse();
    let thresholds = Thresholds {
        plan: 0.5,
        assumption: 0.3,
    };
    assert_eq!(
        cluster_runs(&TaskId("prop".into()), &runs, thresholds).unwrap(),
        cluster_runs(&TaskId("prop".into()), &reversed, thresholds).unwrap()
    );
}

#[test]
fn families_partition_exactly_the_valid_runs() {
    let runs = runs();
    let valid: BTreeSet<String> = runs
        .iter()
        .filter(|r| r.valid)
        .map(|r| r.run_id.0.clone())
        .collect();

    for plan in grid() {
        for assumption in [0.0, 0.3, 0.7, 1.0] {
            let families = cluster_runs(
                &TaskId("prop".into()),
                &runs,
                Thresholds { plan, assumption },
            )
            .unwrap();

            let mut seen = BTreeSet::new();
            for family in &families {
                assert!(!family.member_run_ids.is_empty());
                assert!(family.member_run_ids.contains(&family.representative_run_id));
                for member in &family.member_run_ids {
                    assert!(
                        seen.insert(member.0.clone()),
                        "{member} in two families at plan={plan} assumption={assumption}"
                    );
                }
            }
            assert_eq!(seen, valid, "plan={plan} assumption={assumption}");
        }
    }
}

#[test]
fn raising_a_threshold_never_merges_families() {
    let runs = runs();
    for assumption in [0.0, 0.3, 0.7, 1.0] {
        let counts: Vec<usize> = grid()
            .into_iter()
            .map(|plan| family_count(&runs, plan, assumption))
            .collect();
        assert!(
            counts.windows(2).all(|w| w[0] <= w[1]),
            "plan sweep at assumption={assumption}: {counts:?}"
        );
    }
    for plan in [0.3, 0.6, 0.9] {
        let counts: Vec<usize> = grid()
            .into_iter()
            .map(|assumption| family_count(&runs, plan, assumption))
            .collect();
        assert!(
            counts.windows(2).all(|w| w[0] <= w[1]),
            "assumption sweep at plan={plan}: {counts:?}"
        );
    }
}

#[test]
fn extreme_thresholds_bound_the_family_count() {
    let runs = runs();
    // an assumption threshold of 0.0 links every pair
    assert_eq!(family_count(&runs, 1.0, 0.0), 1);
    // distinct plans and assumption sets stay apart at the ceiling
    assert_eq!(family_count(&runs, 1.0, 1.0), PLANS.len());
}
