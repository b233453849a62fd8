//! Trait contract tests for ReasoningStore.
//!
//! Every contract is checked against both the in-memory fake and the
//! SurrealDB store (kv-mem engine). Any conforming implementation must pass.

use std::time::Duration;

use chrono::Utc;
use mprg_state::storage_traits::*;
use mprg_state::{MemoryReasoningStore, StorageError, SurrealReasoningStore};

fn sample_summary(answer: &str) -> ReasoningSummary {
    ReasoningSummary {
        plan_steps: vec!["inventory services".to_string(), "cut over".to_string()],
        assumptions: vec!["traffic is low at night".to_string()],
        final_answer: answer.to_string(),
        tools: vec!["kubectl".to_string()],
        risks: vec![],
        fallbacks: vec!["roll back".to_string()],
    }
}

fn sample_run(task_id: &TaskId, run_index: u32, valid: bool) -> RunRecord {
    RunRecord {
        run_id: RunId::for_slot(task_id, run_index),
        task_id: task_id.clone(),
        run_index,
        agent_role: format!("role-{run_index}"),
        prompt_variant: "standard".to_string(),
        raw_output: "{}".to_string(),
        summary: valid.then(|| sample_summary("ship it")),
        valid,
        retry_count: 0,
        embedding: None,
        elapsed_ms: 5,
        failure: (!valid).then(|| RunFailure {
            kind: FailureKind::Schema,
            detail: "Missing required field: final_answer".to_string(),
        }),
        created_at: Utc::now(),
    }
}

fn sample_family(task_id: &TaskId, id: &str, members: &[u32]) -> FamilyRecord {
    let member_run_ids: Vec<RunId> = members
        .iter()
        .map(|i| RunId::for_slot(task_id, *i))
        .collect();
    FamilyRecord {
        family_id: id.to_string(),
        task_id: task_id.clone(),
        representative_run_id: member_run_ids[0].clone(),
        member_run_ids,
        signature: FamilySignature {
            plan_steps: vec!["inventory services".to_string()],
            assumptions: vec!["traffic is low at night".to_string()],
            summary: "traffic is low at night | inventory services".to_string(),
        },
    }
}

async fn task_upsert_then_get(store: &dyn ReasoningStore) {
    let mut task = TaskRecord::new("plan the migration", 3);
    store.upsert_task(&task).await.unwrap();

    let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(loaded, task);

    task.transition(TaskStatus::Scored);
    task.verdict = Some(Verdict::Moderate);
    task.family_count = Some(2);
    task.answers_agree = Some(false);
    store.upsert_task(&task).await.unwrap();

    let loaded = store.get_task(&task.task_id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TaskStatus::Scored);
    assert_eq!(loaded.verdict, Some(Verdict::Moderate));
    assert_eq!(loaded.family_count, Some(2));
    assert_eq!(loaded.answers_agree, Some(false));
}

async fn unknown_task_is_none(store: &dyn ReasoningStore) {
    let missing = store
        .get_task(&TaskId("no-such-task".to_string()))
        .await
        .unwrap();
    assert!(missing.is_none());
}

async fn list_tasks_newest_first(store: &dyn ReasoningStore) {
    let first = TaskRecord::new("first", 2);
    store.upsert_task(&first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = TaskRecord::new("second", 2);
    store.upsert_task(&second).await.unwrap();

    let tasks = store.list_tasks(10).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, second.task_id);
    assert_eq!(tasks[1].task_id, first.task_id);

    let limited = store.list_tasks(1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].task_id, second.task_id);
}

async fn runs_listed_by_index(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 3);
    store.upsert_task(&task).await.unwrap();

    // written out of order, like concurrent completions
    for idx in [2, 0, 1] {
        store
            .upsert_run(&sample_run(&task.task_id, idx, idx != 1))
            .await
            .unwrap();
    }

    let runs = store.list_runs(&task.task_id).await.unwrap();
    let indexes: Vec<u32> = runs.iter().map(|r| r.run_index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert!(runs[0].valid);
    assert!(!runs[1].valid);
    assert_eq!(
        runs[1].failure.as_ref().map(|f| f.kind),
        Some(FailureKind::Schema)
    );
    assert_eq!(runs[0].summary, Some(sample_summary("ship it")));
}

async fn run_upsert_replaces_same_slot(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 2);
    store.upsert_task(&task).await.unwrap();

    let mut run = sample_run(&task.task_id, 0, true);
    store.upsert_run(&run).await.unwrap();
    run.embedding = Some(vec![0.6, 0.8]);
    store.upsert_run(&run).await.unwrap();

    let runs = store.list_runs(&task.task_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].embedding, Some(vec![0.6, 0.8]));
}

async fn runs_are_scoped_to_task(store: &dyn ReasoningStore) {
    let a = TaskRecord::new("a", 1);
    let b = TaskRecord::new("b", 1);
    store.upsert_run(&sample_run(&a.task_id, 0, true)).await.unwrap();
    store.upsert_run(&sample_run(&b.task_id, 0, true)).await.unwrap();

    let runs = store.list_runs(&a.task_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].task_id, a.task_id);
}

async fn families_replace_previous_pass(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 3);
    let first_pass = vec![
        sample_family(&task.task_id, "family_0", &[0, 2]),
        sample_family(&task.task_id, "family_1", &[1]),
    ];
    store
        .upsert_families(&task.task_id, &first_pass)
        .await
        .unwrap();
    assert_eq!(store.list_families(&task.task_id).await.unwrap(), first_pass);

    let second_pass = vec![sample_family(&task.task_id, "family_0", &[0, 1, 2])];
    store
        .upsert_families(&task.task_id, &second_pass)
        .await
        .unwrap();
    assert_eq!(
        store.list_families(&task.task_id).await.unwrap(),
        second_pass
    );

    store.upsert_families(&task.task_id, &[]).await.unwrap();
    assert!(store.list_families(&task.task_id).await.unwrap().is_empty());
}

async fn lease_is_exclusive_until_released(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 2);
    let ttl = Duration::from_secs(60);

    assert!(store.claim_task(&task.task_id, "worker-a", ttl).await.unwrap());
    assert!(!store.claim_task(&task.task_id, "worker-b", ttl).await.unwrap());
    // re-claiming your own lease refreshes it
    assert!(store.claim_task(&task.task_id, "worker-a", ttl).await.unwrap());

    // releasing someone else's lease is a no-op
    store.release_task(&task.task_id, "worker-b").await.unwrap();
    assert!(!store.claim_task(&task.task_id, "worker-b", ttl).await.unwrap());

    store.release_task(&task.task_id, "worker-a").await.unwrap();
    assert!(store.claim_task(&task.task_id, "worker-b", ttl).await.unwrap());
}

async fn expired_lease_can_be_taken_over(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 2);

    assert!(store
        .claim_task(&task.task_id, "worker-a", Duration::from_millis(1))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(store
        .claim_task(&task.task_id, "worker-b", Duration::from_secs(60))
        .await
        .unwrap());
}

async fn steal_replaces_live_lease(store: &dyn ReasoningStore) {
    let task = TaskRecord::new("p", 2);
    let ttl = Duration::from_secs(600);

    assert!(store.claim_task(&task.task_id, "crashed", ttl).await.unwrap());
    store.steal_task(&task.task_id, "rescuer", ttl).await.unwrap();

    // the old holder can neither renew nor release it
    assert!(!store.claim_task(&task.task_id, "crashed", ttl).await.unwrap());
    store.release_task(&task.task_id, "crashed").await.unwrap();
    assert!(store.claim_task(&task.task_id, "rescuer", ttl).await.unwrap());

    store.release_task(&task.task_id, "rescuer").await.unwrap();
    assert!(store.claim_task(&task.task_id, "crashed", ttl).await.unwrap());
}

async fn tasks_found_by_prompt_digest(store: &dyn ReasoningStore) {
    let first = TaskRecord::new("migrate billing", 2);
    store.upsert_task(&first).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let other = TaskRecord::new("rotate keys", 2);
    store.upsert_task(&other).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = TaskRecord::new("migrate billing", 3);
    store.upsert_task(&again).await.unwrap();

    let found = store
        .find_tasks_by_prompt(&first.prompt_digest, 10)
        .await
        .unwrap();
    let ids: Vec<&TaskId> = found.iter().map(|t| &t.task_id).collect();
    assert_eq!(ids, vec![&again.task_id, &first.task_id]);

    let limited = store
        .find_tasks_by_prompt(&first.prompt_digest, 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let none = store
        .find_tasks_by_prompt(&ContentDigest::from_bytes(b"never submitted"), 10)
        .await
        .unwrap();
    assert!(none.is_empty());
}

macro_rules! store_contracts {
    ($backend:ident, $make:expr) => {
        mod $backend {
            use super::*;

            #[tokio::test]
            async fn task_upsert_then_get() {
                let store = $make;
                super::task_upsert_then_get(&store).await;
            }

            #[tokio::test]
            async fn unknown_task_is_none() {
                let store = $make;
                super::unknown_task_is_none(&store).await;
            }

            #[tokio::test]
            async fn list_tasks_newest_first() {
                let store = $make;
                super::list_tasks_newest_first(&store).await;
            }

            #[tokio::test]
            async fn runs_listed_by_index() {
                let store = $make;
                super::runs_listed_by_index(&store).await;
            }

            #[tokio::test]
            async fn run_upsert_replaces_same_slot() {
                let store = $make;
                super::run_upsert_replaces_same_slot(&store).await;
            }

            #[tokio::test]
            async fn runs_are_scoped_to_task() {
                let store = $make;
                super::runs_are_scoped_to_task(&store).await;
            }

            #[tokio::test]
            async fn families_replace_previous_pass() {
                let store = $make;
                super::families_replace_previous_pass(&store).await;
            }

            #[tokio::test]
            async fn lease_is_exclusive_until_released() {
                let store = $make;
                super::lease_is_exclusive_until_released(&store).await;
            }

            #[tokio::test]
            async fn expired_lease_can_be_taken_over() {
                let store = $make;
                super::expired_lease_can_be_taken_over(&store).await;
            }

            #[tokio::test]
            async fn steal_replaces_live_lease() {
                let store = $make;
                super::steal_replaces_live_lease(&store).await;
            }

            #[tokio::test]
            async fn tasks_found_by_prompt_digest() {
                let store = $make;
                super::tasks_found_by_prompt_digest(&store).await;
            }
        }
    };
}

store_contracts!(memory, MemoryReasoningStore::new());
store_contracts!(surreal, SurrealReasoningStore::in_memory().await.unwrap());

// ===========================================================================
// Fake-only behaviour
// ===========================================================================

#[tokio::test]
async fn unavailable_store_rejects_every_call() {
    let store = MemoryReasoningStore::new();
    let task = TaskRecord::new("p", 1);
    store.upsert_task(&task).await.unwrap();

    store.set_unavailable(true);
    let err = store.get_task(&task.task_id).await.unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));
    let err = store
        .upsert_run(&sample_run(&task.task_id, 0, true))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Unavailable(_)));

    store.set_unavailable(false);
    assert!(store.get_task(&task.task_id).await.unwrap().is_some());
    assert_eq!(store.run_writes(), 0);
}
