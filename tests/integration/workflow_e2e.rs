//! End-to-end run tests.
//!
//! Verifies complete runs from submission to the final report:
//! - Every task walks the pipeline in order
//! - The merge plan follows shared touch-sets and explicit dependencies
//! - Nothing merges without an approval

use swarm::core::task::{ReviewVerdict, TaskErrorKind, TaskPhase};
use swarm::error::Error;
use swarm::orchestration::{MergeStatus, OutcomeCause, RunEvent, RunStatus, ScriptedWorker, WorkerScript};
use swarm::workspace::{MemoryProvider, MemoryScript};

use crate::fixtures::{dep, drain, fast_config, planned, specs, touch, Harness};

/// Test: tasks sharing a file are ordered, disjoint tasks are not.
///
/// Given tasks A and B that both touch `shared.rs` and C touching only `c.rs`
/// When the run completes
/// Then the plan orders A before B, leaves C independent, and all three merge
/// in plan order.
#[tokio::test]
async fn test_three_task_plan_orders_shared_files() {
    let worker = ScriptedWorker::new()
        .with_script("A", planned(&["shared.rs", "a.rs"]))
        .with_script("B", planned(&["shared.rs"]))
        .with_script("C", planned(&["c.rs"]));
    let harness = Harness::new(fast_config(3), MemoryProvider::new(), worker);

    let run = harness.controller.submit(specs(&["A", "B", "C"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let a = harness.id(&run, "A");
    let b = harness.id(&run, "B");
    let c = harness.id(&run, "C");
    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.plan.has_edge(&a, &b));
    assert!(!report.plan.has_edge(&b, &a));
    assert!(report.plan.is_independent(&a, &c));
    assert!(report.plan.is_independent(&b, &c));
    assert!(report.plan.position(&a) < report.plan.position(&b));

    assert!(report.is_clean());
    assert_eq!(harness.provider.merged_tasks(), report.plan.order);
    for name in ["A", "B", "C"] {
        assert_eq!(report.outcome_by_name(name).unwrap().phase, TaskPhase::Merged);
    }
}

/// Test: every task runs the phases in pipeline order.
///
/// Given two independent tasks
/// When the run completes
/// Then each saw Exploring, Planning, Implementing, Reviewing once, in order.
#[tokio::test]
async fn test_phases_run_in_order() {
    let harness = Harness::new(fast_config(2), MemoryProvider::new(), ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["one", "two"]), vec![]).await.unwrap();
    let mut events = harness.controller.subscribe(&run).unwrap();
    harness.controller.wait(&run).await.unwrap();

    let expected = vec![
        TaskPhase::Exploring,
        TaskPhase::Planning,
        TaskPhase::Implementing,
        TaskPhase::Reviewing,
    ];
    for name in ["one", "two"] {
        assert_eq!(harness.worker.phases_for(name), expected);
        let task = harness.controller.task(&run, &harness.id(&run, name)).unwrap();
        let history: Vec<TaskPhase> = task.history.iter().map(|h| h.phase).collect();
        assert_eq!(
            history,
            vec![
                TaskPhase::Pending,
                TaskPhase::Exploring,
                TaskPhase::Planning,
                TaskPhase::Implementing,
                TaskPhase::Reviewing,
                TaskPhase::Approved,
                TaskPhase::Merged,
            ]
        );
    }

    let events = drain(&mut events);
    assert!(matches!(
        events.last(),
        Some(RunEvent::RunFinished {
            status: RunStatus::Completed
        })
    ));
}

/// Test: the plan is the same for the same inputs.
///
/// Given two runs over identical tasks and touch-sets
/// When both complete
/// Then their merge orders match name for name.
#[tokio::test]
async fn test_plan_is_deterministic() {
    let names = ["gamma", "alpha", "beta", "delta"];
    let mut orders = Vec::new();
    for _ in 0..2 {
        let worker = ScriptedWorker::new()
            .with_script("gamma", planned(&["lib.rs"]))
            .with_script("alpha", planned(&["lib.rs", "main.rs"]))
            .with_script("beta", planned(&["main.rs"]))
            .with_script("delta", planned(&["docs.md"]));
        let harness = Harness::new(fast_config(4), MemoryProvider::new(), worker);
        let run = harness.controller.submit(specs(&names), vec![]).await.unwrap();
        let report = harness.controller.wait(&run).await.unwrap();
        let order: Vec<String> = report
            .plan
            .order
            .iter()
            .map(|id| report.outcome(id).unwrap().name.clone())
            .collect();
        orders.push(order);
    }
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[0], vec!["gamma", "alpha", "beta", "delta"]);
}

/// Test: explicit dependencies are honored even without shared files.
///
/// Given `api` depending on `models`, declared first and touching nothing in common
/// When the run completes
/// Then `models` merges before `api`.
#[tokio::test]
async fn test_explicit_dependency_orders_merge() {
    let worker = ScriptedWorker::new()
        .with_script("api", planned(&["api.rs"]))
        .with_script("models", planned(&["models.rs"]));
    let harness = Harness::new(fast_config(2), MemoryProvider::new(), worker);
    let run = harness
        .controller
        .submit(specs(&["api", "models"]), vec![dep("api", "models")])
        .await
        .unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let api = harness.id(&run, "api");
    let models = harness.id(&run, "models");
    assert_eq!(report.plan.order, vec![models, api]);
    assert_eq!(harness.provider.merged_tasks(), vec![models, api]);
}

/// Test: a dependency cycle is rejected before any work starts.
///
/// Given three tasks that depend on each other in a ring
/// When the run is submitted
/// Then submission fails naming all three and no worker calls are made.
#[tokio::test]
async fn test_cycle_rejected_names_every_member() {
    let harness = Harness::new(fast_config(2), MemoryProvider::new(), ScriptedWorker::new());
    let err = harness
        .controller
        .submit(
            specs(&["c", "a", "b", "free"]),
            vec![dep("a", "b"), dep("b", "c"), dep("c", "a")],
        )
        .await
        .unwrap_err();

    match err {
        Error::Cycle(cycle) => {
            assert_eq!(cycle.members, vec!["a", "b", "c"]);
            assert_eq!(cycle.task_ids.len(), 3);
        }
        other => panic!("expected cycle, got {:?}", other),
    }
    assert!(harness.worker.calls().is_empty());
    assert!(harness.controller.run_ids().is_empty());
}

/// Test: only approved tasks reach the baseline.
///
/// Given one approved task, one blocked at review and one failing implementation
/// When the run completes
/// Then only the approved task merges and every merged task passed through Approved.
#[tokio::test]
async fn test_nothing_merges_without_approval() {
    let worker = ScriptedWorker::new()
        .with_script(
            "blocked",
            WorkerScript {
                verdicts: vec![ReviewVerdict::Blocked],
                ..Default::default()
            },
        )
        .with_script(
            "broken",
            WorkerScript {
                fail_phase: Some(TaskPhase::Implementing),
                ..Default::default()
            },
        );
    let harness = Harness::new(fast_config(3), MemoryProvider::new(), worker);
    let run = harness
        .controller
        .submit(specs(&["good", "blocked", "broken"]), vec![])
        .await
        .unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    assert_eq!(harness.provider.merged_tasks(), vec![harness.id(&run, "good")]);
    for task in harness.controller.status(&run).unwrap() {
        if task.phase == TaskPhase::Merged {
            assert!(task.visited(TaskPhase::Approved));
            assert_eq!(task.review_verdict, ReviewVerdict::Approved);
        }
    }

    let blocked = report.outcome_by_name("blocked").unwrap();
    assert_eq!(blocked.phase, TaskPhase::Blocked);
    assert_eq!(blocked.merge_status, Some(MergeStatus::AwaitingApproval));

    let broken = report.outcome_by_name("broken").unwrap();
    assert_eq!(broken.phase, TaskPhase::Failed);
    assert_eq!(broken.cause, OutcomeCause::Independent);
    assert_eq!(broken.error.as_ref().unwrap().phase, TaskPhase::Implementing);
}

/// Test: a requested change loops back through implementation.
///
/// Given a reviewer that requests changes once, then approves
/// When the run completes
/// Then the task implemented twice, recorded one rework round and merged.
#[tokio::test]
async fn test_rework_round_then_merge() {
    let worker = ScriptedWorker::new().with_script(
        "feature",
        WorkerScript {
            verdicts: vec![ReviewVerdict::ChangesRequested, ReviewVerdict::Approved],
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(1), MemoryProvider::new(), worker);
    let run = harness.controller.submit(specs(&["feature"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let phases = harness.worker.phases_for("feature");
    assert_eq!(phases.iter().filter(|p| **p == TaskPhase::Implementing).count(), 2);
    assert_eq!(phases.iter().filter(|p| **p == TaskPhase::Reviewing).count(), 2);
    let task = harness.controller.task(&run, &harness.id(&run, "feature")).unwrap();
    assert_eq!(task.rework_rounds, 1);
    assert!(task.visited(TaskPhase::ChangesRequested));
    assert_eq!(report.outcome_by_name("feature").unwrap().phase, TaskPhase::Merged);
}

/// Test: review rounds are bounded.
///
/// Given a reviewer that always requests changes and one allowed rework round
/// When the run completes
/// Then the task is escalated to Blocked and never merges.
#[tokio::test]
async fn test_review_escalates_after_retries() {
    let worker = ScriptedWorker::new().with_script(
        "endless",
        WorkerScript {
            verdicts: vec![ReviewVerdict::ChangesRequested],
            ..Default::default()
        },
    );
    let config = swarm::config::Config {
        max_review_retries: 1,
        ..fast_config(1)
    };
    let harness = Harness::new(config, MemoryProvider::new(), worker);
    let run = harness.controller.submit(specs(&["endless"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let outcome = report.outcome_by_name("endless").unwrap();
    assert_eq!(outcome.phase, TaskPhase::Blocked);
    assert_eq!(outcome.error.as_ref().unwrap().kind, TaskErrorKind::ReviewEscalated);
    assert_eq!(outcome.merge_status, Some(MergeStatus::AwaitingApproval));
    let reviews = harness
        .worker
        .phases_for("endless")
        .into_iter()
        .filter(|p| *p == TaskPhase::Reviewing)
        .count();
    assert_eq!(reviews, 2);
    assert!(harness.provider.merged_tasks().is_empty());
}

/// Test: transient provider failures are retried.
///
/// Given a provider that is unavailable for the first two allocations
/// When the run completes
/// Then the task still merges.
#[tokio::test]
async fn test_transient_unavailability_is_retried() {
    let provider = MemoryProvider::new().with_script(
        "flaky",
        MemoryScript {
            touch_set: touch(&["flaky.rs"]),
            unavailable: 2,
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(1), provider, ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["flaky"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    assert!(report.is_clean());
    let flaky = harness.controller.task(&run, &harness.id(&run, "flaky")).unwrap();
    assert_eq!(flaky.phase, TaskPhase::Merged);
    assert!(flaky.touch_set.contains("flaky.rs"));
}

/// Test: exhausted retries fail the task without stopping the run.
///
/// Given a provider that stays unavailable for one task
/// When the run completes
/// Then that task fails as unavailable and the other task merges.
#[tokio::test]
async fn test_persistent_unavailability_fails_task() {
    let provider = MemoryProvider::new().with_script(
        "stuck",
        MemoryScript {
            unavailable: 100,
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(2), provider, ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["stuck", "fine"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let stuck = report.outcome_by_name("stuck").unwrap();
    assert_eq!(stuck.phase, TaskPhase::Failed);
    assert_eq!(stuck.error.as_ref().unwrap().kind, TaskErrorKind::ProviderUnavailable);
    assert_eq!(report.outcome_by_name("fine").unwrap().phase, TaskPhase::Merged);
}
