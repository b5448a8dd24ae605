//! Merge conflict and validation tests.
//!
//! Verifies what happens when integration goes wrong:
//! - A conflicting merge leaves the baseline untouched
//! - A failed validation is reverted and blocks dependents
//! - Independent tasks keep merging past a failure

use std::time::Duration;

use swarm::config::Config;
use swarm::core::task::{TaskErrorKind, TaskPhase};
use swarm::orchestration::{MergeStatus, OutcomeCause, RunEvent, RunStatus, ScriptedWorker, WorkerScript};
use swarm::workspace::{MemoryProvider, MemoryScript};

use crate::fixtures::{dep, drain, fast_config, planned, specs, touch, Harness};

/// Test: a failed validation is reverted and only its dependents are skipped.
///
/// Given X (fails validation), Y depending on X, and an independent Z
/// When the run completes
/// Then X is reverted and failed, Y is blocked by X, and Z merges.
#[tokio::test]
async fn test_validation_failure_reverts_and_blocks_dependents() {
    let worker = ScriptedWorker::new()
        .with_script("X", planned(&["x.rs"]))
        .with_script("Y", planned(&["y.rs"]))
        .with_script("Z", planned(&["z.rs"]));
    let provider = MemoryProvider::new().with_script(
        "X",
        MemoryScript {
            fail_validation: true,
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(3), provider, worker);
    let run = harness
        .controller
        .submit(specs(&["X", "Y", "Z"]), vec![dep("Y", "X")])
        .await
        .unwrap();
    let mut events = harness.controller.subscribe(&run).unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let x = harness.id(&run, "X");
    let z = harness.id(&run, "Z");
    assert_eq!(report.status, RunStatus::Completed);

    let x_outcome = report.outcome(&x).unwrap();
    assert_eq!(x_outcome.phase, TaskPhase::Failed);
    assert!(matches!(x_outcome.merge_status, Some(MergeStatus::ValidationFailed { .. })));
    assert_eq!(x_outcome.error.as_ref().unwrap().kind, TaskErrorKind::ValidationFailure);

    let y_outcome = report.outcome_by_name("Y").unwrap();
    assert_eq!(y_outcome.phase, TaskPhase::Approved);
    assert_eq!(y_outcome.merge_status, Some(MergeStatus::BlockedByDependency { on: x }));
    assert_eq!(y_outcome.cause, OutcomeCause::Consequence { of: x });

    assert_eq!(report.outcome(&z).unwrap().phase, TaskPhase::Merged);
    assert_eq!(harness.provider.merge_log(), vec![x, z]);
    assert_eq!(harness.provider.merged_tasks(), vec![z]);

    let reverted = drain(&mut events)
        .into_iter()
        .any(|e| matches!(e, RunEvent::Reverted { task_id, .. } if task_id == x));
    assert!(reverted);
}

/// Test: a conflicting merge is reported with its resources.
///
/// Given a task whose merge conflicts on `lib.rs`
/// When the run completes
/// Then the baseline is unchanged, the conflict names `lib.rs`, and the
/// workspace is kept for inspection.
#[tokio::test]
async fn test_merge_conflict_keeps_baseline() {
    let provider = MemoryProvider::new().with_script(
        "clash",
        MemoryScript {
            touch_set: touch(&["lib.rs"]),
            merge_conflict: vec!["lib.rs".to_string()],
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(2), provider, ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["clash"]), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let clash = harness.id(&run, "clash");
    let outcome = report.outcome(&clash).unwrap();
    assert_eq!(
        outcome.merge_status,
        Some(MergeStatus::MergeConflict {
            resources: vec!["lib.rs".to_string()]
        })
    );
    let error = outcome.error.as_ref().unwrap();
    assert_eq!(error.kind, TaskErrorKind::MergeConflict);
    assert_eq!(error.resources, vec!["lib.rs"]);

    assert_eq!(harness.provider.head(), "rev-0");
    assert!(harness.provider.merge_log().is_empty());
    assert!(harness.provider.is_allocated(&clash));
}

/// Test: failed workspaces are released when not kept.
///
/// Given `keep_failed_workspaces = false` and a conflicting task
/// When the run completes
/// Then its workspace has been released.
#[tokio::test]
async fn test_merge_conflict_releases_when_not_kept() {
    let provider = MemoryProvider::new().with_script(
        "clash",
        MemoryScript {
            merge_conflict: vec!["lib.rs".to_string()],
            ..Default::default()
        },
    );
    let config = Config {
        keep_failed_workspaces: false,
        ..fast_config(1)
    };
    let harness = Harness::new(config, provider, ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["clash"]), vec![]).await.unwrap();
    harness.controller.wait(&run).await.unwrap();

    let clash = harness.id(&run, "clash");
    assert!(!harness.provider.is_allocated(&clash));
    assert!(harness.provider.was_released(&clash));
}

/// Test: a dependent never merges after its prerequisite fails.
///
/// Given `ui` depending on `core`, with `core` failing in planning
/// When the run completes
/// Then `ui` is approved but blocked by `core`, and nothing merges.
#[tokio::test]
async fn test_dependent_never_merges_after_failed_prerequisite() {
    let worker = ScriptedWorker::new().with_script(
        "core",
        WorkerScript {
            fail_phase: Some(TaskPhase::Planning),
            ..Default::default()
        },
    );
    let harness = Harness::new(fast_config(2), MemoryProvider::new(), worker);
    let run = harness
        .controller
        .submit(specs(&["core", "ui"]), vec![dep("ui", "core")])
        .await
        .unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let core = harness.id(&run, "core");
    let ui = report.outcome_by_name("ui").unwrap();
    assert_eq!(ui.phase, TaskPhase::Approved);
    assert_eq!(ui.merge_status, Some(MergeStatus::BlockedByDependency { on: core }));
    assert_eq!(report.outcome(&core).unwrap().merge_status, Some(MergeStatus::TaskFailed));
    assert!(harness.provider.merge_log().is_empty());
    // planning failures release the workspace straight away
    assert!(harness.provider.was_released(&core));
}

/// Test: a conflict does not stop later independent merges.
///
/// Given three tasks where the middle one conflicts
/// When the run completes
/// Then the first and last merge in plan order.
#[tokio::test]
async fn test_conflict_does_not_stop_independent_merges() {
    let provider = MemoryProvider::new()
        .with_script(
            "second",
            MemoryScript {
                merge_conflict: vec!["Cargo.toml".to_string()],
                ..Default::default()
            },
        )
        .with_merge_delay(Duration::from_millis(5));
    let harness = Harness::new(fast_config(3), provider, ScriptedWorker::new());
    let run = harness
        .controller
        .submit(specs(&["first", "second", "third"]), vec![])
        .await
        .unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    let first = harness.id(&run, "first");
    let third = harness.id(&run, "third");
    assert_eq!(harness.provider.merged_tasks(), vec![first, third]);
    assert!(!report.is_clean());
    assert_eq!(report.merge.merged(), vec![first, third]);
}
