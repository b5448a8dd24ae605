//! Parallel execution tests.
//!
//! Verifies that:
//! - Phase work never exceeds the concurrency limit
//! - Merges happen strictly one at a time, within and across runs
//! - Tasks progress independently of each other

use std::time::Duration;

use swarm::core::task::{TaskPhase, TaskSpec};
use swarm::orchestration::{ScriptedWorker, WorkerScript};
use swarm::workspace::MemoryProvider;

use crate::fixtures::{fast_config, specs, Harness};

fn slow(ms: u64) -> WorkerScript {
    WorkerScript {
        delay: Duration::from_millis(ms),
        ..Default::default()
    }
}

fn many(count: usize) -> Vec<TaskSpec> {
    (0..count)
        .map(|i| TaskSpec::new(format!("task-{}", i), "parallel work"))
        .collect()
}

/// Test: the concurrency limit bounds phase work.
///
/// Given eight slow tasks and a limit of three
/// When the run completes
/// Then at most three phase calls were ever in flight, and more than one was.
#[tokio::test]
async fn test_concurrency_is_bounded() {
    let worker = (0..8).fold(ScriptedWorker::new(), |w, i| {
        w.with_script(format!("task-{}", i), slow(15))
    });
    let harness = Harness::new(fast_config(3), MemoryProvider::new(), worker);
    let run = harness.controller.submit(many(8), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    assert!(report.is_clean());
    let peak = harness.worker.peak_concurrency();
    assert!(peak <= 3, "peak concurrency {} exceeds limit", peak);
    assert!(peak > 1, "tasks never overlapped");
}

/// Test: a limit of one runs tasks one after another.
///
/// Given three tasks and a limit of one
/// When the run completes
/// Then each task finished all its phases before the next began.
#[tokio::test]
async fn test_single_slot_runs_tasks_in_turn() {
    let harness = Harness::new(fast_config(1), MemoryProvider::new(), ScriptedWorker::new());
    let run = harness.controller.submit(specs(&["a", "b", "c"]), vec![]).await.unwrap();
    harness.controller.wait(&run).await.unwrap();

    assert_eq!(harness.worker.peak_concurrency(), 1);
    let names: Vec<String> = harness.worker.calls().into_iter().map(|(name, _)| name).collect();
    let mut runs = names.clone();
    runs.dedup();
    assert_eq!(runs.len(), 3, "task phases interleaved: {:?}", names);
}

/// Test: merges are serial within a run.
///
/// Given six independent tasks and a slow merge
/// When the run completes
/// Then no merge started while another was in progress.
#[tokio::test]
async fn test_merges_are_serial() {
    let provider = MemoryProvider::new().with_merge_delay(Duration::from_millis(10));
    let harness = Harness::new(fast_config(6), provider, ScriptedWorker::new());
    let run = harness.controller.submit(many(6), vec![]).await.unwrap();
    let report = harness.controller.wait(&run).await.unwrap();

    assert_eq!(harness.provider.overlapping_merges(), 0);
    assert_eq!(harness.provider.merged_tasks(), report.plan.order);
}

/// Test: two runs on one controller never merge at the same time.
///
/// Given two concurrent runs sharing a baseline and a slow merge
/// When both complete
/// Then every task merged and no merges overlapped.
#[tokio::test]
async fn test_runs_share_one_merge_lock() {
    let provider = MemoryProvider::new().with_merge_delay(Duration::from_millis(10));
    let harness = Harness::new(fast_config(4), provider, ScriptedWorker::new());

    let first = harness.controller.submit(specs(&["a1", "a2", "a3"]), vec![]).await.unwrap();
    let second = harness.controller.submit(specs(&["b1", "b2", "b3"]), vec![]).await.unwrap();
    let (r1, r2) = tokio::join!(harness.controller.wait(&first), harness.controller.wait(&second));

    assert!(r1.unwrap().is_clean());
    assert!(r2.unwrap().is_clean());
    assert_eq!(harness.provider.merged_tasks().len(), 6);
    assert_eq!(harness.provider.overlapping_merges(), 0);
}

/// Test: a slow task does not hold back the others' phases.
///
/// Given one slow task and two fast ones
/// When the fast tasks finish reviewing
/// Then the slow task is still in flight.
#[tokio::test]
async fn test_tasks_progress_independently() {
    let mut worker = ScriptedWorker::new();
    let gate = worker.gate("slow", TaskPhase::Implementing);
    let harness = Harness::new(fast_config(3), MemoryProvider::new(), worker);
    let run = harness
        .controller
        .submit(specs(&["slow", "fast1", "fast2"]), vec![])
        .await
        .unwrap();

    gate.entered().await;
    let fast_done = crate::fixtures::eventually(Duration::from_secs(5), || {
        harness.phase(&run, "fast1") == TaskPhase::Approved
            && harness.phase(&run, "fast2") == TaskPhase::Approved
    })
    .await;
    assert!(fast_done);
    assert_eq!(harness.phase(&run, "slow"), TaskPhase::Implementing);
    assert!(!harness.controller.is_quiescent(&run).unwrap());

    gate.release();
    let report = harness.controller.wait(&run).await.unwrap();
    assert!(report.is_clean());
}
