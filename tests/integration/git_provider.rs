//! Runs against real git worktrees.
//!
//! Each task gets its own worktree and branch; approved work is merged into
//! a staging branch, validated there, and reverted when validation fails.

use std::sync::Arc;

use tempfile::TempDir;

use swarm::core::task::TaskPhase;
use swarm::git::GitOps;
use swarm::orchestration::{MergeStatus, RunStatus};
use swarm::workspace::GitWorkspaceProvider;
use swarm::Controller;

use crate::fixtures::{fast_config, specs, FileWorker, TestRepo};

async fn git_controller(
    repo: &TestRepo,
    worktrees: &TempDir,
    worker: FileWorker,
    validate: Option<Vec<String>>,
) -> (Controller, Arc<GitWorkspaceProvider>, String) {
    let git = GitOps::new(&repo.path).unwrap();
    let provider = Arc::new(GitWorkspaceProvider::new(
        git,
        "test",
        worktrees.path().to_path_buf(),
        validate,
    ));
    let staging = "swarm/staging-test".to_string();
    let baseline = provider
        .prepare_baseline(&staging, &repo.current_branch())
        .await
        .unwrap();
    let controller = Controller::new(fast_config(2), provider.clone(), Arc::new(worker), baseline);
    (controller, provider, staging)
}

/// Test: approved work lands on the staging branch.
///
/// Given two tasks writing different files
/// When the run completes
/// Then both files are on the staging branch and the base branch is untouched.
#[tokio::test]
async fn test_git_run_merges_to_staging() {
    let repo = TestRepo::new();
    let worktrees = TempDir::new().unwrap();
    let base = repo.current_branch();
    let worker = FileWorker::new()
        .writes("alpha", "alpha.txt", "alpha\n")
        .writes("beta", "beta.txt", "beta\n");
    let (controller, provider, staging) = git_controller(&repo, &worktrees, worker, None).await;

    let run = controller.submit(specs(&["alpha", "beta"]), vec![]).await.unwrap();
    let report = controller.wait(&run).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_clean());
    let alpha = controller.task(&run, &controller.find_task(&run, "alpha").unwrap()).unwrap();
    assert!(alpha.touch_set.contains("alpha.txt"));
    assert!(alpha.workspace.is_none());

    assert_eq!(repo.file_on_branch(&staging, "alpha.txt").as_deref(), Some("alpha\n"));
    assert_eq!(repo.file_on_branch(&staging, "beta.txt").as_deref(), Some("beta\n"));
    assert_eq!(repo.file_on_branch(&base, "alpha.txt"), None);
    assert!(repo.branch_exists(&staging));

    provider.teardown().await.unwrap();
}

/// Test: a failing validation command reverts the merge.
///
/// Given `alpha`, `broken` and `beta`, where the check rejects `broken.txt`
/// When the run completes
/// Then `broken` is reverted and failed while `alpha` and `beta` stay merged.
#[tokio::test]
async fn test_git_validation_failure_reverts() {
    let repo = TestRepo::new();
    let worktrees = TempDir::new().unwrap();
    let worker = FileWorker::new()
        .writes("alpha", "alpha.txt", "alpha\n")
        .writes("broken", "broken.txt", "oops\n")
        .writes("beta", "beta.txt", "beta\n");
    let validate = Some(vec![
        "sh".to_string(),
        "-c".to_string(),
        "test ! -f broken.txt".to_string(),
    ]);
    let (controller, provider, staging) = git_controller(&repo, &worktrees, worker, validate).await;

    let run = controller
        .submit(specs(&["alpha", "broken", "beta"]), vec![])
        .await
        .unwrap();
    let report = controller.wait(&run).await.unwrap();

    let broken = report.outcome_by_name("broken").unwrap();
    assert_eq!(broken.phase, TaskPhase::Failed);
    assert!(matches!(broken.merge_status, Some(MergeStatus::ValidationFailed { .. })));
    assert_eq!(report.outcome_by_name("alpha").unwrap().phase, TaskPhase::Merged);
    assert_eq!(report.outcome_by_name("beta").unwrap().phase, TaskPhase::Merged);

    assert!(repo.file_on_branch(&staging, "alpha.txt").is_some());
    assert!(repo.file_on_branch(&staging, "beta.txt").is_some());
    assert_eq!(repo.file_on_branch(&staging, "broken.txt"), None);

    provider.teardown().await.unwrap();
}

/// Test: overlapping edits conflict and leave the staging branch alone.
///
/// Given `left` and `right` both rewriting README.md differently
/// When the run completes
/// Then `left` merges first and `right` reports a conflict on README.md.
#[tokio::test]
async fn test_git_conflict_is_reported() {
    let repo = TestRepo::new();
    let worktrees = TempDir::new().unwrap();
    let worker = FileWorker::new()
        .writes("left", "README.md", "# Left\n")
        .writes("right", "README.md", "# Right\n");
    let (controller, provider, staging) = git_controller(&repo, &worktrees, worker, None).await;

    let run = controller.submit(specs(&["left", "right"]), vec![]).await.unwrap();
    let report = controller.wait(&run).await.unwrap();

    let left = controller.find_task(&run, "left").unwrap();
    let right = controller.find_task(&run, "right").unwrap();
    assert!(report.plan.has_edge(&left, &right));
    assert_eq!(report.outcome(&left).unwrap().phase, TaskPhase::Merged);
    assert_eq!(
        report.outcome(&right).unwrap().merge_status,
        Some(MergeStatus::MergeConflict {
            resources: vec!["README.md".to_string()]
        })
    );
    assert_eq!(repo.file_on_branch(&staging, "README.md").as_deref(), Some("# Left\n"));

    // the conflicting worktree is kept until cleanup
    assert!(controller.task(&run, &right).unwrap().workspace.is_some());
    assert_eq!(controller.cleanup(&run).await.unwrap(), 1);
    assert!(controller.task(&run, &right).unwrap().workspace.is_none());

    provider.teardown().await.unwrap();
}
