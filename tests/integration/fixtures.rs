//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Building controllers over scripted collaborators
//! - A phase worker that writes files into git worktrees

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use swarm::config::Config;
use swarm::core::task::{ReviewVerdict, Task, TaskId, TaskPhase, TaskSpec, TouchSet};
use swarm::orchestration::{PhaseOutcome, PhaseWorker, RunEvent, ScriptedWorker, WorkerScript};
use swarm::workspace::{Baseline, MemoryProvider, WorkspaceHandle};
use swarm::{Controller, RunId};

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        let repo = Self { temp_dir, path };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);

        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Get the current branch name.
    pub fn current_branch(&self) -> String {
        self.git(&["branch", "--show-current"])
    }

    /// Check if a branch exists.
    pub fn branch_exists(&self, name: &str) -> bool {
        !self.git(&["branch", "--list", name]).is_empty()
    }

    /// Contents of `file` at the tip of `branch`, if present there.
    pub fn file_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, file)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Defaults with retries that finish in milliseconds.
pub fn fast_config(max_concurrent: usize) -> Config {
    Config {
        max_concurrent,
        provider_retries: 3,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 2,
        ..Config::default()
    }
}

pub fn touch(files: &[&str]) -> TouchSet {
    files.iter().map(|f| f.to_string()).collect()
}

pub fn specs(names: &[&str]) -> Vec<TaskSpec> {
    names
        .iter()
        .map(|n| TaskSpec::new(*n, format!("Implement {}", n)))
        .collect()
}

/// `(dependent, prerequisite)` pair.
pub fn dep(dependent: &str, prerequisite: &str) -> (String, String) {
    (dependent.to_string(), prerequisite.to_string())
}

/// Worker script that plans and implements `files`.
pub fn planned(files: &[&str]) -> WorkerScript {
    WorkerScript {
        planned_touch_set: touch(files),
        ..Default::default()
    }
}

/// Controller over an in-memory provider and a scripted worker, keeping
/// handles to both for assertions.
pub struct Harness {
    pub controller: Controller,
    pub provider: Arc<MemoryProvider>,
    pub worker: Arc<ScriptedWorker>,
}

impl Harness {
    pub fn new(config: Config, provider: MemoryProvider, worker: ScriptedWorker) -> Self {
        let provider = Arc::new(provider);
        let worker = Arc::new(worker);
        let controller = Controller::new(config, provider.clone(), worker.clone(), Baseline::new("main"));
        Self {
            controller,
            provider,
            worker,
        }
    }

    pub fn id(&self, run: &RunId, name: &str) -> TaskId {
        self.controller.find_task(run, name).expect("task exists")
    }

    pub fn phase(&self, run: &RunId, name: &str) -> TaskPhase {
        self.controller
            .task(run, &self.id(run, name))
            .expect("task exists")
            .phase
    }
}

/// Every event currently buffered on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Phase worker that writes files into the task's worktree while
/// implementing and approves every review.
#[derive(Default)]
pub struct FileWorker {
    files: HashMap<String, Vec<(String, String)>>,
}

impl FileWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(mut self, task: &str, file: &str, content: &str) -> Self {
        self.files
            .entry(task.to_string())
            .or_default()
            .push((file.to_string(), content.to_string()));
        self
    }
}

#[async_trait]
impl PhaseWorker for FileWorker {
    async fn run(&self, phase: TaskPhase, task: &Task, workspace: &WorkspaceHandle) -> swarm::Result<PhaseOutcome> {
        let files = self.files.get(&task.name).cloned().unwrap_or_default();
        let planned: TouchSet = files.iter().map(|(f, _)| f.clone()).collect();
        match phase {
            TaskPhase::Planning => Ok(PhaseOutcome::success().with_touch_set(planned)),
            TaskPhase::Implementing => {
                for (file, content) in &files {
                    std::fs::write(workspace.path.join(file), content)?;
                }
                Ok(PhaseOutcome::success())
            }
            TaskPhase::Reviewing => Ok(PhaseOutcome::success().with_verdict(ReviewVerdict::Approved)),
            _ => Ok(PhaseOutcome::success()),
        }
    }
}
