use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};

use swarm::config::Config;
use swarm::core::dag::MergePlan;
use swarm::core::task::{Task, TaskId};
use swarm::git::GitOps;
use swarm::manifest::Manifest;
use swarm::orchestration::{
    CommandPhaseWorker, Controller, OutcomeCause, RunEvent, RunId, RunReport, RunStatus,
};
use swarm::state::{RunSnapshot, RunStore};
use swarm::util::truncate;
use swarm::workspace::{Baseline, GitWorkspaceProvider, WorkspaceProvider};
use swarm::{Error, Result};
use tracing::{info, warn};

/// Swarm - parallel task orchestration with conflict-aware merging
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG        Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.swarm/swarm.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Print the merge plan implied by a task manifest
    Plan {
        /// Path to the task manifest (TOML)
        manifest: PathBuf,
    },

    /// Run a manifest against this repository
    Run {
        manifest: PathBuf,

        /// No progress output; print the JSON report
        #[arg(long)]
        headless: bool,
    },

    /// Run a manifest with simulated workers and an in-memory baseline
    Simulate {
        manifest: PathBuf,

        /// Print the JSON report instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show task states of a run (latest if not specified)
    Status { run: Option<String> },

    /// Show the final report of a run (latest if not specified)
    Report { run: Option<String> },

    /// Cancel a task of a running run
    Cancel {
        run: String,
        /// Task name or id
        task: String,
    },

    /// Release worktrees still held by a finished run
    Cleanup { run: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    swarm::log::init(cli.debug);
    info!(command = ?cli.command, "swarm starting");

    match cli.command {
        Command::Plan { manifest } => run_plan(&manifest),
        Command::Run { manifest, headless } => run_manifest(&manifest, headless),
        Command::Simulate { manifest, json } => run_simulation(&manifest, json),
        Command::Status { run } => run_status(run.as_deref()),
        Command::Report { run } => run_report(run.as_deref()),
        Command::Cancel { run, task } => run_cancel(&run, &task),
        Command::Cleanup { run } => run_cleanup(&run),
    }
}

fn run_plan(path: &Path) -> Result<()> {
    let config = Config::load()?;
    let manifest = Manifest::load(path)?;
    let (tasks, plan) = match manifest.preview(config.tie_break.build()) {
        Ok(preview) => preview,
        Err(Error::Cycle(cycle)) => {
            eprintln!("Cannot plan: {}", cycle);
            return Err(Error::Cycle(cycle));
        }
        Err(e) => return Err(e),
    };
    print_plan(&plan, &names_of(&tasks));
    Ok(())
}

fn run_manifest(path: &Path, headless: bool) -> Result<()> {
    let manifest = Manifest::load(path)?;
    let config = Config::load()?;
    config.ensure_dirs()?;

    let repo_path = std::env::current_dir()?;
    let git = GitOps::new(&repo_path)?;
    let base = match &config.base_branch {
        Some(branch) => branch.clone(),
        None => git.current_head()?,
    };
    let worker = CommandPhaseWorker::new(&config.worker.program, config.worker.args.clone())?
        .with_timeout(config.worker_timeout());

    let run_id = RunId::new();
    let staging = format!("{}{}", config.staging_branch_prefix, run_id.short());
    let provider = Arc::new(GitWorkspaceProvider::new(
        git,
        run_id.short(),
        config.worktrees_dir()?,
        config.validate_command.clone(),
    ));

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let baseline = provider.prepare_baseline(&staging, &base).await?;
        if !headless {
            println!("Run {} on {} (from {})", run_id.short(), staging, base);
        }
        let controller = Controller::new(config, provider.clone(), Arc::new(worker), baseline)
            .with_store(RunStore::open_default()?);
        let report = execute(&controller, run_id, &manifest, !headless).await?;
        if let Err(e) = provider.teardown().await {
            warn!(error = %e, "failed to remove integration worktree");
        }
        Ok::<_, Error>(report)
    })?;

    if headless {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        if report.status == RunStatus::Completed {
            println!();
            println!("Merged work is on {}", staging);
        }
    }
    Ok(())
}

fn run_simulation(path: &Path, json: bool) -> Result<()> {
    let manifest = Manifest::load(path)?;
    let config = Config::load()?;
    let provider = Arc::new(manifest.simulated_provider());
    let worker = Arc::new(manifest.simulated_worker());

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let controller = Controller::new(config, provider.clone(), worker, Baseline::new("simulation"))
            .with_store(RunStore::open_default()?);
        execute(&controller, RunId::new(), &manifest, !json).await
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        println!();
        println!("Simulated baseline head: {}", provider.head());
    }
    Ok(())
}

/// Submit the manifest and wait for the report, printing progress when asked.
async fn execute(controller: &Controller, run_id: RunId, manifest: &Manifest, progress: bool) -> Result<RunReport> {
    let run_id = controller
        .submit_with_id(run_id, manifest.specs(), manifest.dependencies())
        .await?;
    if progress {
        let names = names_of(&controller.status(&run_id)?);
        let events = controller.subscribe(&run_id)?;
        tokio::spawn(print_events(events, names));
    }
    controller.wait(&run_id).await
}

async fn print_events(mut events: broadcast::Receiver<RunEvent>, names: HashMap<TaskId, String>) {
    let name = |id: &TaskId| names.get(id).cloned().unwrap_or_else(|| id.short());
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            RunEvent::PhaseStarted { task_id, phase } => println!("  {:<20} {}", name(&task_id), phase),
            RunEvent::Verdict { task_id, verdict } => println!("  {:<20} review: {}", name(&task_id), verdict),
            RunEvent::TaskFailed { task_id, phase, error } => {
                println!("  {:<20} FAILED in {}: {}", name(&task_id), phase, error)
            }
            RunEvent::TaskAborted { task_id, phase } => {
                println!("  {:<20} aborted during {}", name(&task_id), phase)
            }
            RunEvent::PlanFrozen { order } => {
                let order: Vec<String> = order.iter().map(&name).collect();
                println!("Merge order: {}", order.join(" -> "));
            }
            RunEvent::MergeFinished { task_id, status } => println!("  {:<20} {}", name(&task_id), status),
            RunEvent::Reverted { task_id, revision } => {
                println!("  {:<20} reverted to {}", name(&task_id), revision)
            }
            RunEvent::RunFinished { .. } => break,
            _ => {}
        }
    }
}

fn run_status(run: Option<&str>) -> Result<()> {
    let snapshot = RunStore::open_default()?.resolve(run)?;
    println!("Run {}  [{}]", snapshot.run_id.short(), snapshot.status);
    println!("Updated {}", snapshot.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    println!(
        "  {:<20} {:<18} {:<18} {:<10} {:>6}",
        "TASK", "PHASE", "REVIEW", "RESULT", "FILES"
    );
    for task in &snapshot.tasks {
        println!(
            "  {:<20} {:<18} {:<18} {:<10} {:>6}",
            truncate(&task.name, 20),
            task.phase,
            task.review_verdict,
            task.integration_result,
            task.touch_set.len()
        );
        if let Some(error) = &task.error {
            println!("      {}", error);
        }
    }
    println!();
    let label = if snapshot.plan_frozen { "Merge plan (frozen)" } else { "Merge plan (draft)" };
    println!("{}:", label);
    print_plan(&snapshot.plan, &names_of(&snapshot.tasks));
    Ok(())
}

fn run_report(run: Option<&str>) -> Result<()> {
    let snapshot = RunStore::open_default()?.resolve(run)?;
    match &snapshot.report {
        Some(report) => print_report(report),
        None => println!("Run {} is still {}; no report yet.", snapshot.run_id.short(), snapshot.status),
    }
    Ok(())
}

fn run_cancel(run: &str, task: &str) -> Result<()> {
    let store = RunStore::open_default()?;
    let snapshot = store.resolve(Some(run))?;
    if snapshot.status.is_finished() {
        return Err(Error::Validation(format!("run {} has already finished", snapshot.run_id.short())));
    }
    if !snapshot
        .tasks
        .iter()
        .any(|t| t.name == task || t.id.to_string() == task)
    {
        return Err(Error::UnknownTask(task.to_string()));
    }
    store.request_cancel(&snapshot.run_id, task)?;
    println!("Cancellation of {} requested; it takes effect at the next phase boundary.", task);
    Ok(())
}

fn run_cleanup(run: &str) -> Result<()> {
    let store = RunStore::open_default()?;
    let snapshot = store.resolve(Some(run))?;
    if !snapshot.status.is_finished() {
        return Err(Error::RunNotQuiescent(snapshot.run_id));
    }
    let config = Config::load()?;
    let git = GitOps::new(&std::env::current_dir()?)?;
    let provider = GitWorkspaceProvider::new(
        git,
        snapshot.run_id.short(),
        config.worktrees_dir()?,
        None,
    );

    let rt = tokio::runtime::Runtime::new()?;
    let released = rt.block_on(release_all(&provider, &snapshot))?;

    let mut updated = snapshot;
    for task in &mut updated.tasks {
        task.workspace = None;
    }
    updated.updated_at = chrono::Utc::now();
    store.save_sync(&updated)?;
    println!("Released {} workspace(s).", released);
    Ok(())
}

async fn release_all(provider: &GitWorkspaceProvider, snapshot: &RunSnapshot) -> Result<usize> {
    let mut released = 0;
    for task in &snapshot.tasks {
        if let Some(handle) = &task.workspace {
            provider.release(handle).await?;
            println!("  released {} ({})", task.name, handle.path.display());
            released += 1;
        }
    }
    Ok(released)
}

fn names_of(tasks: &[Task]) -> HashMap<TaskId, String> {
    tasks.iter().map(|t| (t.id, t.label())).collect()
}

fn print_plan(plan: &MergePlan, names: &HashMap<TaskId, String>) {
    let name = |id: &TaskId| names.get(id).cloned().unwrap_or_else(|| id.short());
    println!("Tie-break: {}", plan.tie_break);
    for (i, id) in plan.order.iter().enumerate() {
        let after: Vec<String> = plan
            .edges
            .iter()
            .filter(|e| e.to == *id)
            .map(|e| format!("{} ({})", name(&e.from), e.kind))
            .collect();
        if after.is_empty() {
            println!("  {:>2}. {}", i + 1, name(id));
        } else {
            println!("  {:>2}. {}  after {}", i + 1, name(id), after.join(", "));
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("Run {}  [{}]", report.run_id.short(), report.status);
    println!();
    for outcome in &report.tasks {
        let status = outcome
            .merge_status
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| outcome.phase.to_string());
        print!("  {:<20} {}", truncate(&outcome.name, 20), status);
        if let OutcomeCause::Consequence { of } = &outcome.cause {
            let root = report
                .outcome(of)
                .map(|o| o.name.clone())
                .unwrap_or_else(|| of.short());
            print!("  (because {} did not merge)", root);
        }
        println!();
        if let (Some(error), OutcomeCause::Independent) = (&outcome.error, &outcome.cause) {
            println!("      {}", error);
        }
    }
    let merged = report.tasks.iter().filter(|t| t.merge_status.as_ref().is_some_and(|s| s.is_merged())).count();
    println!();
    println!("{} of {} task(s) merged", merged, report.tasks.len());
}
