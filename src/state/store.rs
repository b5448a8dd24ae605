//! JSON snapshots of runs under `~/.swarm/runs/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::Config;
use crate::core::dag::MergePlan;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::controller::{RunReport, RunStatus};
use crate::orchestration::RunId;
use crate::util::blocking;

/// Everything an operator needs to inspect a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub tasks: Vec<Task>,
    pub plan: MergePlan,
    pub plan_frozen: bool,
    pub report: Option<RunReport>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `~/.swarm/runs`.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Config::runs_dir()?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.json", run_id))
    }

    fn cancel_path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.cancel", run_id))
    }

    pub async fn save(&self, snapshot: &RunSnapshot) -> Result<()> {
        let store = self.clone();
        let snapshot = snapshot.clone();
        blocking(move || store.save_sync(&snapshot)).await
    }

    /// Write the snapshot through a temp file so readers never see a
    /// partial document.
    pub fn save_sync(&self, snapshot: &RunSnapshot) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        let path = self.snapshot_path(&snapshot.run_id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&temp_path, &path)?;
        debug!(run = %snapshot.run_id, status = %snapshot.status, "run snapshot saved");
        Ok(())
    }

    pub fn load(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let path = self.snapshot_path(run_id);
        if !path.exists() {
            return Err(Error::RunNotFound(*run_id));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    /// All stored runs, oldest update first.
    pub fn list(&self) -> Result<Vec<RunSnapshot>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|text| serde_json::from_str::<RunSnapshot>(&text).map_err(Error::from))
            {
                Ok(snapshot) => runs.push(snapshot),
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        runs.sort_by_key(|r| r.updated_at);
        Ok(runs)
    }

    pub fn latest(&self) -> Result<Option<RunSnapshot>> {
        Ok(self.list()?.pop())
    }

    /// Find a run by full id or unique id prefix; `None` picks the latest.
    pub fn resolve(&self, reference: Option<&str>) -> Result<RunSnapshot> {
        let Some(reference) = reference else {
            return self
                .latest()?
                .ok_or_else(|| Error::Validation("no runs recorded".to_string()));
        };
        if let Ok(run_id) = reference.parse::<RunId>() {
            return self.load(&run_id);
        }
        let mut matches: Vec<RunSnapshot> = self
            .list()?
            .into_iter()
            .filter(|r| r.run_id.to_string().starts_with(reference))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::Validation(format!("no run matches '{}'", reference))),
            n => Err(Error::Validation(format!("'{}' is ambiguous ({} runs)", reference, n))),
        }
    }

    /// Queue a cancellation for the process driving `run_id`. `task` is a
    /// task name or id.
    pub fn request_cancel(&self, run_id: &RunId, task: &str) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.cancel_path(run_id))?;
        writeln!(file, "{}", task.trim())?;
        debug!(run = %run_id, task, "cancellation queued");
        Ok(())
    }

    /// Drain queued cancellation requests.
    pub fn take_cancel_requests(&self, run_id: &RunId) -> Result<Vec<String>> {
        let path = self.cancel_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let taken = path.with_extension("cancel.taken");
        fs::rename(&path, &taken)?;
        let text = fs::read_to_string(&taken)?;
        fs::remove_file(&taken)?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
