use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::core::dag::TieBreakKind;
use crate::orchestration::retry::RetryPolicy;
use crate::{Error, Result};

/// Settings for the external phase worker command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: "swarm-worker".to_string(),
            args: Vec::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Phase worker pool size.
    pub max_concurrent: usize,
    /// Automatic re-implementation rounds after `ChangesRequested`.
    pub max_review_retries: u32,
    pub provider_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub tie_break: TieBreakKind,
    pub worktree_dir: Option<String>,
    /// Branch runs fork from; defaults to the current HEAD branch.
    pub base_branch: Option<String>,
    pub staging_branch_prefix: String,
    /// Argv run in the integration worktree after each merge.
    pub validate_command: Option<Vec<String>>,
    pub keep_failed_workspaces: bool,
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_review_retries: 1,
            provider_retries: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5000,
            tie_break: TieBreakKind::Declaration,
            worktree_dir: None,
            base_branch: None,
            staging_branch_prefix: "swarm/staging-".to_string(),
            validate_command: None,
            keep_failed_workspaces: true,
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn swarm_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".swarm"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("swarm.toml"))
    }

    pub fn runs_dir() -> Result<PathBuf> {
        Ok(Self::swarm_dir()?.join("runs"))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::swarm_dir()?.join("worktrees")),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.provider_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: 2.0,
        }
    }

    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Validation("max_concurrent must be at least 1".to_string()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::Validation(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms".to_string(),
            ));
        }
        if matches!(&self.validate_command, Some(argv) if argv.is_empty()) {
            return Err(Error::Validation("validate_command must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrent = config.max_concurrent,
            tie_break = ?config.tie_break,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::swarm_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Self::swarm_dir()?, Self::runs_dir()?, self.worktrees_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
