//! Logging setup.
//!
//! Everything is written to `~/.swarm/swarm.log`, truncated at startup.
//! Level is `info` by default and `debug` with `--debug` or `SWARM_DEBUG=1`;
//! `RUST_LOG` overrides both.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Whether debug logging was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("SWARM_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn default_directive(debug: bool) -> &'static str {
    if debug || env_debug() {
        "swarm=debug,info"
    } else {
        "info"
    }
}

/// Path of the log file, creating `~/.swarm` if needed.
pub fn log_path() -> Option<PathBuf> {
    let dir = Config::swarm_dir().ok()?;
    fs::create_dir_all(&dir).ok()?;
    Some(dir.join("swarm.log"))
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let Some(file) = log_path().and_then(|path| File::create(path).ok()) else {
        // No home directory: log to stderr instead of dropping everything.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(file))
        .try_init();
}
