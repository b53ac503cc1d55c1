//! Typed configuration threaded into every component constructor.
//!
//! Resolution order for each field is: explicit CLI flag, then the
//! matching environment variable, then a value sourced from
//! `.env.development` at the project root (if present), then a
//! hard-coded default. Centralizing resolution here avoids reading
//! `std::env` ad hoc from deep inside a component.

use crate::signal::Signal;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default outer wall-clock bound for an entire run: 24 hours.
pub const DEFAULT_PIPELINE_TIMEOUT_S: u64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    /// Per-command timeout in seconds; 0 disables it.
    pub timeout_s: u64,
    /// Outer wall-clock bound for the whole run, in seconds.
    pub pipeline_timeout_s: u64,
    /// Per-process memory cap in MiB; 0 disables it.
    pub memory_limit_mb: u64,
    /// Directory under which per-job and per-run logs are written.
    pub log_dir: PathBuf,
    pub verbose: bool,
    /// Whether the Tool Atomifier is engaged at all.
    pub atomify: bool,
    /// Whether the Runner Enforcer rewrites bare invocations.
    pub enforce_runners: bool,
    /// Gate for tier-2 (opt-in) atomization rules, e.g. unittest.
    pub enable_second_tier: bool,
    /// When set, an unrecognized tool causes `UnrecognizedTool` rather
    /// than being enqueued unmodified.
    pub only_verified: bool,
    /// Attempts before giving up on a command (0 means "try once").
    pub retries: u32,
    /// Signal delivered to a command's process group on timeout, before
    /// the SIGKILL escalation.
    pub kill_signal: Signal,
    /// Overrides for the run context fields. `None` defers to
    /// git/environment detection in [`crate::context`].
    pub event: Option<String>,
    pub workflow: Option<String>,
    pub user: Option<String>,
}

impl Config {
    /// Build a `Config` for `project_root`, applying the CLI-flag overrides
    /// given in `overrides` on top of environment variables and
    /// `.env.development`, falling back to defaults last.
    pub fn resolve(project_root: &Path, overrides: &ConfigOverrides) -> Config {
        let env_file = load_dev_env_file(project_root);
        let lookup = |key: &str| -> Option<String> {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| env_file.get(key).cloned())
        };

        let timeout_s = overrides
            .timeout_s
            .or_else(|| lookup("TIMEOUT").and_then(|v| v.parse().ok()))
            .unwrap_or(0);

        let pipeline_timeout_s = overrides
            .pipeline_timeout_s
            .or_else(|| lookup("PIPELINE_TIMEOUT").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_PIPELINE_TIMEOUT_S);

        let memory_limit_mb = overrides
            .memory_limit_mb
            .or_else(|| lookup("MEMORY_LIMIT_MB").and_then(|v| v.parse().ok()))
            .unwrap_or(0);

        let log_dir = overrides
            .log_dir
            .clone()
            .or_else(|| lookup("LOG_DIR").map(PathBuf::from))
            .unwrap_or_else(|| project_root.join(".sequential-locks").join("logs"));

        let verbose = overrides.verbose
            || lookup("VERBOSE")
                .map(|v| is_truthy(&v))
                .unwrap_or(false);

        let atomify = overrides
            .atomify
            .or_else(|| lookup("ATOMIFY").map(|v| is_truthy(&v)))
            .unwrap_or(true);

        let enforce_runners = overrides
            .enforce_runners
            .or_else(|| lookup("ENFORCE_RUNNERS").map(|v| is_truthy(&v)))
            .unwrap_or(true);

        let enable_second_tier = overrides
            .enable_second_tier
            .or_else(|| lookup("ENABLE_SECOND_TIER").map(|v| is_truthy(&v)))
            .unwrap_or(false);

        let only_verified = overrides
            .only_verified
            .or_else(|| lookup("ONLY_VERIFIED").map(|v| is_truthy(&v)))
            .unwrap_or(false);

        Config {
            project_root: project_root.to_path_buf(),
            timeout_s,
            pipeline_timeout_s,
            memory_limit_mb,
            log_dir,
            verbose,
            atomify,
            enforce_runners,
            enable_second_tier,
            only_verified,
            retries: overrides.retries.unwrap_or(0),
            // Not one of the §6 environment/CLI knobs: the supervisor's
            // contract takes a `kill_signal`, but the external interface
            // never exposes it, so this is always the `TERM` default.
            kill_signal: overrides.kill_signal.unwrap_or_default(),
            event: overrides.event.clone().or_else(|| lookup("EVENT")),
            workflow: overrides.workflow.clone().or_else(|| lookup("WORKFLOW")),
            user: overrides.user.clone().or_else(|| lookup("USER")),
        }
    }
}

/// CLI-flag-sourced overrides; `None` means "defer to environment/default".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub timeout_s: Option<u64>,
    pub pipeline_timeout_s: Option<u64>,
    pub memory_limit_mb: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub verbose: bool,
    pub atomify: Option<bool>,
    pub enforce_runners: Option<bool>,
    pub enable_second_tier: Option<bool>,
    pub only_verified: Option<bool>,
    pub retries: Option<u32>,
    pub kill_signal: Option<Signal>,
    pub event: Option<String>,
    pub workflow: Option<String>,
    pub user: Option<String>,
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

/// Load `KEY=VALUE` pairs from `.env.development` at `project_root`, if it
/// exists. Lines starting with `#` and blank lines are ignored. Malformed
/// lines (no `=`) are skipped rather than treated as an error, since this
/// file is an optional convenience, not a required input.
fn load_dev_env_file(project_root: &Path) -> HashMap<String, String> {
    let path = project_root.join(".env.development");
    let mut out = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return out;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(pos) = line.find('=') {
            let key = line[..pos].trim().to_string();
            let val = line[pos + 1..].trim().trim_matches('"').to_string();
            out.insert(key, val);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_nothing_set() {
        let dir = tempfile::tempdir().unwrap();
        // SAFETY: test-only, serialized by the test harness default (single
        // process, no other test mutates these keys concurrently in this module).
        unsafe {
            std::env::remove_var("TIMEOUT");
            std::env::remove_var("PIPELINE_TIMEOUT");
            std::env::remove_var("MEMORY_LIMIT_MB");
        }
        let cfg = Config::resolve(dir.path(), &ConfigOverrides::default());
        assert_eq!(cfg.timeout_s, 0);
        assert_eq!(cfg.pipeline_timeout_s, DEFAULT_PIPELINE_TIMEOUT_S);
        assert_eq!(cfg.memory_limit_mb, 0);
        assert!(cfg.atomify);
        assert!(cfg.enforce_runners);
        assert!(!cfg.enable_second_tier);
    }

    #[test]
    fn cli_override_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("TIMEOUT", "99");
        }
        let overrides = ConfigOverrides {
            timeout_s: Some(5),
            ..Default::default()
        };
        let cfg = Config::resolve(dir.path(), &overrides);
        unsafe {
            std::env::remove_var("TIMEOUT");
        }
        assert_eq!(cfg.timeout_s, 5);
    }

    #[test]
    fn dev_env_file_is_sourced() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env.development"), "MEMORY_LIMIT_MB=512\n").unwrap();
        unsafe {
            std::env::remove_var("MEMORY_LIMIT_MB");
        }
        let cfg = Config::resolve(dir.path(), &ConfigOverrides::default());
        assert_eq!(cfg.memory_limit_mb, 512);
    }
}
