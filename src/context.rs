//! Run context: the `branch`, `commit`, `user`, `event` and `workflow`
//! fields a run is tagged with.
//!
//! Detected via a plain `std::process::Command` shelling out to `git`,
//! best-effort, never fatal when the project isn't a git repository or
//! `git` isn't on `PATH`.

use std::path::Path;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub branch: String,
    pub commit: String,
    pub user: String,
    pub event: String,
    pub workflow: String,
}

const UNKNOWN: &str = "unknown";
const DEFAULT_EVENT: &str = "manual";
const DEFAULT_WORKFLOW: &str = "manual";

impl RunContext {
    /// Detect `branch`/`commit` from git, `user` from the environment, and
    /// default `event`/`workflow` to the manual-invocation values,
    /// applying the given overrides on top.
    pub fn detect(project_root: &Path, event: Option<&str>, workflow: Option<&str>, user: Option<&str>) -> RunContext {
        RunContext {
            branch: git_output(project_root, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_else(|| UNKNOWN.to_string()),
            commit: git_output(project_root, &["rev-parse", "HEAD"]).unwrap_or_else(|| UNKNOWN.to_string()),
            user: user.map(str::to_string).unwrap_or_else(detect_user),
            event: event.map(str::to_string).unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            workflow: workflow.map(str::to_string).unwrap_or_else(|| DEFAULT_WORKFLOW.to_string()),
        }
    }
}

fn git_output(project_root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(project_root)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "HEAD" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn detect_user() -> String {
    for key in ["USER", "USERNAME", "LOGNAME"] {
        if let Ok(v) = std::env::var(key) {
            if !v.is_empty() {
                return v;
            }
        }
    }
    UNKNOWN.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_git_directory_falls_back_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::detect(dir.path(), None, None, None);
        assert_eq!(ctx.branch, UNKNOWN);
        assert_eq!(ctx.commit, UNKNOWN);
        assert_eq!(ctx.event, DEFAULT_EVENT);
        assert_eq!(ctx.workflow, DEFAULT_WORKFLOW);
    }

    #[test]
    fn overrides_win() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RunContext::detect(dir.path(), Some("push"), Some("ci"), Some("alice"));
        assert_eq!(ctx.event, "push");
        assert_eq!(ctx.workflow, "ci");
        assert_eq!(ctx.user, "alice");
    }
}
