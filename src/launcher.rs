//! Runner Enforcer (C3).
//!
//! Given a command vector, decides whether it already uses a canonical
//! launcher, needs rewriting onto one, or should be rejected/skipped.
//! Rewrites never touch more than the first 1–3 tokens; everything after
//! is preserved byte-for-byte.

use crate::catalog::{self, Launcher};
use std::path::Path;

/// Launcher-like program names that are *not* in the approved set
/// (`uv, pipx, pnpm, go, npx` only). Anything else that looks like a
/// launcher (manages its own venv/toolchain invocation) is rejected
/// rather than trusted to be serial-safe.
const UNSUPPORTED_LAUNCHERS: &[&str] = &["poetry", "yarn", "conda", "pipenv", "rye", "hatch"];

#[derive(Debug, Clone)]
pub enum EnforceOutcome {
    /// Vector is already canonical, or enforcement is disabled.
    Unchanged(Vec<String>),
    /// Vector was rewritten onto an approved launcher.
    Rewritten(Vec<String>),
    /// First token is a non-approved launcher.
    UnsupportedLauncher(String),
    /// First token is not in the catalog and `only_verified` is set.
    UnrecognizedTool(String),
}

impl EnforceOutcome {
    /// The resulting command vector, if enforcement did not reject/skip
    /// the submission outright.
    pub fn vector(&self) -> Option<&[String]> {
        match self {
            EnforceOutcome::Unchanged(v) | EnforceOutcome::Rewritten(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnforceOptions<'a> {
    pub enforce_runners: bool,
    pub only_verified: bool,
    pub project_root: Option<&'a Path>,
}

/// Apply the Runner Enforcer to `vector`.
pub fn enforce(vector: &[String], opts: &EnforceOptions) -> EnforceOutcome {
    if vector.is_empty() {
        return EnforceOutcome::Unchanged(vector.to_vec());
    }
    if !opts.enforce_runners {
        return EnforceOutcome::Unchanged(vector.to_vec());
    }

    let head = vector[0].as_str();

    // Already an approved launcher: canonical, nothing to do.
    if Launcher::from_str(head).is_some() {
        return EnforceOutcome::Unchanged(vector.to_vec());
    }

    if UNSUPPORTED_LAUNCHERS.contains(&head) {
        return EnforceOutcome::UnsupportedLauncher(vector.join(" "));
    }

    // Bare `python -m pip ...` -> package-manager-pip form.
    if (head == "python" || head == "python3") && vector.len() >= 3 && vector[1] == "-m" && vector[2] == "pip"
    {
        let mut rewritten = vec!["uv".to_string(), "pip".to_string()];
        rewritten.extend(vector[3..].iter().cloned());
        return EnforceOutcome::Rewritten(rewritten);
    }

    // `npm run X` -> `pnpm run X` when pnpm is available.
    if head == "npm" {
        if launcher_available(Launcher::Pnpm) {
            let mut rewritten = vec!["pnpm".to_string()];
            rewritten.extend(vector[1..].iter().cloned());
            return EnforceOutcome::Rewritten(rewritten);
        }
        return EnforceOutcome::Unchanged(vector.to_vec());
    }

    // Bare `*.py` as the program.
    if head.ends_with(".py") {
        let mut rewritten = vec![Launcher::Uv.as_str().to_string(), "run".to_string()];
        rewritten.extend(vector.iter().cloned());
        return EnforceOutcome::Rewritten(rewritten);
    }

    // package.json-declared script name invoked bare.
    if let Some(root) = opts.project_root {
        if is_package_json_script(root, head) && launcher_available(Launcher::Pnpm) {
            let mut rewritten = vec!["pnpm".to_string(), "run".to_string()];
            rewritten.extend(vector.iter().cloned());
            return EnforceOutcome::Rewritten(rewritten);
        }
    }

    match catalog::lookup(head) {
        Some(spec) => {
            let Some(launcher) = spec.preferred_launcher else {
                return EnforceOutcome::Unchanged(vector.to_vec());
            };
            if !launcher_available(launcher) {
                // Safety principle: when uncertain (launcher missing),
                // leave the vector unmodified rather than guess.
                return EnforceOutcome::Unchanged(vector.to_vec());
            }
            let mut rewritten = match spec.language_family {
                crate::catalog::LanguageFamily::Python => {
                    vec![launcher.as_str().to_string(), "run".to_string()]
                }
                _ => vec![launcher.as_str().to_string()],
            };
            rewritten.extend(vector.iter().cloned());
            EnforceOutcome::Rewritten(rewritten)
        }
        None => {
            if opts.only_verified {
                EnforceOutcome::UnrecognizedTool(head.to_string())
            } else {
                EnforceOutcome::Unchanged(vector.to_vec())
            }
        }
    }
}

/// Check whether `name` appears as an executable in `PATH`. Absence of a
/// discoverable `PATH` is treated as "not available" (conservative).
fn executable_on_path(name: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| {
        let candidate = dir.join(name);
        candidate.is_file()
    })
}

fn launcher_available(launcher: Launcher) -> bool {
    executable_on_path(launcher.as_str())
}

/// True if `package.json` at `project_root` declares a script named `name`.
fn is_package_json_script(project_root: &Path, name: &str) -> bool {
    let Ok(contents) = std::fs::read_to_string(project_root.join("package.json")) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    value
        .get("scripts")
        .and_then(|s| s.get(name))
        .is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    fn opts() -> EnforceOptions<'static> {
        EnforceOptions {
            enforce_runners: true,
            only_verified: false,
            project_root: None,
        }
    }

    #[test]
    fn already_canonical_is_unchanged() {
        let out = enforce(&v("uv run pytest"), &opts());
        assert!(matches!(out, EnforceOutcome::Unchanged(_)));
    }

    #[test]
    fn unsupported_launcher_rejected() {
        let out = enforce(&v("poetry run pytest"), &opts());
        assert!(matches!(out, EnforceOutcome::UnsupportedLauncher(_)));
    }

    #[test]
    fn python_module_pip_rewritten() {
        let out = enforce(&v("python -m pip install rich"), &opts());
        match out {
            EnforceOutcome::Rewritten(v) => {
                assert_eq!(v, vec!["uv", "pip", "install", "rich"]);
            }
            other => panic!("expected Rewritten, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_tool_skipped_when_only_verified() {
        let mut o = opts();
        o.only_verified = true;
        let out = enforce(&v("some-random-tool --flag"), &o);
        assert!(matches!(out, EnforceOutcome::UnrecognizedTool(_)));
    }

    #[test]
    fn unrecognized_tool_passthrough_otherwise() {
        let out = enforce(&v("some-random-tool --flag"), &opts());
        assert!(matches!(out, EnforceOutcome::Unchanged(_)));
    }

    #[test]
    fn enforcement_disabled_is_noop() {
        let mut o = opts();
        o.enforce_runners = false;
        let out = enforce(&v("poetry run pytest"), &o);
        assert!(matches!(out, EnforceOutcome::Unchanged(_)));
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let o = opts();
        let first = enforce(&v("poetry run pytest"), &o);
        // UnsupportedLauncher has no vector to re-feed; idempotence is
        // checked on rewrite outcomes instead (see below) since that is
        // where the property is meaningful.
        assert!(first.vector().is_none());
    }

    #[test]
    fn rewrite_of_bare_py_is_idempotent_once_canonical() {
        let o = opts();
        let first = enforce(&v("script.py --arg"), &o);
        let v1 = first.vector().unwrap().to_vec();
        let second = enforce(&v1, &o);
        let v2 = second.vector().unwrap().to_vec();
        assert_eq!(v1, v2);
    }
}
