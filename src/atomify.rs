//! Tool Atomifier (C4).
//!
//! Given a post-enforcement command vector, returns an ordered list of
//! atomic command vectors whose concatenated effect is a valid
//! replacement for the input under the target tool's semantics. Unknown
//! tools, `none`-rule tools, and gated tier-2 tools (when the gate is
//! off) pass through unsplit — "when uncertain, do not atomify".

use crate::catalog::{self, AtomizationRule, Tier, ToolSpec, UNIVERSAL_EXCLUDED_DIRS};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

#[derive(Debug, Clone)]
pub struct AtomifyOptions<'a> {
    pub project_root: &'a Path,
    pub enable_second_tier: bool,
}

/// Atomify `vector`, returning one or more command vectors in discovery
/// order. Never returns an empty list: unsplit inputs come back as a
/// single-element list containing the original vector.
pub fn atomify(vector: &[String], opts: &AtomifyOptions) -> Vec<Vec<String>> {
    if vector.is_empty() {
        return vec![vector.to_vec()];
    }

    let Some((spec, tool_index)) = locate_tool(vector) else {
        return vec![vector.to_vec()];
    };

    if spec.tier == Tier::Second && !opts.enable_second_tier {
        return vec![vector.to_vec()];
    }

    match spec.atomization_rule {
        AtomizationRule::None => vec![vector.to_vec()],
        AtomizationRule::PerFile => atomize_per_file(vector, tool_index, spec, opts, false),
        AtomizationRule::PerDirectory => atomize_per_file(vector, tool_index, spec, opts, true),
        AtomizationRule::PerTest => atomize_pytest(vector, tool_index, spec, opts),
        AtomizationRule::PerTestMethod => atomize_unittest(vector, tool_index, spec, opts),
    }
}

/// Find the tool name's index in the vector, accounting for an already
/// canonical `<launcher> run <tool> ...` prefix (the `after-tool`
/// position) as well as a bare invocation.
fn locate_tool(vector: &[String]) -> Option<(&'static ToolSpec, usize)> {
    if catalog::Launcher::from_str(vector[0].as_str()).is_some()
        && vector.len() > 2
        && vector[1] == "run"
    {
        if let Some(spec) = catalog::lookup(vector[2].as_str()) {
            return Some((spec, 2));
        }
        return None;
    }
    catalog::lookup(vector[0].as_str()).map(|spec| (spec, 0))
}

/// Split off the trailing run of non-flag tokens as file arguments,
/// skipping any known subcommand tokens that immediately follow the tool
/// name: tool subcommands are excluded from the file argument set by a
/// known-subcommand list.
///
/// Returns `(prefix, file_args)`. `file_args` is empty when the trailing
/// token is itself a flag (nothing to atomize).
fn split_file_args(vector: &[String], tool_index: usize, spec: &ToolSpec) -> (Vec<String>, Vec<String>) {
    let mut prefix_end = tool_index + 1;
    while prefix_end < vector.len() && spec.known_subcommands.contains(&vector[prefix_end].as_str()) {
        prefix_end += 1;
    }

    match spec.file_arg_position {
        catalog::FileArgPosition::AfterFilesFlag(flag) => {
            let Some(flag_idx) = vector[prefix_end..]
                .iter()
                .position(|t| t == flag)
                .map(|i| i + prefix_end)
            else {
                return (vector.to_vec(), vec![]);
            };
            let files_start = flag_idx + 1;
            let files_end = vector[files_start..]
                .iter()
                .position(|t| t.starts_with('-'))
                .map(|i| i + files_start)
                .unwrap_or(vector.len());
            let mut prefix = vector[..files_start].to_vec();
            prefix.extend(vector[files_end..].iter().cloned());
            (prefix, vector[files_start..files_end].to_vec())
        }
        catalog::FileArgPosition::End | catalog::FileArgPosition::AfterTool => {
            // Walk backward from the end collecting non-flag tokens.
            let mut split = vector.len();
            while split > prefix_end && !vector[split - 1].starts_with('-') {
                split -= 1;
            }
            if split == vector.len() {
                return (vector.to_vec(), vec![]);
            }
            (vector[..split].to_vec(), vector[split..].to_vec())
        }
    }
}

/// Path expansion: classify each raw file argument as a regular file,
/// directory, or glob pattern, and return the ordered, deduplicated,
/// ignore-file-filtered list of concrete paths.
fn expand_paths(raw_args: &[String], project_root: &Path, spec: &ToolSpec) -> Vec<String> {
    let ignore_patterns = load_ignore_patterns(project_root, spec.ignore_files);
    let mut out = Vec::new();

    for arg in raw_args {
        if is_glob_pattern(arg) {
            let pattern = resolve_against_root(arg, project_root);
            if let Ok(paths) = glob::glob(&pattern) {
                for entry in paths.flatten() {
                    push_if_allowed(&mut out, &entry, spec, &ignore_patterns, project_root);
                }
            }
            continue;
        }

        let candidate = resolve_path(arg, project_root);
        if candidate.is_dir() {
            let mut found: Vec<PathBuf> = walkdir::WalkDir::new(&candidate)
                .into_iter()
                .filter_entry(|e| !is_excluded_dir(e.path()))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| extension_matches(p, spec.extensions))
                .collect();
            found.sort();
            for p in found {
                push_if_allowed(&mut out, &p, spec, &ignore_patterns, project_root);
            }
        } else {
            // Regular file (or a non-existent path we trust the caller on).
            push_if_allowed(&mut out, Path::new(arg), spec, &ignore_patterns, project_root);
        }
    }

    out
}

fn push_if_allowed(
    out: &mut Vec<String>,
    path: &Path,
    _spec: &ToolSpec,
    ignore_patterns: &[glob::Pattern],
    project_root: &Path,
) {
    let rel = path.strip_prefix(project_root).unwrap_or(path);
    let rel_str = rel.to_string_lossy();
    if ignore_patterns.iter().any(|p| p.matches(rel_str.as_ref())) {
        return;
    }
    let s = rel_str.into_owned();
    if !out.contains(&s) {
        out.push(s);
    }
}

fn is_excluded_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| UNIVERSAL_EXCLUDED_DIRS.contains(&n))
        .unwrap_or(false)
}

fn extension_matches(path: &Path, extensions: &[&str]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.contains(&e))
        .unwrap_or(false)
}

fn is_glob_pattern(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

fn resolve_path(arg: &str, project_root: &Path) -> PathBuf {
    let p = Path::new(arg);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        project_root.join(p)
    }
}

fn resolve_against_root(arg: &str, project_root: &Path) -> String {
    if Path::new(arg).is_absolute() {
        arg.to_string()
    } else {
        project_root.join(arg).to_string_lossy().into_owned()
    }
}

fn load_ignore_patterns(project_root: &Path, ignore_files: &[&str]) -> Vec<glob::Pattern> {
    for name in ignore_files {
        let path = project_root.join(name);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return contents
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .filter_map(|l| glob::Pattern::new(l).ok())
                .collect();
        }
    }
    Vec::new()
}

fn atomize_per_file(
    vector: &[String],
    tool_index: usize,
    spec: &ToolSpec,
    opts: &AtomifyOptions,
    per_directory: bool,
) -> Vec<Vec<String>> {
    let (prefix, raw_args) = split_file_args(vector, tool_index, spec);
    if raw_args.is_empty() {
        return vec![vector.to_vec()];
    }
    let files = expand_paths(&raw_args, opts.project_root, spec);
    if files.is_empty() {
        return vec![vector.to_vec()];
    }

    if per_directory {
        let mut dirs: Vec<String> = Vec::new();
        for f in &files {
            let parent = Path::new(f)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !dirs.contains(&parent) {
                dirs.push(parent);
            }
        }
        dirs.into_iter()
            .map(|d| {
                let mut v = prefix.clone();
                v.push(d);
                v
            })
            .collect()
    } else {
        files
            .into_iter()
            .map(|f| {
                let mut v = prefix.clone();
                v.push(f);
                v
            })
            .collect()
    }
}

static SNAPSHOT_UPDATE_FLAG: &str = "--snapshot-update";

fn atomize_pytest(
    vector: &[String],
    tool_index: usize,
    spec: &ToolSpec,
    opts: &AtomifyOptions,
) -> Vec<Vec<String>> {
    // Already-atomized or unselectable inputs collapse to a single vector.
    if vector.iter().any(|t| t == "-k" || t.contains("::")) {
        return vec![vector.to_vec()];
    }

    let (prefix, raw_args) = split_file_args(vector, tool_index, spec);
    if raw_args.is_empty() {
        return vec![vector.to_vec()];
    }
    let files = expand_paths(&raw_args, opts.project_root, spec);
    if files.is_empty() {
        return vec![vector.to_vec()];
    }

    let snapshot_update = prefix.iter().any(|t| t == SNAPSHOT_UPDATE_FLAG);
    let base_prefix: Vec<String> = prefix
        .iter()
        .filter(|t| *t != SNAPSHOT_UPDATE_FLAG)
        .cloned()
        .collect();

    let mut ids: Vec<(String, bool)> = Vec::new(); // (file::id, is_snapshot)
    for file in &files {
        match collect_pytest_ids(Path::new(file)) {
            Some(file_ids) => {
                for (name, is_snapshot) in file_ids {
                    ids.push((format!("{file}::{name}"), is_snapshot));
                }
            }
            // Inability to enumerate tests for any file: collapse the
            // whole submission rather than guess at partial coverage.
            None => return vec![vector.to_vec()],
        }
    }
    if ids.is_empty() {
        return vec![vector.to_vec()];
    }

    if !snapshot_update {
        return ids
            .into_iter()
            .map(|(id, _)| {
                let mut v = base_prefix.clone();
                v.push(id);
                v
            })
            .collect();
    }

    // --snapshot-update: pair up snapshot-using tests, keep the flag;
    // emit regular tests individually with the flag stripped.
    let mut out = Vec::new();
    let mut pending_snapshot: Option<String> = None;
    for (id, is_snapshot) in ids {
        if is_snapshot {
            match pending_snapshot.take() {
                Some(first) => {
                    let mut v = prefix.clone();
                    v.push(first);
                    v.push(id);
                    out.push(v);
                }
                None => pending_snapshot = Some(id),
            }
        } else {
            let mut v = base_prefix.clone();
            v.push(id);
            out.push(v);
        }
    }
    if let Some(last) = pending_snapshot {
        let mut v = prefix.clone();
        v.push(last);
        out.push(v);
    }
    out
}

fn atomize_unittest(
    vector: &[String],
    tool_index: usize,
    spec: &ToolSpec,
    opts: &AtomifyOptions,
) -> Vec<Vec<String>> {
    let (prefix, raw_args) = split_file_args(vector, tool_index, spec);
    if raw_args.is_empty() {
        return vec![vector.to_vec()];
    }
    let files = expand_paths(&raw_args, opts.project_root, spec);
    if files.is_empty() {
        return vec![vector.to_vec()];
    }

    let mut out = Vec::new();
    for file in files {
        match collect_unittest_ids(Path::new(&file)) {
            Some(ids) if !ids.is_empty() => {
                let module = module_name(Path::new(&file));
                for dotted in ids {
                    let mut v = prefix.clone();
                    v.push(format!("{module}.{dotted}"));
                    out.push(v);
                }
            }
            _ => {
                let mut v = prefix.clone();
                v.push(file);
                out.push(v);
            }
        }
    }
    out
}

fn module_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^class\s+([A-Za-z_]\w*)").unwrap());
static DEF_TOP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^def\s+(test_\w+)\s*\(").unwrap());
static DEF_METHOD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s+)def\s+(test_\w+)\s*\(").unwrap());

/// Statically scan a Python test file for `test_*` functions and
/// `Class::test_method` pairs, in source order. Returns `None` when the
/// file cannot be read at all — an inability to enumerate tests collapses
/// pytest atomization for the whole submission.
///
/// Each entry also reports whether the test looks like it exercises a
/// snapshot-comparison call, used by the `--snapshot-update` pairing rule.
fn collect_pytest_ids(path: &Path) -> Option<Vec<(String, bool)>> {
    let contents = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = contents.lines().collect();

    let mut ids = Vec::new();
    let mut current_class: Option<String> = None;

    for (i, line) in lines.iter().enumerate() {
        let indent0 = !line.starts_with(' ') && !line.starts_with('\t');
        if indent0 && !line.trim().is_empty() {
            if let Some(c) = CLASS_RE.captures(line) {
                current_class = Some(c[1].to_string());
                continue;
            }
            if let Some(c) = DEF_TOP_RE.captures(line) {
                let name = c[1].to_string();
                ids.push((name.clone(), body_mentions_snapshot(&lines, i)));
                current_class = None;
                continue;
            }
            current_class = None;
        } else if let (Some(class), Some(c)) = (&current_class, DEF_METHOD_RE.captures(line)) {
            let name = c[2].to_string();
            ids.push((format!("{class}::{name}"), body_mentions_snapshot(&lines, i)));
        }
    }

    Some(ids)
}

/// Static detector for snapshot-comparison usage: scans the function body
/// (until the next line at or below the definition's indentation) for a
/// call that looks like a snapshot assertion.
fn body_mentions_snapshot(lines: &[&str], def_line: usize) -> bool {
    let def_indent = leading_whitespace(lines[def_line]);
    for line in &lines[def_line + 1..] {
        if line.trim().is_empty() {
            continue;
        }
        let indent = leading_whitespace(line);
        if indent <= def_indent {
            break;
        }
        let lower = line.to_lowercase();
        if lower.contains("snapshot") {
            return true;
        }
    }
    false
}

fn leading_whitespace(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Static scan for `unittest.TestCase` style `def test_*` methods nested
/// under a class, returning `Class.method` dotted identifiers. Returns
/// `None` when extraction fails outright (unreadable file).
fn collect_unittest_ids(path: &Path) -> Option<Vec<String>> {
    let ids = collect_pytest_ids(path)?;
    Some(
        ids.into_iter()
            .filter_map(|(id, _)| id.split("::").collect::<Vec<_>>().join(".").into())
            .filter(|id: &String| id.contains('.'))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn v(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn unknown_tool_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("make test"), &opts);
        assert_eq!(out, vec![v("make test")]);
    }

    #[test]
    fn per_file_splits_directory_into_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/a.py"), "").unwrap();
        fs::write(dir.path().join("src/b.py"), "").unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("ruff check src"), &opts);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|cmd| cmd[0] == "ruff" && cmd[1] == "check"));
        // Emitted paths are project-root-relative, matching spec §8 E1's
        // literal `ruff check src/a.py` — not an absolute path.
        let mut files: Vec<&str> = out.iter().map(|cmd| cmd[2].as_str()).collect();
        files.sort();
        assert_eq!(files, vec!["src/a.py", "src/b.py"]);
    }

    #[test]
    fn pytest_splits_into_per_test_vectors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("t.py"),
            "def test_one():\n    pass\n\ndef test_two():\n    pass\n",
        )
        .unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("pytest t.py"), &opts);
        assert_eq!(out.len(), 2);
        assert!(out[0].last().unwrap().ends_with("t.py::test_one"));
        assert!(out[1].last().unwrap().ends_with("t.py::test_two"));
    }

    #[test]
    fn pytest_with_k_selector_is_not_split() {
        let dir = tempfile::tempdir().unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("pytest -k test_one t.py"), &opts);
        assert_eq!(out, vec![v("pytest -k test_one t.py")]);
    }

    #[test]
    fn already_atomized_test_id_is_not_split() {
        let dir = tempfile::tempdir().unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let input = vec![
            "pytest".to_string(),
            "t.py::test_one".to_string(),
        ];
        let out = atomify(&input, &opts);
        assert_eq!(out, vec![input]);
    }

    #[test]
    fn tier_two_tool_gated_off_by_default() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("t.py"),
            "class T:\n    def test_one(self):\n        pass\n",
        )
        .unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("unittest t.py"), &opts);
        assert_eq!(out, vec![v("unittest t.py")]);
    }

    #[test]
    fn tier_two_tool_splits_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("t.py"),
            "class T:\n    def test_one(self):\n        pass\n    def test_two(self):\n        pass\n",
        )
        .unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: true,
        };
        let out = atomify(&v("unittest t.py"), &opts);
        assert_eq!(out.len(), 2);
        assert!(out[0].last().unwrap().ends_with("t.T.test_one"));
    }

    #[test]
    fn snapshot_update_pairs_snapshot_tests() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("t.py"),
            "def test_a():\n    assert_snapshot(x)\n\n\
             def test_b():\n    assert_snapshot(y)\n\n\
             def test_c():\n    assert True\n",
        )
        .unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let out = atomify(&v("pytest --snapshot-update t.py"), &opts);
        // test_a + test_b paired (2 ids in one vector), test_c alone without the flag.
        assert_eq!(out.len(), 2);
        let paired = out.iter().find(|c| c.len() > 3).unwrap();
        assert!(paired.contains(&"--snapshot-update".to_string()));
        let solo = out.iter().find(|c| c.len() <= 3).unwrap();
        assert!(!solo.contains(&"--snapshot-update".to_string()));
    }

    #[test]
    fn idempotent_when_already_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let opts = AtomifyOptions {
            project_root: dir.path(),
            enable_second_tier: false,
        };
        let input = v("make test");
        let once = atomify(&input, &opts);
        let twice = atomify(&once[0], &opts);
        assert_eq!(once, twice);
    }
}
