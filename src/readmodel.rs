//! Read model: `run list`, `run view`, `run watch`, rendered under
//! CI-compatible field names.
//!
//! Pure functions over [`crate::recorder::Recorder`]'s on-disk layout —
//! never touches the execution lock, and tolerates concurrent writers the
//! same way the Recorder itself does (a value may be briefly missing, but
//! is never torn).

use crate::recorder::{JobRecord, JobStatus, RunRecord, RunStatus};
use serde_json::{Map, Value};

/// Filters accepted by `run list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilters {
    pub limit: Option<usize>,
    pub status: Option<String>,
    pub branch: Option<String>,
    pub workflow: Option<String>,
    pub user: Option<String>,
    pub commit: Option<String>,
    pub event: Option<String>,
    /// `YYYY-MM-DD`; matches runs started on that UTC date.
    pub created: Option<String>,
    /// Include runs of every status rather than just the default set.
    pub all: bool,
}

/// The GitHub-Actions-flavored `(status, conclusion)` pair a run maps to.
pub fn ci_status(run: &RunRecord) -> (&'static str, Option<&'static str>) {
    match run.status {
        RunStatus::Running => ("in_progress", None),
        RunStatus::Stopped => ("completed", Some("cancelled")),
        RunStatus::Completed | RunStatus::Failed => {
            let failed = run.failed_job_count > 0 || matches!(run.status, RunStatus::Failed);
            ("completed", Some(if failed { "failure" } else { "success" }))
        }
    }
}

/// A single glyph summarizing a run's outcome, for the terminal renderer.
pub fn status_glyph(run: &RunRecord) -> &'static str {
    match ci_status(run) {
        ("in_progress", _) => "●",
        (_, Some("success")) => "✓",
        (_, Some("cancelled")) => "⊘",
        _ => "✗",
    }
}

fn iso8601(epoch_s: u64) -> String {
    chrono::DateTime::from_timestamp(epoch_s as i64, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn matches_filters(run: &RunRecord, filters: &ListFilters) -> bool {
    if let Some(status) = &filters.status {
        let (s, c) = ci_status(run);
        if s != status && c != Some(status.as_str()) {
            return false;
        }
    }
    if let Some(b) = &filters.branch {
        if &run.branch != b {
            return false;
        }
    }
    if let Some(w) = &filters.workflow {
        if &run.workflow != w {
            return false;
        }
    }
    if let Some(u) = &filters.user {
        if &run.user != u {
            return false;
        }
    }
    if let Some(c) = &filters.commit {
        if &run.commit != c {
            return false;
        }
    }
    if let Some(e) = &filters.event {
        if &run.event != e {
            return false;
        }
    }
    if let Some(d) = &filters.created {
        let created = iso8601(run.started_at_epoch_s);
        if !created.starts_with(d.as_str()) {
            return false;
        }
    }
    true
}

/// Apply `filters` to `runs` (already loaded, most-recent-first) and
/// truncate to `limit` (default 20, a bounded default page size matching
/// common CI-client convention).
pub fn apply_filters(runs: Vec<RunRecord>, filters: &ListFilters) -> Vec<RunRecord> {
    let limit = filters.limit.unwrap_or(20);
    runs.into_iter()
        .filter(|r| matches_filters(r, filters))
        .take(limit)
        .collect()
}

/// One line of the terminal `run list` rendering: glyph, id, status,
/// timestamp, branch, job count, duration.
pub fn render_list_line(run: &RunRecord) -> String {
    let duration = run
        .finished_at_epoch_s
        .map(|end| format!("{}s", end.saturating_sub(run.started_at_epoch_s)))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{glyph}  {id}  {status}  {ts}  {branch}  {jobs} jobs  {duration}",
        glyph = status_glyph(run),
        id = run.run_id,
        status = ci_status(run).1.unwrap_or("in_progress"),
        ts = iso8601(run.started_at_epoch_s),
        branch = run.branch,
        jobs = run.job_count,
        duration = duration,
    )
}

/// The CI-compatible JSON record for one run: a JSON object with
/// CI-style field names.
pub fn run_to_json(run: &RunRecord) -> Value {
    let (status, conclusion) = ci_status(run);
    let mut obj = Map::new();
    obj.insert("databaseId".into(), Value::String(run.run_id.clone()));
    obj.insert("name".into(), Value::String(run.workflow.clone()));
    obj.insert("status".into(), Value::String(status.to_string()));
    obj.insert(
        "conclusion".into(),
        conclusion.map(|c| Value::String(c.to_string())).unwrap_or(Value::Null),
    );
    obj.insert("workflowName".into(), Value::String(run.workflow.clone()));
    obj.insert("headBranch".into(), Value::String(run.branch.clone()));
    obj.insert("headSha".into(), Value::String(run.commit.clone()));
    obj.insert("createdAt".into(), Value::String(iso8601(run.started_at_epoch_s)));
    obj.insert(
        "updatedAt".into(),
        Value::String(iso8601(run.finished_at_epoch_s.unwrap_or(run.started_at_epoch_s))),
    );
    obj.insert("startedAt".into(), Value::String(iso8601(run.started_at_epoch_s)));
    let mut actor = Map::new();
    actor.insert("login".into(), Value::String(run.user.clone()));
    obj.insert("actor".into(), Value::Object(actor));
    obj.insert("event".into(), Value::String(run.event.clone()));
    obj.insert("url".into(), Value::String(format!("file://{}", run.project_root)));
    obj.insert("jobCount".into(), Value::Number(run.job_count.into()));
    Value::Object(obj)
}

/// Restrict a JSON run record to a caller-selected field list (`--json
/// FIELDS`).
pub fn select_fields(value: Value, fields: &[String]) -> Value {
    if fields.is_empty() {
        return value;
    }
    let Value::Object(map) = value else { return value };
    let mut out = Map::new();
    for field in fields {
        if let Some(v) = map.get(field.as_str()) {
            out.insert(field.clone(), v.clone());
        }
    }
    Value::Object(out)
}

/// Apply a small, dot-path-only subset of jq to a JSON array of run
/// records: `.`, `.field`, `.[]`, `.[].field`, and `.field.nested`. One
/// output line per selected value, scalars printed bare and objects/arrays
/// as compact JSON. Anything beyond dot-paths (pipes, filters, functions)
/// is rejected with `None` rather than silently mis-evaluated.
pub fn apply_jq_path(value: &Value, expr: &str) -> Option<Vec<Value>> {
    let expr = expr.trim();
    if expr == "." {
        return Some(vec![value.clone()]);
    }
    let rest = expr.strip_prefix('.')?;
    let mut values = vec![value.clone()];
    let mut chars = rest.chars().peekable();
    let mut field = String::new();
    let flush_field = |field: &mut String, values: &mut Vec<Value>| -> bool {
        if field.is_empty() {
            return true;
        }
        *values = values
            .iter()
            .filter_map(|v| v.as_object().and_then(|o| o.get(field.as_str())).cloned())
            .collect();
        field.clear();
        true
    };
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !flush_field(&mut field, &mut values) {
                    return None;
                }
            }
            '[' => {
                if !flush_field(&mut field, &mut values) {
                    return None;
                }
                match chars.next() {
                    Some(']') => {
                        values = values
                            .iter()
                            .flat_map(|v| v.as_array().cloned().unwrap_or_default())
                            .collect();
                    }
                    _ => return None, // indexed/sliced selectors are not supported
                }
            }
            c if c.is_alphanumeric() || c == '_' => field.push(c),
            _ => return None,
        }
    }
    if !flush_field(&mut field, &mut values) {
        return None;
    }
    Some(values)
}

/// Render one jq-selected value the way `jq -r`-style output would: bare
/// for strings/numbers/bools/null, compact JSON otherwise.
pub fn render_jq_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Render a run record against a minimal Go-template-style string:
/// `{{.Field}}` placeholders are substituted from the record's CI-style
/// JSON, `{{"\n"}}` and `{{"\t"}}` escapes are recognized as literal
/// separators (the two escapes `gh`'s own templates lean on most).
pub fn render_template(run: &RunRecord, template: &str) -> String {
    let json = run_to_json(run);
    let mut out = String::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str("{{");
            rest = after;
            continue;
        };
        let token = after[..end].trim();
        out.push_str(&render_template_token(&json, token));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

fn render_template_token(json: &Value, token: &str) -> String {
    match token {
        "\"\\n\"" => "\n".to_string(),
        "\"\\t\"" => "\t".to_string(),
        _ => {
            let Some(path) = token.strip_prefix('.') else {
                return String::new();
            };
            let mut cur = json.clone();
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                let Some(next) = cur.as_object().and_then(|o| o.get(segment)).cloned() else {
                    return String::new();
                };
                cur = next;
            }
            render_jq_value(&cur)
        }
    }
}

pub fn job_to_json(job: &JobRecord) -> Value {
    let mut obj = Map::new();
    obj.insert("jobId".into(), Value::String(job.job_id.clone()));
    obj.insert("runId".into(), Value::String(job.run_id.clone()));
    obj.insert(
        "command".into(),
        Value::Array(job.command.iter().cloned().map(Value::String).collect()),
    );
    obj.insert("status".into(), Value::String(job_status_str(job.status).to_string()));
    obj.insert(
        "exitCode".into(),
        job.exit_code.map(|c| Value::Number(c.into())).unwrap_or(Value::Null),
    );
    obj.insert("timedOut".into(), Value::Bool(job.timed_out));
    obj.insert("logPath".into(), Value::String(job.log_path.clone()));
    obj.insert("startedAt".into(), Value::String(iso8601(job.started_at_epoch_s)));
    obj.insert(
        "finishedAt".into(),
        job.finished_at_epoch_s
            .map(|t| Value::String(iso8601(t)))
            .unwrap_or(Value::Null),
    );
    if let Some(summary) = &job.pytest_summary {
        let mut p = Map::new();
        p.insert("passed".into(), Value::Number(summary.passed.into()));
        p.insert("failed".into(), Value::Number(summary.failed.into()));
        p.insert("skipped".into(), Value::Number(summary.skipped.into()));
        p.insert("errors".into(), Value::Number(summary.errors.into()));
        p.insert(
            "failedTests".into(),
            Value::Array(summary.failed_tests.iter().cloned().map(Value::String).collect()),
        );
        obj.insert("pytestSummary".into(), Value::Object(p));
    }
    Value::Object(obj)
}

fn job_status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Running => "running",
        JobStatus::Passed => "passed",
        JobStatus::Failed => "failed",
        JobStatus::TimedOut => "timed_out",
        JobStatus::Killed => "killed",
    }
}

/// Terminal rendering of `run view`: run summary followed by one line per
/// job.
pub fn render_view(run: &RunRecord, jobs: &[JobRecord]) -> String {
    let mut out = String::new();
    out.push_str(&render_list_line(run));
    out.push('\n');
    for job in jobs {
        let glyph = match job.status {
            JobStatus::Running => "●",
            JobStatus::Passed => "✓",
            JobStatus::Failed | JobStatus::TimedOut | JobStatus::Killed => "✗",
        };
        out.push_str(&format!(
            "  {glyph}  {id}  {cmd}  exit={exit}\n",
            glyph = glyph,
            id = job.job_id,
            cmd = job.command.join(" "),
            exit = job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(status: RunStatus, failed_job_count: u32) -> RunRecord {
        RunRecord {
            run_id: "01RUN".to_string(),
            started_at_epoch_s: 1_700_000_000,
            finished_at_epoch_s: Some(1_700_000_010),
            status,
            job_count: 2,
            failed_job_count,
            exit_code: if failed_job_count > 0 { 1 } else { 0 },
            project_root: "/repo".to_string(),
            branch: "main".to_string(),
            commit: "deadbeef".to_string(),
            user: "alice".to_string(),
            event: "manual".to_string(),
            workflow: "manual".to_string(),
        }
    }

    #[test]
    fn running_maps_to_in_progress() {
        assert_eq!(ci_status(&run(RunStatus::Running, 0)), ("in_progress", None));
    }

    #[test]
    fn completed_success_and_failure() {
        assert_eq!(ci_status(&run(RunStatus::Completed, 0)), ("completed", Some("success")));
        assert_eq!(ci_status(&run(RunStatus::Completed, 1)), ("completed", Some("failure")));
    }

    #[test]
    fn stopped_maps_to_cancelled() {
        assert_eq!(ci_status(&run(RunStatus::Stopped, 0)), ("completed", Some("cancelled")));
    }

    #[test]
    fn filters_by_branch_and_status() {
        let runs = vec![run(RunStatus::Completed, 0), run(RunStatus::Completed, 1)];
        let filtered = apply_filters(
            runs,
            &ListFilters {
                status: Some("failure".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].failed_job_count, 1);
    }

    #[test]
    fn select_fields_restricts_json_object() {
        let r = run(RunStatus::Completed, 0);
        let json = run_to_json(&r);
        let restricted = select_fields(json, &["status".to_string(), "headBranch".to_string()]);
        let obj = restricted.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert!(obj.contains_key("status"));
        assert!(obj.contains_key("headBranch"));
    }

    #[test]
    fn jq_path_selects_nested_field_across_array() {
        let runs = Value::Array(vec![run_to_json(&run(RunStatus::Completed, 0)), run_to_json(&run(RunStatus::Completed, 1))]);
        let selected = apply_jq_path(&runs, ".[].status").unwrap();
        assert_eq!(selected, vec![Value::String("completed".into()), Value::String("completed".into())]);
    }

    #[test]
    fn jq_path_rejects_unsupported_syntax() {
        let runs = Value::Array(vec![run_to_json(&run(RunStatus::Completed, 0))]);
        assert!(apply_jq_path(&runs, ".[] | select(.status == \"completed\")").is_none());
    }

    #[test]
    fn template_substitutes_fields_and_newline_escape() {
        let r = run(RunStatus::Completed, 0);
        let rendered = render_template(&r, "{{.databaseId}}{{\"\\t\"}}{{.headBranch}}{{\"\\n\"}}");
        assert_eq!(rendered, "01RUN\tmain\n");
    }

    #[test]
    fn limit_truncates_results() {
        let runs = vec![
            run(RunStatus::Completed, 0),
            run(RunStatus::Completed, 0),
            run(RunStatus::Completed, 0),
        ];
        let filtered = apply_filters(runs, &ListFilters { limit: Some(2), ..Default::default() });
        assert_eq!(filtered.len(), 2);
    }
}
