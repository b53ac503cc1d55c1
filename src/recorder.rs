//! Run/Job Recorder (C6): a CI-style run/job history.
//!
//! Persists a flat, greppable `KEY=VALUE` metadata file per run and per
//! job, re-expressed here as typed structs with `to_kv()`/`from_kv()`
//! rather than ad hoc string parsing scattered through callers. Layout:
//!
//! ```text
//! <log_dir>/runs/<run_id>/metadata.txt
//! <log_dir>/runs/<run_id>/jobs/<job_id>.txt
//! ```

use crate::errors::SeqError;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }
    fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Passed,
    Failed,
    TimedOut,
    Killed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Killed => "killed",
        }
    }
    fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "running" => Some(JobStatus::Running),
            "passed" => Some(JobStatus::Passed),
            "failed" => Some(JobStatus::Failed),
            "timed_out" => Some(JobStatus::TimedOut),
            "killed" => Some(JobStatus::Killed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PytestSummary {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub errors: u32,
    /// `tests/t.py::test_two`-style ids taken from `FAILED <id>` lines.
    pub failed_tests: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at_epoch_s: u64,
    pub finished_at_epoch_s: Option<u64>,
    pub status: RunStatus,
    pub job_count: u32,
    pub failed_job_count: u32,
    /// Aggregate of the last non-zero job exit code seen so far, else 0.
    pub exit_code: i32,
    pub project_root: String,
    pub branch: String,
    pub commit: String,
    pub user: String,
    pub event: String,
    pub workflow: String,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub run_id: String,
    pub command: Vec<String>,
    pub started_at_epoch_s: u64,
    pub finished_at_epoch_s: Option<u64>,
    pub exit_code: Option<i32>,
    pub status: JobStatus,
    pub timed_out: bool,
    pub log_path: String,
    pub pytest_summary: Option<PytestSummary>,
}

fn kv_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn parse_kv(contents: &str) -> BTreeMap<String, String> {
    contents
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl RunRecord {
    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        kv_line(&mut out, "run_id", &self.run_id);
        kv_line(&mut out, "started_at", &self.started_at_epoch_s.to_string());
        kv_line(
            &mut out,
            "finished_at",
            &self.finished_at_epoch_s.map(|v| v.to_string()).unwrap_or_default(),
        );
        kv_line(&mut out, "status", self.status.as_str());
        kv_line(&mut out, "job_count", &self.job_count.to_string());
        kv_line(&mut out, "failed_job_count", &self.failed_job_count.to_string());
        kv_line(&mut out, "exit_code", &self.exit_code.to_string());
        kv_line(&mut out, "project", &self.project_root);
        kv_line(&mut out, "branch", &self.branch);
        kv_line(&mut out, "commit", &self.commit);
        kv_line(&mut out, "user", &self.user);
        kv_line(&mut out, "event", &self.event);
        kv_line(&mut out, "workflow", &self.workflow);
        out
    }

    pub fn from_kv(contents: &str) -> Result<RunRecord, SeqError> {
        let map = parse_kv(contents);
        let get = |k: &str| {
            map.get(k)
                .cloned()
                .ok_or_else(|| SeqError::InternalInvariantViolation(format!("run record missing {k}")))
        };
        let get_or_default = |k: &str| map.get(k).cloned().unwrap_or_default();
        Ok(RunRecord {
            run_id: get("run_id")?,
            started_at_epoch_s: get("started_at")?
                .parse()
                .map_err(|_| SeqError::InternalInvariantViolation("bad started_at".into()))?,
            finished_at_epoch_s: map.get("finished_at").and_then(|v| v.parse().ok()),
            status: RunStatus::parse(&get("status")?)
                .ok_or_else(|| SeqError::InternalInvariantViolation("bad run status".into()))?,
            job_count: get("job_count")?
                .parse()
                .map_err(|_| SeqError::InternalInvariantViolation("bad job_count".into()))?,
            failed_job_count: get("failed_job_count")?
                .parse()
                .map_err(|_| SeqError::InternalInvariantViolation("bad failed_job_count".into()))?,
            // Absent in records written before this field existed; 0 is the
            // correct default (no non-zero job exit observed).
            exit_code: map.get("exit_code").and_then(|v| v.parse().ok()).unwrap_or(0),
            project_root: get_or_default("project"),
            branch: get_or_default("branch"),
            commit: get_or_default("commit"),
            user: get_or_default("user"),
            event: get_or_default("event"),
            workflow: get_or_default("workflow"),
        })
    }
}

impl JobRecord {
    pub fn to_kv(&self) -> String {
        let mut out = String::new();
        kv_line(&mut out, "job_id", &self.job_id);
        kv_line(&mut out, "run_id", &self.run_id);
        kv_line(
            &mut out,
            "command",
            &serde_json::to_string(&self.command).unwrap_or_default(),
        );
        kv_line(&mut out, "started_at", &self.started_at_epoch_s.to_string());
        kv_line(
            &mut out,
            "finished_at",
            &self.finished_at_epoch_s.map(|v| v.to_string()).unwrap_or_default(),
        );
        kv_line(
            &mut out,
            "exit_code",
            &self.exit_code.map(|v| v.to_string()).unwrap_or_default(),
        );
        kv_line(&mut out, "status", self.status.as_str());
        kv_line(&mut out, "timed_out", if self.timed_out { "true" } else { "false" });
        kv_line(&mut out, "log_path", &self.log_path);
        if let Some(summary) = &self.pytest_summary {
            kv_line(&mut out, "pytest_passed", &summary.passed.to_string());
            kv_line(&mut out, "pytest_failed", &summary.failed.to_string());
            kv_line(&mut out, "pytest_skipped", &summary.skipped.to_string());
            kv_line(&mut out, "pytest_errors", &summary.errors.to_string());
            kv_line(
                &mut out,
                "pytest_failed_tests",
                &serde_json::to_string(&summary.failed_tests).unwrap_or_default(),
            );
        }
        out
    }

    pub fn from_kv(contents: &str) -> Result<JobRecord, SeqError> {
        let map = parse_kv(contents);
        let get = |k: &str| {
            map.get(k)
                .cloned()
                .ok_or_else(|| SeqError::InternalInvariantViolation(format!("job record missing {k}")))
        };
        let pytest_summary = if map.contains_key("pytest_passed") {
            Some(PytestSummary {
                passed: map.get("pytest_passed").and_then(|v| v.parse().ok()).unwrap_or(0),
                failed: map.get("pytest_failed").and_then(|v| v.parse().ok()).unwrap_or(0),
                skipped: map.get("pytest_skipped").and_then(|v| v.parse().ok()).unwrap_or(0),
                errors: map.get("pytest_errors").and_then(|v| v.parse().ok()).unwrap_or(0),
                failed_tests: map
                    .get("pytest_failed_tests")
                    .and_then(|v| serde_json::from_str(v).ok())
                    .unwrap_or_default(),
            })
        } else {
            None
        };
        Ok(JobRecord {
            job_id: get("job_id")?,
            run_id: get("run_id")?,
            command: serde_json::from_str(&get("command")?)
                .map_err(|_| SeqError::InternalInvariantViolation("bad command json".into()))?,
            started_at_epoch_s: get("started_at")?
                .parse()
                .map_err(|_| SeqError::InternalInvariantViolation("bad started_at".into()))?,
            finished_at_epoch_s: map.get("finished_at").and_then(|v| v.parse().ok()),
            exit_code: map.get("exit_code").and_then(|v| v.parse().ok()),
            status: JobStatus::parse(&get("status")?)
                .ok_or_else(|| SeqError::InternalInvariantViolation("bad job status".into()))?,
            timed_out: get("timed_out")? == "true",
            log_path: map.get("log_path").cloned().unwrap_or_default(),
            pytest_summary,
        })
    }
}

pub struct Recorder {
    log_dir: PathBuf,
}

impl Recorder {
    pub fn new(log_dir: &Path) -> Self {
        Recorder {
            log_dir: log_dir.to_path_buf(),
        }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.log_dir.join("runs").join(run_id)
    }
    fn metadata_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("metadata.txt")
    }
    fn jobs_dir(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("jobs")
    }
    fn job_path(&self, run_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(run_id).join(format!("{job_id}.txt"))
    }
    /// Per-job supervisor log, the sole source of truth for pytest-summary
    /// extraction and for `run view --log`.
    fn job_log_path(&self, run_id: &str, job_id: &str) -> PathBuf {
        self.jobs_dir(run_id).join(format!("{job_id}.log"))
    }

    pub fn new_run_id() -> String {
        Ulid::new().to_string()
    }
    pub fn new_job_id() -> String {
        Ulid::new().to_string()
    }

    pub fn start_run(&self, run_id: &str, started_at_epoch_s: u64, context: &crate::context::RunContext, project_root: &str) -> Result<RunRecord, SeqError> {
        std::fs::create_dir_all(self.jobs_dir(run_id))
            .map_err(|e| SeqError::InternalInvariantViolation(format!("create run dir: {e}")))?;
        let record = RunRecord {
            run_id: run_id.to_string(),
            started_at_epoch_s,
            finished_at_epoch_s: None,
            status: RunStatus::Running,
            job_count: 0,
            failed_job_count: 0,
            exit_code: 0,
            project_root: project_root.to_string(),
            branch: context.branch.clone(),
            commit: context.commit.clone(),
            user: context.user.clone(),
            event: context.event.clone(),
            workflow: context.workflow.clone(),
        };
        self.write_run(&record)?;
        Ok(record)
    }

    pub fn finish_run(&self, run_id: &str, finished_at_epoch_s: u64, status: RunStatus) -> Result<(), SeqError> {
        let mut record = self.load_run(run_id)?;
        record.finished_at_epoch_s = Some(finished_at_epoch_s);
        record.status = status;
        self.write_run(&record)
    }

    /// Update job_count/failed_job_count and the run's aggregate exit code
    /// (the last non-zero job exit code seen, else 0) after one job finishes.
    pub fn record_job_tally(&self, run_id: &str, failed: bool, exit_code: Option<i32>) -> Result<(), SeqError> {
        let mut record = self.load_run(run_id)?;
        record.job_count += 1;
        if failed {
            record.failed_job_count += 1;
        }
        if let Some(code) = exit_code {
            if code != 0 {
                record.exit_code = code;
            }
        }
        self.write_run(&record)
    }

    fn write_run(&self, record: &RunRecord) -> Result<(), SeqError> {
        std::fs::write(self.metadata_path(&record.run_id), record.to_kv())
            .map_err(|e| SeqError::InternalInvariantViolation(format!("write run metadata: {e}")))
    }

    pub fn load_run(&self, run_id: &str) -> Result<RunRecord, SeqError> {
        let contents = std::fs::read_to_string(self.metadata_path(run_id))
            .map_err(|_| SeqError::RunNotFound(run_id.to_string()))?;
        RunRecord::from_kv(&contents)
    }

    pub fn start_job(&self, run_id: &str, job_id: &str, command: &[String], started_at_epoch_s: u64) -> Result<JobRecord, SeqError> {
        let record = JobRecord {
            job_id: job_id.to_string(),
            run_id: run_id.to_string(),
            command: command.to_vec(),
            started_at_epoch_s,
            finished_at_epoch_s: None,
            exit_code: None,
            status: JobStatus::Running,
            timed_out: false,
            log_path: self.job_log_path(run_id, job_id).display().to_string(),
            pytest_summary: None,
        };
        self.write_job(&record)?;
        Ok(record)
    }

    pub fn finish_job(
        &self,
        run_id: &str,
        job_id: &str,
        finished_at_epoch_s: u64,
        exit_code: Option<i32>,
        status: JobStatus,
        timed_out: bool,
        supervisor_log: &str,
    ) -> Result<JobRecord, SeqError> {
        let mut record = self.load_job(run_id, job_id)?;
        record.finished_at_epoch_s = Some(finished_at_epoch_s);
        record.exit_code = exit_code;
        record.status = status;
        record.timed_out = timed_out;
        record.pytest_summary = extract_pytest_summary(supervisor_log);
        std::fs::write(self.job_log_path(run_id, job_id), supervisor_log)
            .map_err(|e| SeqError::InternalInvariantViolation(format!("write job log: {e}")))?;
        self.write_job(&record)?;
        self.record_job_tally(
            run_id,
            matches!(status, JobStatus::Failed | JobStatus::TimedOut | JobStatus::Killed),
            exit_code,
        )?;
        Ok(record)
    }

    fn write_job(&self, record: &JobRecord) -> Result<(), SeqError> {
        std::fs::write(self.job_path(&record.run_id, &record.job_id), record.to_kv())
            .map_err(|e| SeqError::InternalInvariantViolation(format!("write job metadata: {e}")))
    }

    pub fn load_job(&self, run_id: &str, job_id: &str) -> Result<JobRecord, SeqError> {
        let contents = std::fs::read_to_string(self.job_path(run_id, job_id))
            .map_err(|_| SeqError::JobNotFound(job_id.to_string()))?;
        JobRecord::from_kv(&contents)
    }

    /// List job ids for a run, in submission order (ULIDs sort
    /// lexicographically by creation time).
    pub fn list_jobs(&self, run_id: &str) -> Result<Vec<String>, SeqError> {
        let dir = self.jobs_dir(run_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension() == Some(std::ffi::OsStr::new("txt")))
            .filter_map(|e| e.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// List run ids, most recent first.
    pub fn list_runs(&self) -> Result<Vec<String>, SeqError> {
        let dir = self.log_dir.join("runs");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(Vec::new());
        };
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        ids.sort();
        ids.reverse();
        Ok(ids)
    }

    pub fn latest_run_id(&self) -> Result<Option<String>, SeqError> {
        Ok(self.list_runs()?.into_iter().next())
    }
}

static PYTEST_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?x)
        (?:(?P<passed>\d+)\ passed)?.*?
        (?:(?P<failed>\d+)\ failed)?.*?
        (?:(?P<skipped>\d+)\ skipped)?.*?
        (?:(?P<errors>\d+)\ error)?
        .*?\ in\ [\d.]+s
    ").unwrap()
});

static PYTEST_FAILED_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^FAILED (\S+)").unwrap());

/// Extract the pytest short test summary (e.g. `"3 passed, 1 failed in
/// 0.42s"`) from a captured supervisor log. Returns `None` when no such
/// line is found.
pub fn extract_pytest_summary(log_text: &str) -> Option<PytestSummary> {
    for line in log_text.lines().rev() {
        if !line.contains(" in ") || !line.trim_end().ends_with('s') {
            continue;
        }
        if let Some(caps) = PYTEST_SUMMARY_RE.captures(line) {
            let get = |name: &str| caps.name(name).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
            let mut summary = PytestSummary {
                passed: get("passed"),
                failed: get("failed"),
                skipped: get("skipped"),
                errors: get("errors"),
                failed_tests: Vec::new(),
            };
            if summary != PytestSummary::default() {
                summary.failed_tests = log_text
                    .lines()
                    .filter_map(|l| PYTEST_FAILED_LINE_RE.captures(l.trim()))
                    .map(|c| c[1].to_string())
                    .collect();
                return Some(summary);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_record_round_trips_through_kv() {
        let record = RunRecord {
            run_id: "01ABC".to_string(),
            started_at_epoch_s: 100,
            finished_at_epoch_s: Some(200),
            status: RunStatus::Completed,
            job_count: 3,
            failed_job_count: 1,
            exit_code: 1,
            project_root: "/repo".to_string(),
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            user: "alice".to_string(),
            event: "manual".to_string(),
            workflow: "manual".to_string(),
        };
        let decoded = RunRecord::from_kv(&record.to_kv()).unwrap();
        assert_eq!(decoded.run_id, record.run_id);
        assert_eq!(decoded.finished_at_epoch_s, record.finished_at_epoch_s);
        assert_eq!(decoded.status, RunStatus::Completed);
        assert_eq!(decoded.failed_job_count, 1);
    }

    #[test]
    fn job_record_round_trips_with_pytest_summary() {
        let record = JobRecord {
            job_id: "01JOB".to_string(),
            run_id: "01ABC".to_string(),
            command: vec!["pytest".to_string(), "t.py::test_one".to_string()],
            started_at_epoch_s: 10,
            finished_at_epoch_s: Some(11),
            exit_code: Some(0),
            status: JobStatus::Passed,
            timed_out: false,
            log_path: "/tmp/job.log".to_string(),
            pytest_summary: Some(PytestSummary {
                passed: 1,
                failed: 0,
                skipped: 0,
                errors: 0,
                failed_tests: vec![],
            }),
        };
        let decoded = JobRecord::from_kv(&record.to_kv()).unwrap();
        assert_eq!(decoded.command, record.command);
        assert_eq!(decoded.pytest_summary, record.pytest_summary);
    }

    #[test]
    fn recorder_persists_and_reloads_a_run_and_job() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path());
        let run_id = Recorder::new_run_id();
        recorder.start_run(&run_id, 1, &crate::context::RunContext::detect(std::path::Path::new("."), None, None, None), "/repo").unwrap();
        let job_id = Recorder::new_job_id();
        recorder
            .start_job(&run_id, &job_id, &["pytest".to_string()], 2)
            .unwrap();
        recorder
            .finish_job(&run_id, &job_id, 3, Some(0), JobStatus::Passed, false, "1 passed in 0.10s\n")
            .unwrap();
        recorder.finish_run(&run_id, 4, RunStatus::Completed).unwrap();

        let run = recorder.load_run(&run_id).unwrap();
        assert_eq!(run.job_count, 1);
        assert_eq!(run.failed_job_count, 0);
        let job = recorder.load_job(&run_id, &job_id).unwrap();
        assert_eq!(job.status, JobStatus::Passed);
        assert_eq!(job.pytest_summary.unwrap().passed, 1);
    }

    #[test]
    fn list_runs_and_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path());
        let run_id = Recorder::new_run_id();
        recorder.start_run(&run_id, 1, &crate::context::RunContext::detect(std::path::Path::new("."), None, None, None), "/repo").unwrap();
        let job1 = Recorder::new_job_id();
        let job2 = Recorder::new_job_id();
        recorder.start_job(&run_id, &job1, &["a".to_string()], 1).unwrap();
        recorder.start_job(&run_id, &job2, &["b".to_string()], 2).unwrap();
        assert_eq!(recorder.list_runs().unwrap(), vec![run_id.clone()]);
        assert_eq!(recorder.list_jobs(&run_id).unwrap().len(), 2);
    }

    #[test]
    fn extract_pytest_summary_parses_trailing_line() {
        let log = "collecting...\n...\n3 passed, 1 failed, 2 skipped in 0.55s\n";
        let summary = extract_pytest_summary(log).unwrap();
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn extract_pytest_summary_absent_returns_none() {
        assert!(extract_pytest_summary("no summary here\n").is_none());
    }
}
