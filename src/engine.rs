//! Queue Engine (C7).
//!
//! The control loop that ties every other component together: pop a
//! command off the [`crate::queue::QueueStore`], acquire the
//! [`crate::locks::CurrentPidLock`], hand the command to the
//! [`crate::supervisor`], record the outcome via the
//! [`crate::recorder::Recorder`], release the lock, and loop — until the
//! queue drains, a stop is requested, or the pipeline timeout elapses. A
//! failed job never halts the loop.

use crate::atomify::{self, AtomifyOptions};
use crate::config::Config;
use crate::context::RunContext;
use crate::errors::SeqError;
use crate::launcher::{self, EnforceOptions, EnforceOutcome};
use crate::locks::CurrentPidLock;
use crate::project;
use crate::queue::{QueueStatus, QueueStore};
use crate::recorder::{JobRecord, JobStatus, Recorder, RunRecord, RunStatus};
use crate::supervisor::{self, SupervisorOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Engine {
    project_root: PathBuf,
    config: Config,
    queue: QueueStore,
    recorder: Recorder,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let lock_root = project::lock_dir(&config.project_root);
        Engine {
            project_root: config.project_root.clone(),
            queue: QueueStore::new(&lock_root),
            recorder: Recorder::new(&config.log_dir),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Enforce, atomify, and enqueue one raw command vector. Returns the
    /// number of atomic command vectors actually enqueued (1 when
    /// atomization is disabled or does not apply, 0 when `--only_verified`
    /// causes an unrecognized-tool skip).
    pub fn submit(&self, submitter_id: &str, raw_command: &[String]) -> Result<usize, SeqError> {
        // An unsupported launcher or unrecognized tool is not fatal to the
        // caller. An unsupported launcher enqueues the vector as-is with
        // atomification skipped (a launcher the core doesn't trust to be
        // serial-safe is also one it can't safely atomize around); an
        // unrecognized tool (only with `--only_verified`) skips the
        // enqueue entirely. Both warn via `tracing`.
        let (enforced, skip_atomify) = if self.config.enforce_runners {
            let opts = EnforceOptions {
                enforce_runners: true,
                only_verified: self.config.only_verified,
                project_root: Some(&self.project_root),
            };
            match launcher::enforce(raw_command, &opts) {
                EnforceOutcome::Unchanged(v) | EnforceOutcome::Rewritten(v) => (v, false),
                EnforceOutcome::UnsupportedLauncher(cmd) => {
                    tracing::warn!("[SEQ-ENFORCE] unsupported launcher, enqueuing as-is: {cmd}");
                    (raw_command.to_vec(), true)
                }
                EnforceOutcome::UnrecognizedTool(tool) => {
                    tracing::warn!("[SEQ-ENFORCE] unrecognized tool, skipping enqueue: {tool}");
                    return Ok(0);
                }
            }
        } else {
            (raw_command.to_vec(), false)
        };

        let vectors = if self.config.atomify && !skip_atomify {
            let opts = AtomifyOptions {
                project_root: &self.project_root,
                enable_second_tier: self.config.enable_second_tier,
            };
            atomify::atomify(&enforced, &opts)
        } else {
            vec![enforced]
        };

        self.queue.submit_batch(submitter_id, &vectors, epoch_s())
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }
    pub fn pause(&self) -> Result<(), SeqError> {
        self.queue.pause()
    }
    pub fn resume(&self) -> Result<(), SeqError> {
        self.queue.resume()
    }
    pub fn close(&self) -> Result<(), SeqError> {
        self.queue.close()
    }
    pub fn reopen(&self) -> Result<(), SeqError> {
        self.queue.reopen()
    }
    pub fn clear(&self) -> Result<usize, SeqError> {
        self.queue.clear()
    }
    pub fn request_stop(&self) -> Result<(), SeqError> {
        self.queue.request_stop()
    }

    /// Run the control loop until the queue drains, a stop is requested,
    /// or the pipeline timeout elapses. Returns the completed run's id.
    pub fn run_loop(&self) -> Result<String, SeqError> {
        let lock_root = project::lock_dir(&self.project_root);
        let current_lock = CurrentPidLock::new(&lock_root);

        let run_id = Recorder::new_run_id();
        let context = RunContext::detect(
            &self.project_root,
            self.config.event.as_deref(),
            self.config.workflow.as_deref(),
            self.config.user.as_deref(),
        );
        self.recorder
            .start_run(&run_id, epoch_s(), &context, &self.project_root.display().to_string())?;

        let pipeline_deadline = Instant::now() + Duration::from_secs(self.config.pipeline_timeout_s.max(1));
        let mut final_status = RunStatus::Completed;

        loop {
            if self.queue.take_stop_request() {
                final_status = RunStatus::Stopped;
                self.queue.clear()?;
                break;
            }
            if Instant::now() >= pipeline_deadline {
                final_status = RunStatus::Failed;
                self.queue.clear()?;
                break;
            }
            if self.queue.is_paused() {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }

            let Some(entry) = self.queue.pop_next()? else {
                break; // queue drained: a normal, successful end of run.
            };

            let guard = match current_lock.try_acquire()? {
                Some(g) => g,
                None => {
                    // Another live process already holds the execution
                    // lock for this project. Put the entry back at the
                    // tail rather than lose it, and back off.
                    self.queue.submit(&entry.submitter_id, &entry.command, entry.submitted_at_epoch_s)?;
                    std::thread::sleep(Duration::from_millis(200));
                    continue;
                }
            };

            let job_id = Recorder::new_job_id();
            self.recorder.start_job(&run_id, &job_id, &entry.command, epoch_s())?;

            let sup_opts = SupervisorOptions {
                timeout_s: self.config.timeout_s,
                memory_limit_mb: self.config.memory_limit_mb,
                retries: self.config.retries,
                kill_signal: self.config.kill_signal,
            };
            let run_result = supervisor::run_with_retries(&entry.command, &sup_opts);
            drop(guard);

            match run_result {
                Ok(log) => {
                    let attempt = log.final_attempt();
                    let status = if attempt.timed_out {
                        JobStatus::TimedOut
                    } else if attempt.killed_for_memory {
                        JobStatus::Killed
                    } else if attempt.succeeded() {
                        JobStatus::Passed
                    } else {
                        JobStatus::Failed
                    };
                    self.recorder.finish_job(
                        &run_id,
                        &job_id,
                        epoch_s(),
                        attempt.exit_code,
                        status,
                        attempt.timed_out,
                        &log.sections(),
                    )?;
                }
                Err(e) => {
                    self.recorder.finish_job(
                        &run_id,
                        &job_id,
                        epoch_s(),
                        None,
                        JobStatus::Failed,
                        false,
                        &format!("failed to spawn: {e}"),
                    )?;
                }
            }
            // A failed job never halts the loop; pop_next() above is what
            // decides whether there is more work.
        }

        self.recorder.finish_run(&run_id, epoch_s(), final_status)?;
        Ok(run_id)
    }

    // --- read model: never touches the execution lock ---

    pub fn list_runs(&self) -> Result<Vec<String>, SeqError> {
        self.recorder.list_runs()
    }

    pub fn latest_run_id(&self) -> Result<Option<String>, SeqError> {
        self.recorder.latest_run_id()
    }

    pub fn view_run(&self, run_id: &str) -> Result<(RunRecord, Vec<JobRecord>), SeqError> {
        let run = self.recorder.load_run(run_id)?;
        let jobs = self
            .recorder
            .list_jobs(run_id)?
            .into_iter()
            .map(|id| self.recorder.load_job(run_id, &id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((run, jobs))
    }

    /// Poll a run's state until it finishes, invoking `on_update` after
    /// each poll. Tolerates concurrent writers: every poll is a fresh
    /// read of on-disk state, never a lock acquisition.
    pub fn watch_run(
        &self,
        run_id: &str,
        poll_interval: Duration,
        mut on_update: impl FnMut(&RunRecord, &[JobRecord]),
    ) -> Result<RunRecord, SeqError> {
        loop {
            let (run, jobs) = self.view_run(run_id)?;
            on_update(&run, &jobs);
            if run.finished_at_epoch_s.is_some() {
                return Ok(run);
            }
            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;

    fn engine_in(dir: &std::path::Path) -> Engine {
        let mut overrides = ConfigOverrides::default();
        overrides.log_dir = Some(dir.join("logs"));
        overrides.enforce_runners = Some(false);
        overrides.atomify = Some(false);
        let config = Config::resolve(dir, &overrides);
        Engine::new(config)
    }

    #[test]
    fn run_loop_drains_queue_and_records_results() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.submit("alice", &["true".to_string()]).unwrap();
        engine.submit("alice", &["false".to_string()]).unwrap();

        let run_id = engine.run_loop().unwrap();
        let (run, jobs) = engine.view_run(&run_id).unwrap();
        assert_eq!(run.job_count, 2);
        assert_eq!(run.failed_job_count, 1);
        assert_eq!(run.exit_code, 1, "aggregate exit is the last non-zero job exit");
        assert!(matches!(run.status, RunStatus::Completed));
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn run_exit_code_reports_timeout_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = ConfigOverrides::default();
        overrides.log_dir = Some(dir.path().join("logs"));
        overrides.enforce_runners = Some(false);
        overrides.atomify = Some(false);
        overrides.timeout_s = Some(1);
        let engine = Engine::new(Config::resolve(dir.path(), &overrides));
        engine.submit("alice", &["sleep".to_string(), "30".to_string()]).unwrap();

        let run_id = engine.run_loop().unwrap();
        let (run, _jobs) = engine.view_run(&run_id).unwrap();
        assert_eq!(run.exit_code, 124);
    }

    #[test]
    fn submit_rejects_when_closed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.close().unwrap();
        let result = engine.submit("alice", &["true".to_string()]);
        assert!(matches!(result, Err(SeqError::QueueClosed)));
    }

    #[test]
    fn unsupported_launcher_enqueues_unmodified_rather_than_erroring() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = ConfigOverrides::default();
        overrides.log_dir = Some(dir.path().join("logs"));
        overrides.enforce_runners = Some(true);
        overrides.atomify = Some(true);
        let engine = Engine::new(Config::resolve(dir.path(), &overrides));

        let n = engine
            .submit("alice", &["poetry".to_string(), "run".to_string(), "pytest".to_string()])
            .unwrap();
        assert_eq!(n, 1);
        let entry = engine.queue().pop_next().unwrap().unwrap();
        assert_eq!(entry.command, vec!["poetry", "run", "pytest"]);
    }

    #[test]
    fn unrecognized_tool_skips_enqueue_when_only_verified() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = ConfigOverrides::default();
        overrides.log_dir = Some(dir.path().join("logs"));
        overrides.enforce_runners = Some(true);
        overrides.only_verified = Some(true);
        let engine = Engine::new(Config::resolve(dir.path(), &overrides));

        let n = engine.submit("alice", &["some-random-tool".to_string()]).unwrap();
        assert_eq!(n, 0);
        assert_eq!(engine.queue().len(), 0);
    }

    #[test]
    fn empty_queue_produces_completed_run_with_no_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let run_id = engine.run_loop().unwrap();
        let (run, jobs) = engine.view_run(&run_id).unwrap();
        assert_eq!(run.job_count, 0);
        assert!(jobs.is_empty());
    }

    #[test]
    fn stop_request_halts_loop_before_draining() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        engine.submit("alice", &["true".to_string()]).unwrap();
        engine.submit("alice", &["true".to_string()]).unwrap();
        engine.request_stop().unwrap();

        let run_id = engine.run_loop().unwrap();
        let (run, _jobs) = engine.view_run(&run_id).unwrap();
        assert!(matches!(run.status, RunStatus::Stopped));
        // stop() truncates the queue: nothing is left pending once the
        // run has finalized as stopped.
        assert_eq!(engine.queue().len(), 0);
    }
}
