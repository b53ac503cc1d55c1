//! Process Supervisor (C1).
//!
//! Spawns a command vector in its own process group, tracks it and its
//! descendants, enforces a per-command timeout with SIGTERM-then-SIGKILL
//! escalation, retries failed attempts up to a configured budget, and
//! returns a structured result envelope. Never signals PID 0 or this
//! process's own process group — every kill targets the child's process
//! group, which `process_group(0)` guarantees is distinct from ours.

use crate::memmon::{self, MemoryEvent};
use crate::signal::Signal;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

const MEMORY_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Grace period between the configured kill signal and a SIGKILL
/// escalation after a *timeout* (spec §4.1: "a fixed grace period (0.1
/// s)"). Distinct from the memory-monitor's own grace period in
/// `memmon.rs` (spec §4.2: 2 s) — the two must not share a constant.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_millis(100);
/// Grace period after killing a tree for exceeding the memory cap,
/// mirroring `memmon.rs`'s own SIGTERM-then-SIGKILL escalation (spec
/// §4.2: 2 s).
const MEMORY_KILL_GRACE: Duration = Duration::from_secs(2);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub attempt: u32,
    pub started_at_epoch_s: u64,
    pub vector: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub timeout_s: u64,
    pub killed_for_memory: bool,
    pub peak_rss_mb: u64,
    pub duration_ms: u128,
}

impl AttemptResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Combined stdout+stderr text, in the order a terminal would have
    /// shown it — well enough for downstream regex-based pytest summary
    /// extraction, which scans exactly this text.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Per-attempt log section: UTC timestamp, rewritten vector, peak RSS,
    /// a `TIMEOUT: <n>s` marker when the attempt was killed for exceeding
    /// its deadline, captured streams, and the exit outcome.
    fn log_section(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("--- attempt {} @ {} ---\n", self.attempt, self.started_at_epoch_s));
        out.push_str(&format!("vector: {}\n", self.vector.join(" ")));
        out.push_str(&format!("peak_rss_mb: {}\n", self.peak_rss_mb));
        if self.timed_out {
            out.push_str(&format!("TIMEOUT: {}s\n", self.timeout_s));
        }
        if self.killed_for_memory {
            out.push_str("MEMORY_CAP: killed\n");
        }
        out.push_str(&self.combined_output());
        out.push_str(&format!("\nexit_code: {}\n", self.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())));
        out
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorLog {
    pub attempts: Vec<AttemptResult>,
}

impl SupervisorLog {
    /// The final attempt — the one whose outcome the caller should record
    /// as the job's result.
    pub fn final_attempt(&self) -> &AttemptResult {
        self.attempts.last().expect("at least one attempt is always recorded")
    }

    /// All attempts' log sections, concatenated in order, so the Recorder
    /// can replay a job's full attempt history (including timeout/memory
    /// markers and peak RSS) rather than only its last try's raw streams.
    pub fn sections(&self) -> String {
        let mut out = String::new();
        for attempt in &self.attempts {
            out.push_str(&attempt.log_section());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Per-attempt wall-clock timeout in seconds; 0 disables it.
    pub timeout_s: u64,
    /// Per-process memory cap in MiB; 0 disables it.
    pub memory_limit_mb: u64,
    /// Additional attempts after the first on failure.
    pub retries: u32,
    /// Signal delivered to the process group on timeout, before the
    /// SIGKILL escalation. Defaults to `TERM`.
    pub kill_signal: Signal,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        SupervisorOptions {
            timeout_s: 0,
            memory_limit_mb: 0,
            retries: 0,
            kill_signal: Signal::Term,
        }
    }
}

/// Run `command`, retrying on failure up to `opts.retries` additional
/// times, and return the full attempt history.
pub fn run_with_retries(command: &[String], opts: &SupervisorOptions) -> std::io::Result<SupervisorLog> {
    let mut attempts = Vec::new();
    for attempt in 1..=(opts.retries + 1) {
        let result = run_once(command, opts, attempt)?;
        let succeeded = result.succeeded();
        attempts.push(result);
        if succeeded {
            break;
        }
    }
    Ok(SupervisorLog { attempts })
}

fn run_once(command: &[String], opts: &SupervisorOptions, attempt: u32) -> std::io::Result<AttemptResult> {
    let start = Instant::now();
    let mut cmd = Command::new(&command[0]);
    cmd.args(&command[1..]).stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        // A fresh process group, led by the child, isolates it from this
        // process's own group — kills always target `-child_pid`, never 0
        // or our own pgid.
        cmd.process_group(0);
    }
    let mut child: Child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stdout_pipe.read_to_string(&mut buf);
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr_pipe.read_to_string(&mut buf);
        buf
    });

    let stop_watcher = Arc::new(AtomicBool::new(false));
    let (watcher_handle, memory_rx) = memmon::spawn_watcher(
        pid,
        opts.memory_limit_mb,
        MEMORY_POLL_INTERVAL,
        stop_watcher.clone(),
    );

    let deadline = if opts.timeout_s > 0 {
        Some(start + Duration::from_secs(opts.timeout_s))
    } else {
        None
    };

    let mut timed_out = false;
    let mut killed_for_memory = false;
    let exit_status = loop {
        if let Some(status) = child.try_wait()? {
            break Some(status);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                kill_process_group(pid, opts.kill_signal);
                break wait_after_kill(&mut child, TIMEOUT_KILL_GRACE);
            }
        }
        if let Ok(MemoryEvent::Breach { pid: breached_pid, .. }) = memory_rx.try_recv() {
            if breached_pid == pid {
                // The root of the tree itself breached: the whole job is dead.
                killed_for_memory = true;
                kill_process_group(pid, opts.kill_signal);
                break wait_after_kill(&mut child, MEMORY_KILL_GRACE);
            }
            // A descendant breached; memmon already killed just that
            // process. The job continues.
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    };

    stop_watcher.store(true, Ordering::Relaxed);
    let peak_rss_mb = watcher_handle.join().unwrap_or(0);

    let stdout = stdout_handle.join().unwrap_or_default();
    let stderr = stderr_handle.join().unwrap_or_default();

    // Timeout always reports the sentinel 124, regardless of which signal
    // actually reaped the process group.
    let exit_code = if timed_out {
        Some(124)
    } else {
        exit_status.and_then(|s| exit_code_of(&s))
    };

    Ok(AttemptResult {
        attempt,
        started_at_epoch_s: epoch_s(),
        vector: command.to_vec(),
        stdout,
        stderr,
        exit_code,
        timed_out,
        timeout_s: opts.timeout_s,
        killed_for_memory,
        peak_rss_mb,
        duration_ms: start.elapsed().as_millis(),
    })
}

fn epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Send `signal` to the child's process group, wait a grace period, then
/// SIGKILL if it hasn't exited. The negative PID targets the whole group
/// for descendant reaping, never PID 0 or this process's own group.
#[cfg(unix)]
fn kill_process_group(pid: u32, signal: Signal) {
    let pgid = -(pid as libc::pid_t);
    // SAFETY: pgid is always the negative of a child's own pid, which
    // process_group(0) guarantees differs from our process group.
    unsafe {
        libc::kill(pgid, signal.as_raw());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32, _signal: Signal) {}

#[cfg(unix)]
fn force_kill_process_group(pid: u32) {
    let pgid = -(pid as libc::pid_t);
    unsafe {
        libc::kill(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn force_kill_process_group(_pid: u32) {}

fn wait_after_kill(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
    force_kill_process_group(child.id());
    child.wait().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SupervisorOptions {
        SupervisorOptions::default()
    }

    #[test]
    fn successful_command_reports_exit_zero() {
        let log = run_with_retries(&["true".to_string()], &opts()).unwrap();
        assert_eq!(log.final_attempt().exit_code, Some(0));
        assert!(!log.final_attempt().timed_out);
    }

    #[test]
    fn failing_command_is_retried() {
        let mut o = opts();
        o.retries = 2;
        let log = run_with_retries(&["false".to_string()], &o).unwrap();
        assert_eq!(log.attempts.len(), 3);
        assert!(log.attempts.iter().all(|a| a.exit_code == Some(1)));
    }

    #[test]
    fn success_on_retry_stops_early() {
        // `true` always succeeds; with retries configured it should not
        // spend them.
        let mut o = opts();
        o.retries = 5;
        let log = run_with_retries(&["true".to_string()], &o).unwrap();
        assert_eq!(log.attempts.len(), 1);
    }

    #[test]
    fn timeout_kills_long_running_command() {
        let mut o = opts();
        o.timeout_s = 1;
        let log = run_with_retries(&["sleep".to_string(), "30".to_string()], &o).unwrap();
        assert!(log.final_attempt().timed_out);
        assert_eq!(log.final_attempt().exit_code, Some(124));
        assert!(log.sections().contains("TIMEOUT: 1s"));
    }

    #[test]
    fn stdout_is_captured() {
        let log = run_with_retries(
            &["sh".to_string(), "-c".to_string(), "echo hello-world".to_string()],
            &opts(),
        )
        .unwrap();
        assert!(log.final_attempt().stdout.contains("hello-world"));
    }

    #[test]
    fn sections_includes_every_attempt() {
        let mut o = opts();
        o.retries = 1;
        let log = run_with_retries(&["false".to_string()], &o).unwrap();
        let sections = log.sections();
        assert!(sections.contains("attempt 1"));
        assert!(sections.contains("attempt 2"));
    }
}
