//! Memory Monitor (C2).
//!
//! Periodically samples the resident set size of a process and its full
//! descendant tree, enforcing a *per-process* cap: the cap applies
//! individually to each process in the tree, not to their sum — a single
//! runaway child is killed without punishing well-behaved siblings.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub pid: u32,
    pub rss_mb: u64,
}

#[derive(Debug, Clone)]
pub enum MemoryEvent {
    /// A single process in the tree exceeded the cap and was killed.
    Breach { pid: u32, rss_mb: u64, cap_mb: u64 },
}

/// All PIDs in the process tree rooted at `root`, including `root` itself,
/// discovered via `/proc/*/stat`'s parent-pid field.
#[cfg(target_os = "linux")]
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
    if let Ok(entries) = std::fs::read_dir("/proc") {
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(ppid) = read_ppid(pid) {
                children_of.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut seen: HashSet<u32> = HashSet::new();
    let mut queue: VecDeque<u32> = VecDeque::new();
    queue.push_back(root);
    seen.insert(root);
    while let Some(pid) = queue.pop_front() {
        if let Some(children) = children_of.get(&pid) {
            for &child in children {
                if seen.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
    seen.into_iter().collect()
}

#[cfg(not(target_os = "linux"))]
pub fn descendant_pids(root: u32) -> Vec<u32> {
    vec![root]
}

#[cfg(target_os = "linux")]
fn read_ppid(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the `(comm)` parenthesised group are space-separated;
    // ppid is field 4 (1-indexed) overall, i.e. index 1 after the comm group.
    let after_comm = stat.rsplit_once(')')?.1;
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Resident set size of a single PID, in MiB. `None` if the process is
/// gone or unreadable (both treated as "nothing to enforce").
#[cfg(target_os = "linux")]
pub fn read_rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn read_rss_mb(_pid: u32) -> Option<u64> {
    None
}

/// Sample every process in the tree rooted at `root`, in no particular
/// order.
pub fn sample_tree(root: u32) -> Vec<MemorySample> {
    descendant_pids(root)
        .into_iter()
        .filter_map(|pid| read_rss_mb(pid).map(|rss_mb| MemorySample { pid, rss_mb }))
        .collect()
}

/// Spawns a background thread that samples `root`'s process tree every
/// `poll_interval` and, if any single process exceeds `cap_mb`, sends a
/// [`MemoryEvent::Breach`] and kills that process: the offending process
/// is sent SIGTERM, then SIGKILL after a short grace period, without
/// touching the rest of the tree. `cap_mb == 0` disables enforcement; the
/// thread still tracks the observed peak.
///
/// Returns the join handle (yields the observed peak RSS across the
/// whole tree, in MiB, across the watcher's lifetime) and a receiver for
/// breach events.
pub fn spawn_watcher(
    root: u32,
    cap_mb: u64,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
) -> (JoinHandle<u64>, Receiver<MemoryEvent>) {
    let (tx, rx) = mpsc::channel();
    let peak = Arc::new(AtomicU64::new(0));
    let peak_for_thread = peak.clone();

    let handle = std::thread::spawn(move || {
        let mut killed: HashSet<u32> = HashSet::new();
        while !stop.load(Ordering::Relaxed) {
            for sample in sample_tree(root) {
                peak_for_thread.fetch_max(sample.rss_mb, Ordering::Relaxed);
                if cap_mb > 0 && sample.rss_mb > cap_mb && killed.insert(sample.pid) {
                    kill_process(sample.pid);
                    let _ = tx.send(MemoryEvent::Breach {
                        pid: sample.pid,
                        rss_mb: sample.rss_mb,
                        cap_mb,
                    });
                }
            }
            std::thread::sleep(poll_interval);
        }
        peak_for_thread.load(Ordering::Relaxed)
    });

    (handle, rx)
}

const KILL_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[cfg(unix)]
fn kill_process(pid: u32) {
    // SAFETY: signalling an arbitrary PID with TERM/KILL is always a
    // well-defined syscall; worst case is ESRCH if it already exited.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
    std::thread::sleep(KILL_GRACE_PERIOD);
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process(_pid: u32) {}
