//! Queue Store (C5).
//!
//! A project-scoped, file-backed FIFO of pending command vectors, guarded
//! by [`crate::locks::SidecarLock`] for the non-atomic read-modify-write
//! sequences (`submit`, `pop_next`, `clear`) and by three flag files for
//! the coarser `running` / `paused` / `closed` queue states. `running` is
//! not a flag file at all — it is derived from
//! [`crate::locks::CurrentPidLock`] so that a crashed engine can never
//! leave a queue permanently reporting "running".

use crate::errors::SeqError;
use crate::locks::{CurrentPidLock, SidecarLock};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_ATTEMPTS: u32 = 50;
const LOCK_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub submitter_id: String,
    pub submitted_at_epoch_s: u64,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub depth: usize,
    pub paused: bool,
    pub closed: bool,
    pub running: bool,
}

pub struct QueueStore {
    lock_root: PathBuf,
}

impl QueueStore {
    pub fn new(lock_root: &Path) -> Self {
        QueueStore {
            lock_root: lock_root.to_path_buf(),
        }
    }

    fn queue_file(&self) -> PathBuf {
        self.lock_root.join("queue.txt")
    }
    fn paused_flag(&self) -> PathBuf {
        self.lock_root.join("paused.flag")
    }
    fn closed_flag(&self) -> PathBuf {
        self.lock_root.join("closed.flag")
    }
    fn stop_flag(&self) -> PathBuf {
        self.lock_root.join("stop.flag")
    }

    fn sidecar(&self) -> SidecarLock {
        SidecarLock::new(&self.lock_root)
    }

    fn ensure_root(&self) -> Result<(), SeqError> {
        std::fs::create_dir_all(&self.lock_root)
            .map_err(|e| SeqError::LockBusy(format!("create lock root: {e}")))
    }

    /// Append one command vector to the tail of the queue. Rejected while
    /// the queue is closed.
    pub fn submit(&self, submitter_id: &str, command: &[String], now_epoch_s: u64) -> Result<(), SeqError> {
        self.submit_batch(submitter_id, std::slice::from_ref(&command.to_vec()), now_epoch_s)
            .map(|_| ())
    }

    /// Append many command vectors as a single atomic append: batch
    /// submission preserves relative order and is indivisible with
    /// respect to other submitters.
    pub fn submit_batch(
        &self,
        submitter_id: &str,
        commands: &[Vec<String>],
        now_epoch_s: u64,
    ) -> Result<usize, SeqError> {
        if self.is_closed() {
            return Err(SeqError::QueueClosed);
        }
        for command in commands {
            validate_command(command)?;
        }
        self.ensure_root()?;
        let _guard = self.sidecar().acquire(LOCK_ATTEMPTS, LOCK_BACKOFF)?;

        // Re-check closed state under the lock: a concurrent close() may
        // have landed between our check above and acquiring the lock.
        if self.is_closed() {
            return Err(SeqError::QueueClosed);
        }

        let mut lines = String::new();
        for command in commands {
            let entry = QueueEntry {
                submitter_id: submitter_id.to_string(),
                submitted_at_epoch_s: now_epoch_s,
                command: command.clone(),
            };
            lines.push_str(&encode_entry(&entry)?);
            lines.push('\n');
        }
        append_file(&self.queue_file(), &lines)?;
        Ok(commands.len())
    }

    /// Pop the oldest valid entry off the head of the queue. Entries that
    /// fail re-validation at pop time are discarded rather than returned
    /// or left to jam the queue.
    pub fn pop_next(&self) -> Result<Option<QueueEntry>, SeqError> {
        self.ensure_root()?;
        let _guard = self.sidecar().acquire(LOCK_ATTEMPTS, LOCK_BACKOFF)?;

        let contents = std::fs::read_to_string(self.queue_file()).unwrap_or_default();
        let mut remaining = contents.lines();
        let mut popped = None;
        for line in remaining.by_ref() {
            if line.trim().is_empty() {
                continue;
            }
            match decode_entry(line) {
                Ok(entry) if validate_command(&entry.command).is_ok() => {
                    popped = Some(entry);
                    break;
                }
                _ => continue, // invalid entry: drop silently, try the next one
            }
        }
        let rest: String = remaining.fold(String::new(), |mut acc, l| {
            acc.push_str(l);
            acc.push('\n');
            acc
        });
        std::fs::write(self.queue_file(), rest)
            .map_err(|e| SeqError::LockBusy(format!("rewrite queue file: {e}")))?;
        Ok(popped)
    }

    /// Remove all pending entries, returning the count removed.
    pub fn clear(&self) -> Result<usize, SeqError> {
        self.ensure_root()?;
        let _guard = self.sidecar().acquire(LOCK_ATTEMPTS, LOCK_BACKOFF)?;
        let contents = std::fs::read_to_string(self.queue_file()).unwrap_or_default();
        let count = contents.lines().filter(|l| !l.trim().is_empty()).count();
        std::fs::write(self.queue_file(), "")
            .map_err(|e| SeqError::LockBusy(format!("clear queue file: {e}")))?;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        std::fs::read_to_string(self.queue_file())
            .map(|c| c.lines().filter(|l| !l.trim().is_empty()).count())
            .unwrap_or(0)
    }

    pub fn pause(&self) -> Result<(), SeqError> {
        self.ensure_root()?;
        std::fs::write(self.paused_flag(), "")
            .map_err(|e| SeqError::LockBusy(format!("set paused flag: {e}")))
    }

    pub fn resume(&self) -> Result<(), SeqError> {
        match std::fs::remove_file(self.paused_flag()) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    pub fn close(&self) -> Result<(), SeqError> {
        self.ensure_root()?;
        std::fs::write(self.closed_flag(), "")
            .map_err(|e| SeqError::LockBusy(format!("set closed flag: {e}")))
    }

    pub fn reopen(&self) -> Result<(), SeqError> {
        match std::fs::remove_file(self.closed_flag()) {
            Ok(()) | Err(_) => Ok(()),
        }
    }

    /// Request that the engine's control loop exit after its current
    /// iteration. A graceful halt: it does not kill an in-flight job.
    pub fn request_stop(&self) -> Result<(), SeqError> {
        self.ensure_root()?;
        std::fs::write(self.stop_flag(), "")
            .map_err(|e| SeqError::LockBusy(format!("set stop flag: {e}")))
    }

    pub fn take_stop_request(&self) -> bool {
        let path = self.stop_flag();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
            true
        } else {
            false
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_flag().exists()
    }

    pub fn is_closed(&self) -> bool {
        self.closed_flag().exists()
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            depth: self.len(),
            paused: self.is_paused(),
            closed: self.is_closed(),
            running: CurrentPidLock::new(&self.lock_root).is_held_by_live_process(),
        }
    }
}

fn append_file(path: &Path, contents: &str) -> Result<(), SeqError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SeqError::LockBusy(format!("open queue file: {e}")))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| SeqError::LockBusy(format!("append queue file: {e}")))
}

fn encode_entry(entry: &QueueEntry) -> Result<String, SeqError> {
    let json = serde_json::to_string(&entry.command)
        .map_err(|e| SeqError::InternalInvariantViolation(format!("encode command: {e}")))?;
    Ok(format!("{}:{}:{}", entry.submitter_id, entry.submitted_at_epoch_s, json))
}

fn decode_entry(line: &str) -> Result<QueueEntry, SeqError> {
    let mut parts = line.splitn(3, ':');
    let submitter_id = parts
        .next()
        .ok_or_else(|| SeqError::InternalInvariantViolation("empty queue line".into()))?
        .to_string();
    let submitted_at_epoch_s = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| SeqError::InternalInvariantViolation("bad queue line timestamp".into()))?;
    let json = parts
        .next()
        .ok_or_else(|| SeqError::InternalInvariantViolation("bad queue line command".into()))?;
    let command: Vec<String> = serde_json::from_str(json)
        .map_err(|e| SeqError::InternalInvariantViolation(format!("decode command: {e}")))?;
    Ok(QueueEntry {
        submitter_id,
        submitted_at_epoch_s,
        command,
    })
}

/// Reject command vectors containing raw control characters (other than
/// tab), which would corrupt the line-oriented on-disk format or smuggle
/// terminal escape sequences into recorded output.
fn validate_command(command: &[String]) -> Result<(), SeqError> {
    if command.is_empty() {
        return Err(SeqError::UnsafeCommandVector("empty command vector".into()));
    }
    for token in command {
        if token.chars().any(|c| c.is_control() && c != '\t') {
            return Err(SeqError::UnsafeCommandVector(format!(
                "control character in token: {token:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Vec<String> {
        s.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn submit_then_pop_fifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.submit("alice", &v("pytest tests/"), 1).unwrap();
        q.submit("bob", &v("ruff check src/"), 2).unwrap();
        let first = q.pop_next().unwrap().unwrap();
        assert_eq!(first.submitter_id, "alice");
        let second = q.pop_next().unwrap().unwrap();
        assert_eq!(second.submitter_id, "bob");
        assert!(q.pop_next().unwrap().is_none());
    }

    #[test]
    fn submit_rejected_when_closed() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.close().unwrap();
        let result = q.submit("alice", &v("pytest"), 1);
        assert!(matches!(result, Err(SeqError::QueueClosed)));
    }

    #[test]
    fn reopen_allows_submission_again() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.close().unwrap();
        q.reopen().unwrap();
        assert!(q.submit("alice", &v("pytest"), 1).is_ok());
    }

    #[test]
    fn pause_and_resume_are_idempotent_flags() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        assert!(!q.is_paused());
        q.pause().unwrap();
        q.pause().unwrap();
        assert!(q.is_paused());
        q.resume().unwrap();
        q.resume().unwrap();
        assert!(!q.is_paused());
    }

    #[test]
    fn clear_removes_all_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.submit_batch("alice", &[v("a"), v("b"), v("c")], 1).unwrap();
        assert_eq!(q.len(), 3);
        let removed = q.clear().unwrap();
        assert_eq!(removed, 3);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn batch_submission_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.submit_batch("alice", &[v("one"), v("two"), v("three")], 1).unwrap();
        let a = q.pop_next().unwrap().unwrap();
        let b = q.pop_next().unwrap().unwrap();
        let c = q.pop_next().unwrap().unwrap();
        assert_eq!(a.command, v("one"));
        assert_eq!(b.command, v("two"));
        assert_eq!(c.command, v("three"));
    }

    #[test]
    fn stop_request_is_consumed_once() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.request_stop().unwrap();
        assert!(q.take_stop_request());
        assert!(!q.take_stop_request());
    }

    #[test]
    fn status_reports_depth_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        let q = QueueStore::new(dir.path());
        q.submit("alice", &v("pytest"), 1).unwrap();
        q.pause().unwrap();
        let status = q.status();
        assert_eq!(status.depth, 1);
        assert!(status.paused);
        assert!(!status.closed);
        assert!(!status.running);
    }

    #[test]
    fn concurrent_submitters_from_multiple_threads_preserve_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let q = std::sync::Arc::new(QueueStore::new(dir.path()));
        let mut handles = Vec::new();
        for t in 0..6 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                q.submit(&format!("submitter-{t}"), &v("pytest"), t as u64).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.len(), 6);
    }
}
