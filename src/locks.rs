//! Two mutual-exclusion primitives:
//!
//! - [`SidecarLock`]: a short-lived, `mkdir`-based lock guarding a single
//!   non-atomic queue-file sequence (read-head-then-remove; append-many).
//!   Portable to POSIX hosts without file-locking APIs.
//! - [`CurrentPidLock`]: the single, longer-held lock that guarantees at
//!   most one job running per project. Distinct from the sidecar lock;
//!   the two never nest.
//!
//! Both self-heal from a crashed holder by checking whether the recorded
//! holder PID is still alive.

use crate::errors::SeqError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns true if a process with the given PID currently exists.
#[cfg(unix)]
pub fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: kill(2) with signal 0 performs no action beyond existence /
    // permission checks; always safe to call with any PID value.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    // EPERM means the process exists but we lack permission to signal it —
    // still alive from our point of view.
    matches!(err.raw_os_error(), Some(libc::EPERM))
}

#[cfg(not(unix))]
pub fn pid_is_alive(_pid: u32) -> bool {
    // Conservative: without a portable liveness check, assume alive so we
    // never reclaim a lock out from under a live holder.
    true
}

/// A short-lived `mkdir`-based lock. Acquisition is bounded retry with
/// small backoff; exhausting the budget returns `LockBusy` rather than
/// silently proceeding unlocked.
pub struct SidecarLock {
    path: PathBuf,
}

pub struct SidecarLockGuard {
    path: PathBuf,
}

impl SidecarLock {
    pub fn new(lock_root: &Path) -> Self {
        SidecarLock {
            path: lock_root.join("executor.lock"),
        }
    }

    /// Attempt to acquire the lock, retrying up to `attempts` times with
    /// `backoff` between tries.
    pub fn acquire(&self, attempts: u32, backoff: Duration) -> Result<SidecarLockGuard, SeqError> {
        for attempt in 0..attempts.max(1) {
            match std::fs::create_dir(&self.path) {
                Ok(()) => {
                    let holder_path = self.path.join("holder.pid");
                    let _ = std::fs::write(&holder_path, std::process::id().to_string());
                    return Ok(SidecarLockGuard {
                        path: self.path.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_dead() {
                        // Holder is gone; loop again immediately to race for
                        // the now-removed directory.
                        continue;
                    }
                    if attempt + 1 < attempts {
                        std::thread::sleep(backoff);
                    }
                }
                Err(e) => {
                    return Err(SeqError::LockBusy(format!(
                        "could not create lock dir {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }
        Err(SeqError::LockBusy(format!(
            "sidecar lock busy after {attempts} attempts: {}",
            self.path.display()
        )))
    }

    /// If the existing lock directory's recorded holder PID is dead,
    /// remove the directory and return true. Best-effort: any I/O failure
    /// is treated as "could not reclaim" rather than propagated, since the
    /// caller simply retries.
    fn reclaim_if_dead(&self) -> bool {
        let holder_path = self.path.join("holder.pid");
        let Ok(contents) = std::fs::read_to_string(&holder_path) else {
            // No holder record — a partially-created lock dir from a
            // process that died between mkdir and writing holder.pid.
            // Safe to reclaim.
            return std::fs::remove_dir_all(&self.path).is_ok();
        };
        let Ok(pid) = contents.trim().parse::<u32>() else {
            return std::fs::remove_dir_all(&self.path).is_ok();
        };
        if pid_is_alive(pid) {
            false
        } else {
            std::fs::remove_dir_all(&self.path).is_ok()
        }
    }
}

impl Drop for SidecarLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// The *current-pid* lock: the single primitive that guarantees at most
/// one job is in `running` state per project at any instant.
pub struct CurrentPidLock {
    path: PathBuf,
}

pub struct CurrentPidLockGuard {
    path: PathBuf,
}

impl CurrentPidLock {
    pub fn new(lock_root: &Path) -> Self {
        CurrentPidLock {
            path: lock_root.join("current.pid"),
        }
    }

    /// Try to acquire the lock. Returns `Ok(None)` (not an error) if
    /// another live process already holds it — that is a normal
    /// "someone else is running a job right now" outcome, not a failure.
    ///
    /// If the recorded holder is dead, the lock is reclaimed: the next
    /// engine start detects a dead holder, clears the lock, and proceeds.
    pub fn try_acquire(&self) -> Result<Option<CurrentPidLockGuard>, SeqError> {
        if let Ok(contents) = std::fs::read_to_string(&self.path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if pid_is_alive(pid) {
                    return Ok(None);
                }
                // Dead holder: fall through and reclaim.
            }
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SeqError::LockBusy(format!("create lock root: {e}")))?;
        }
        std::fs::write(&self.path, std::process::id().to_string())
            .map_err(|e| SeqError::LockBusy(format!("write current.pid: {e}")))?;
        Ok(Some(CurrentPidLockGuard {
            path: self.path.clone(),
        }))
    }

    /// Whether a job currently appears to be running (holder alive).
    pub fn is_held_by_live_process(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(pid_is_alive)
            .unwrap_or(false)
    }
}

impl Drop for CurrentPidLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
