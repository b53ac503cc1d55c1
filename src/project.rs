//! Project identity: derives the per-project lock directory from a content
//! hash of the project root path, so that multiple projects on one host
//! never share state.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Hex-encoded SHA-256 digest of the canonicalized project root, truncated
/// to 16 hex characters — enough to make accidental collisions between
/// projects on the same host implausible while keeping directory names
/// short.
pub fn project_hash(project_root: &Path) -> String {
    let canonical = project_root
        .canonicalize()
        .unwrap_or_else(|_| project_root.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// The per-project lock directory: `<project_root>/.sequential-locks/<hash>/`.
///
/// Only ever uses this project-local path; never reads or migrates a
/// legacy `/tmp/seq-exec-*` layout.
pub fn lock_dir(project_root: &Path) -> PathBuf {
    project_root
        .join(".sequential-locks")
        .join(project_hash(project_root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = project_hash(dir.path());
        let b = project_hash(dir.path());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn different_projects_hash_differently() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        assert_ne!(project_hash(a.path()), project_hash(b.path()));
    }

    #[test]
    fn lock_dir_is_project_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let ld = lock_dir(dir.path());
        assert!(ld.starts_with(dir.path().canonicalize().unwrap_or(dir.path().to_path_buf())) || ld.starts_with(dir.path()));
        assert!(ld.to_string_lossy().contains(".sequential-locks"));
    }
}
