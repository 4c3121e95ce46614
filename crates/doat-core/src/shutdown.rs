//! Cleanup that must still happen when the harness itself is interrupted.
//!
//! Normal returns and aborts clean up through `Drop` on the supervisor and
//! the patch guard. A termination signal bypasses both, so the live process
//! groups and pending file restores are mirrored here for the signal handler.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::process::GroupId;

#[derive(Debug, Default)]
struct Pending {
    groups: Vec<GroupId>,
    restores: Vec<(PathBuf, Vec<u8>)>,
    scratch_dirs: Vec<PathBuf>,
}

/// What [`ShutdownRegistry::abandon`] managed to clean up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AbandonReport {
    pub groups_signalled: usize,
    pub files_restored: usize,
    pub failures: Vec<String>,
}

/// Shared, cloneable record of outstanding cleanup work.
#[derive(Debug, Clone, Default)]
pub struct ShutdownRegistry {
    inner: Arc<Mutex<Pending>>,
}

impl ShutdownRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_group(&self, group: GroupId) {
        self.lock().groups.push(group);
    }

    pub fn release_group(&self, group: GroupId) {
        self.lock().groups.retain(|&g| g != group);
    }

    pub fn pending_groups(&self) -> Vec<GroupId> {
        self.lock().groups.clone()
    }

    /// Remember the original bytes of `path` until [`Self::release_restore`].
    pub fn track_restore(&self, path: &Path, original: Vec<u8>) {
        let mut pending = self.lock();
        pending.restores.retain(|(p, _)| p != path);
        pending.restores.push((path.to_path_buf(), original));
    }

    pub fn release_restore(&self, path: &Path) {
        self.lock().restores.retain(|(p, _)| p != path);
    }

    pub fn pending_restores(&self) -> Vec<PathBuf> {
        self.lock().restores.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Directory to delete if the run is abandoned.
    pub fn track_scratch_dir(&self, dir: &Path) {
        self.lock().scratch_dirs.push(dir.to_path_buf());
    }

    /// Kill every tracked group and restore every tracked file.
    ///
    /// Safe to call from a signal-handler thread; drains the registry so a
    /// second call does nothing.
    pub fn abandon(&self) -> AbandonReport {
        let pending = std::mem::take(&mut *self.lock());
        let mut report = AbandonReport::default();

        for group in pending.groups {
            // SAFETY: killpg has no memory-safety preconditions.
            let rc = unsafe { libc::killpg(group, libc::SIGTERM) };
            let err = std::io::Error::last_os_error();
            if rc == 0 || err.raw_os_error() == Some(libc::ESRCH) {
                report.groups_signalled += 1;
            } else {
                report.failures.push(format!("process group {group}: {err}"));
            }
        }

        for (path, original) in pending.restores {
            match std::fs::write(&path, original) {
                Ok(()) => report.files_restored += 1,
                Err(e) => report.failures.push(format!("{}: {e}", path.display())),
            }
        }

        for dir in pending.scratch_dirs {
            if let Err(e) = std::fs::remove_dir_all(&dir)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                report.failures.push(format!("{}: {e}", dir.display()));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_on_abandon() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rte_config.h");
        std::fs::write(&path, "patched\n").unwrap();

        let registry = ShutdownRegistry::new();
        registry.track_restore(&path, b"original\n".to_vec());
        let report = registry.abandon();

        assert_eq!(report.files_restored, 1);
        assert!(report.failures.is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original\n");
    }

    #[test]
    fn test_released_restore_is_not_applied() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rte_config.h");
        std::fs::write(&path, "current\n").unwrap();

        let registry = ShutdownRegistry::new();
        registry.track_restore(&path, b"original\n".to_vec());
        registry.release_restore(&path);
        assert!(registry.pending_restores().is_empty());
        assert_eq!(registry.abandon().files_restored, 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "current\n");
    }

    #[test]
    fn test_abandon_drains_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = tmp.path().join("tmp");
        std::fs::create_dir(&scratch).unwrap();

        let registry = ShutdownRegistry::new();
        registry.track_scratch_dir(&scratch);
        registry.abandon();
        assert!(!scratch.exists());
        assert_eq!(registry.abandon(), AbandonReport::default());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ShutdownRegistry::new();
        let handler_side = registry.clone();
        registry.track_group(4242);
        assert_eq!(handler_side.pending_groups(), vec![4242]);
        handler_side.release_group(4242);
        assert!(registry.pending_groups().is_empty());
    }
}
