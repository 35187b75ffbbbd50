//! Cross-process singleton locks.
//!
//! A lock is a small JSON record at a well-known path. Acquisition:
//! 1. no record → write it, own the lock;
//! 2. record older than the stale TTL → overwrite, own the lock;
//! 3. owner pid not alive → overwrite, own the lock;
//! 4. otherwise → busy; the caller exits cleanly or waits.
//!
//! Liveness is a no-op signal (`kill(pid, 0)`); staleness covers the cases a
//! signal can't (pid reuse, unreachable processes).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GateError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at_epoch_ms: u64,
    pub owner: String,
}

/// A named lock location plus its staleness policy.
pub struct SingletonLock {
    path: PathBuf,
    stale_ttl: Duration,
}

impl SingletonLock {
    pub fn new(path: PathBuf, stale_ttl: Duration) -> Self {
        Self { path, stale_ttl }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock for the current process.
    ///
    /// `Err(GateError::LockHeld)` means another live holder exists — callers
    /// log one line and exit silently.
    pub fn acquire(&self, owner: &str) -> Result<LockGuard> {
        if let Some(existing) = self.read_record()? {
            let age_ms = now_ms().saturating_sub(existing.acquired_at_epoch_ms);
            if age_ms > self.stale_ttl.as_millis() as u64 {
                warn!(path = %self.path.display(), pid = existing.pid, age_ms, "stealing stale lock");
            } else if pid_alive(existing.pid) {
                return Err(GateError::LockHeld { pid: existing.pid });
            } else {
                warn!(path = %self.path.display(), pid = existing.pid, "stealing lock from dead pid");
            }
        }

        self.write_record(std::process::id(), owner)?;
        debug!(path = %self.path.display(), owner, "lock acquired");
        Ok(LockGuard {
            path: self.path.clone(),
            armed: true,
        })
    }

    /// Record a different pid (a spawned worker) as the holder. Used by a
    /// hook that has just forked the worker: the guard it holds is disarmed
    /// and the worker becomes responsible for removal.
    pub fn transfer(&self, mut guard: LockGuard, child_pid: u32, owner: &str) -> Result<()> {
        self.write_record(child_pid, owner)?;
        guard.armed = false;
        debug!(path = %self.path.display(), child_pid, "lock transferred to worker");
        Ok(())
    }

    /// Remove the lock unconditionally — the worker's exit-path cleanup.
    pub fn release(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), err = %e, "failed to remove lock");
            }
        }
    }

    fn read_record(&self) -> Result<Option<LockRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(rec) => Ok(Some(rec)),
                Err(e) => {
                    // A torn write is as good as stale.
                    warn!(path = %self.path.display(), err = %e, "unreadable lock record; treating as stale");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_record(&self, pid: u32, owner: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = LockRecord {
            pid,
            acquired_at_epoch_ms: now_ms(),
            owner: owner.to_string(),
        };
        std::fs::write(&self.path, serde_json::to_string(&record)?)?;
        Ok(())
    }
}

/// Removes the lock file on drop unless disarmed by a transfer.
pub struct LockGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), err = %e, "failed to remove lock on drop");
                }
            }
        }
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// No-op signal probe. EPERM still means "alive, not ours".
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // No cheap probe off unix; the stale TTL is the only recovery path.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &tempfile::TempDir, ttl_secs: u64) -> SingletonLock {
        SingletonLock::new(dir.path().join("extract.lock"), Duration::from_secs(ttl_secs))
    }

    #[test]
    fn acquire_writes_record_and_drop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 300);
        {
            let _guard = lock.acquire("test").unwrap();
            let raw = std::fs::read_to_string(lock.path()).unwrap();
            let rec: LockRecord = serde_json::from_str(&raw).unwrap();
            assert_eq!(rec.pid, std::process::id());
            assert_eq!(rec.owner, "test");
        }
        assert!(!lock.path().exists(), "guard drop must remove the lock");
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 300);
        let _guard = lock.acquire("first").unwrap();
        assert!(matches!(
            lock.acquire("second"),
            Err(GateError::LockHeld { .. })
        ));
    }

    #[test]
    fn stale_lock_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 1);
        let record = LockRecord {
            pid: std::process::id(),
            acquired_at_epoch_ms: now_ms() - 10_000,
            owner: "old".to_string(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&record).unwrap()).unwrap();

        let _guard = lock.acquire("new").unwrap();
        let raw = std::fs::read_to_string(lock.path()).unwrap();
        let rec: LockRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(rec.owner, "new");
    }

    #[cfg(unix)]
    #[test]
    fn dead_pid_lock_is_stolen() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 3600);
        // fresh record, but the pid is (almost certainly) unused — far above
        // any realistic pid_max while still a valid pid_t
        let record = LockRecord {
            pid: 999_999_999,
            acquired_at_epoch_ms: now_ms(),
            owner: "ghost".to_string(),
        };
        std::fs::write(lock.path(), serde_json::to_string(&record).unwrap()).unwrap();
        assert!(lock.acquire("new").is_ok());
    }

    #[test]
    fn garbage_record_is_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 300);
        std::fs::write(lock.path(), "{half a rec").unwrap();
        assert!(lock.acquire("new").is_ok());
    }

    #[test]
    fn transfer_disarms_guard() {
        let dir = tempfile::tempdir().unwrap();
        let lock = lock_in(&dir, 300);
        let guard = lock.acquire("hook").unwrap();
        lock.transfer(guard, 12345, "worker").unwrap();
        // the hook-side guard is gone, but the lock file survives for the worker
        assert!(lock.path().exists());
        let rec: LockRecord =
            serde_json::from_str(&std::fs::read_to_string(lock.path()).unwrap()).unwrap();
        assert_eq!(rec.pid, 12345);
        lock.release();
        assert!(!lock.path().exists());
    }
}
