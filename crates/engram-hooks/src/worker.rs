//! Detached background worker spawn.
//!
//! A hook must return within its wall-clock budget, so heavy work is handed
//! to a re-invocation of our own binary: stdio fully redirected to a log
//! file, detached from the hook's process group, lock rewritten with the
//! child's pid. The worker removes the lock when it exits; the stale TTL
//! covers a worker that dies uncleanly.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::info;

use crate::error::Result;
use crate::lock::{LockGuard, SingletonLock};

/// Spawn `current_exe` with `args` as a detached background process and
/// transfer `guard` (the lock the hook already holds) to the child's pid.
///
/// Returns the child pid. Total cost is one fork — well inside a 2.5 s hook
/// budget.
pub fn spawn_detached(
    args: &[String],
    log_path: &Path,
    lock: &SingletonLock,
    guard: LockGuard,
    owner: &str,
) -> Result<u32> {
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    let err = out.try_clone()?;

    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // New process group: the worker survives the hook's exit and never
        // receives the host's terminal signals.
        cmd.process_group(0);
    }

    let child = cmd.spawn()?;
    let pid = child.id();
    lock.transfer(guard, pid, owner)?;
    info!(pid, log = %log_path.display(), "background worker spawned");
    Ok(pid)
}
