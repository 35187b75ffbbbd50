//! Hook entry points.
//!
//! Hooks are bounded and silent: they read one JSON event from stdin, do the
//! minimum durable work (or hand it to a detached worker), log one line, and
//! exit 0. Nothing here may block the host agent or write to its UI.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use engram_core::config::EngramConfig;
use engram_hooks::error::GateError;
use engram_hooks::events::{SessionEndEvent, TokenMonitorEvent, ToolUseEvent};
use engram_hooks::guard::memory_preflight;
use engram_hooks::observe::ObservationLog;
use engram_hooks::worker::spawn_detached;
use engram_hooks::SingletonLock;

use crate::{HookCmd, EXIT_OK};

pub fn run(cmd: HookCmd, config: EngramConfig, config_path: Option<String>) -> Result<u8> {
    // A hook must never fail the host: every error path below degrades to a
    // logged no-op and exit 0.
    match cmd {
        HookCmd::TokenMonitor { sessions_dir } => {
            let stdin = read_stdin();
            let event: TokenMonitorEvent = match serde_json::from_str(&stdin) {
                Ok(ev) => ev,
                Err(e) => {
                    info!(err = %e, "token-monitor: unreadable event; ignoring");
                    return Ok(EXIT_OK);
                }
            };
            if !event.should_trigger() {
                return Ok(EXIT_OK);
            }
            info!(tokens = event.prompt_tokens(), "token threshold crossed");
            let Some(session) = latest_session(sessions_dir.as_deref()) else {
                info!("token-monitor: no session file found");
                return Ok(EXIT_OK);
            };
            launch_worker(&config, config_path, &session, "token-monitor");
            Ok(EXIT_OK)
        }
        HookCmd::SessionEnd { sessions_dir } => {
            let stdin = read_stdin();
            let event: SessionEndEvent = serde_json::from_str(&stdin).unwrap_or(SessionEndEvent {
                session_path: None,
            });
            let session = event
                .session_path
                .map(PathBuf::from)
                .filter(|p| p.is_file())
                .or_else(|| latest_session(sessions_dir.as_deref()));
            let Some(session) = session else {
                info!("session-end: no session file found");
                return Ok(EXIT_OK);
            };
            launch_worker(&config, config_path, &session, "session-end");
            Ok(EXIT_OK)
        }
        HookCmd::Observe => {
            let stdin = read_stdin();
            let event: ToolUseEvent = match serde_json::from_str(&stdin) {
                Ok(ev) => ev,
                Err(e) => {
                    info!(err = %e, "observe: unreadable event; ignoring");
                    return Ok(EXIT_OK);
                }
            };
            let log = ObservationLog::new(config.store.observations_path());
            if let Err(e) = log.append(&event) {
                warn!(err = %e, "observe: could not append");
            }
            Ok(EXIT_OK)
        }
    }
}

/// Acquire the extraction lock and hand the session to a detached worker.
/// Everything stays inside the hook's wall-clock budget: one lock write and
/// one fork.
fn launch_worker(
    config: &EngramConfig,
    config_path: Option<String>,
    session: &Path,
    hook_name: &str,
) {
    if let Err(e) = memory_preflight(config.guards.min_free_mb) {
        info!(hook = hook_name, err = %e, "skipping extraction");
        return;
    }

    let lock = SingletonLock::new(
        config.store.locks_dir().join(super::pipeline::EXTRACT_LOCK),
        Duration::from_secs(config.lock.hook_stale_ttl_secs),
    );
    let guard = match lock.acquire(hook_name) {
        Ok(g) => g,
        Err(GateError::LockHeld { pid }) => {
            info!(hook = hook_name, holder = pid, "extraction in progress");
            return;
        }
        Err(e) => {
            warn!(hook = hook_name, err = %e, "lock unavailable");
            return;
        }
    };

    let mut args = vec![
        "pipeline".to_string(),
        "run".to_string(),
        session.to_string_lossy().to_string(),
        "--background".to_string(),
    ];
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path);
    }

    match spawn_detached(
        &args,
        &config.store.worker_log_path(),
        &lock,
        guard,
        "extract-worker",
    ) {
        Ok(pid) => info!(hook = hook_name, pid, session = %session.display(), "worker launched"),
        Err(e) => {
            warn!(hook = hook_name, err = %e, "worker spawn failed");
            lock.release();
        }
    }
}

/// Most recently modified .jsonl transcript under `dir`.
fn latest_session(dir: Option<&Path>) -> Option<PathBuf> {
    let dir = dir?;
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH)
        })
}

fn read_stdin() -> String {
    std::io::read_to_string(std::io::stdin()).unwrap_or_default()
}
