use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cap_error::CapError;
use crate::log_warn;

/// Diagnostic record written next to the lock file while a capsule
/// invocation holds it. The file lock is the mutual exclusion; this record
/// only exists to make contention errors actionable.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LockHolder {
    pub pid: i32,
    /// What the holder is doing, e.g. `run demo-001.1.1`.
    pub task: String,
    pub started_at: String,
}

/// Repository-wide run lock.
///
/// Two capsule invocations against one repository must not interleave
/// their merges to main. The campaign runner is sequential internally, so
/// this closes the remaining hole of two separate processes. Released on
/// drop, along with the holder record.
#[must_use = "lock is released when RunLock is dropped"]
pub struct RunLock {
    lock: fslock::LockFile,
    holder_path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("holder_path", &self.holder_path)
            .finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: failed to release run lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.holder_path) {
            log_warn!(
                "Warning: failed to remove holder record {}: {}",
                self.holder_path.display(),
                e
            );
        }
    }
}

/// Acquire the run lock, recording `task` as the holder description.
///
/// Creates `{runtime_dir}` if needed. Contention is a setup error --
/// nothing has run yet -- and the error names the holding invocation when
/// its record is readable.
pub fn acquire(runtime_dir: &Path, task: &str) -> Result<RunLock, CapError> {
    fs::create_dir_all(runtime_dir).map_err(|e| {
        CapError::Config(format!("Failed to create {}: {}", runtime_dir.display(), e))
    })?;

    let lock_path = runtime_dir.join("capsule.lock");
    let holder_path = runtime_dir.join("capsule.holder.json");

    let mut lock = fslock::LockFile::open(&lock_path).map_err(|e| {
        CapError::Config(format!(
            "Failed to open lock file {}: {}",
            lock_path.display(),
            e
        ))
    })?;

    let acquired = lock
        .try_lock()
        .map_err(|e| CapError::Config(format!("Failed to acquire run lock: {}", e)))?;

    if !acquired {
        return Err(CapError::Config(contention_message(
            &lock_path,
            &holder_path,
        )));
    }

    let holder = LockHolder {
        pid: std::process::id() as i32,
        task: task.to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
    };
    let json = serde_json::to_string_pretty(&holder)
        .map_err(|e| CapError::Config(format!("Failed to serialize holder record: {}", e)))?;
    fs::write(&holder_path, json).map_err(|e| {
        CapError::Config(format!(
            "Failed to write holder record {}: {}",
            holder_path.display(),
            e
        ))
    })?;

    Ok(RunLock { lock, holder_path })
}

/// Build the contention diagnostic from the holder record, when readable.
///
/// A record whose PID is gone points at an unexpected state: the OS-level
/// lock should have been released with the process, so the user is told
/// what to remove rather than left guessing.
fn contention_message(lock_path: &Path, holder_path: &Path) -> String {
    let holder = fs::read_to_string(holder_path)
        .ok()
        .and_then(|s| serde_json::from_str::<LockHolder>(&s).ok());

    match holder {
        Some(h) if pid_alive(h.pid) => format!(
            "Another capsule invocation is active: {} (PID {}, since {})",
            h.task, h.pid, h.started_at
        ),
        Some(h) => format!(
            "Run lock is held but its recorded holder ({}, PID {}) is gone. \
             Remove {} and {} to recover",
            h.task,
            h.pid,
            lock_path.display(),
            holder_path.display()
        ),
        None => format!(
            "Another capsule invocation holds the run lock. \
             If this is stale, remove {}",
            lock_path.display()
        ),
    }
}

fn pid_alive(pid: i32) -> bool {
    // signal 0 checks existence without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
