//! Host-scoped job lock. At most one crawler job runs at a time; a holder
//! older than the staleness cap is force-killed together with its process
//! group, which takes any orphaned headless-browser children down with it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fs2::FileExt;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{getpgrp, getpid, Pid};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::error::LockError;

/// A holder older than this is considered hung and gets evicted.
pub const STALE_AFTER_HOURS: i64 = 3;

/// Default time a job waits for the lock before exiting with code 75.
pub const DEFAULT_ACQUIRE_WAIT: Duration = Duration::from_secs(5 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: i32,
    pgid: i32,
    job: String,
    acquired_at: DateTime<Utc>,
}

/// Exclusive advisory lock on a well-known file. Released on drop.
pub struct JobLock {
    file: File,
    path: PathBuf,
}

impl JobLock {
    /// Block up to `wait` for the lock, evicting a stale holder on the
    /// way. Synchronous on purpose: it runs before any job concurrency
    /// starts.
    pub fn acquire(path: &Path, job: &str, wait: Duration) -> Result<JobLock, LockError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + wait;
        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    let info = LockInfo {
                        pid: getpid().as_raw(),
                        pgid: getpgrp().as_raw(),
                        job: job.to_string(),
                        acquired_at: Utc::now(),
                    };
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                    file.sync_all()?;
                    info!("Acquired job lock for '{}'", job);
                    return Ok(JobLock {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(_) => {
                    evict_if_stale(&mut file);
                    if Instant::now() >= deadline {
                        return Err(LockError::Contested);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Read the holder's metadata and, when it is older than the staleness
/// cap, terminate its whole process group: SIGTERM, a short grace, then
/// SIGKILL.
fn evict_if_stale(file: &mut File) {
    let mut raw = String::new();
    if file.read_to_string(&mut raw).is_err() || raw.is_empty() {
        return;
    }
    let info: LockInfo = match serde_json::from_str(&raw) {
        Ok(info) => info,
        Err(_) => return,
    };
    let age = Utc::now() - info.acquired_at;
    if age <= ChronoDuration::hours(STALE_AFTER_HOURS) {
        return;
    }
    warn!(
        "Lock holder '{}' (pid {}) is {}h old, force-killing its process group",
        info.job,
        info.pid,
        age.num_hours()
    );
    let pgid = Pid::from_raw(info.pgid);
    if killpg(pgid, Signal::SIGTERM).is_ok() {
        std::thread::sleep(TERM_GRACE);
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

impl From<serde_json::Error> for LockError {
    fn from(e: serde_json::Error) -> Self {
        LockError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.lock");
        let lock = JobLock::acquire(&path, "test", Duration::from_secs(0)).unwrap();
        drop(lock);
        // Re-acquirable after release.
        let again = JobLock::acquire(&path, "test", Duration::from_secs(0));
        assert!(again.is_ok());
    }

    #[test]
    fn contested_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.lock");
        let _held = JobLock::acquire(&path, "holder", Duration::from_secs(0)).unwrap();
        let second = JobLock::acquire(&path, "second", Duration::from_secs(0));
        assert!(matches!(second, Err(LockError::Contested)));
    }

    #[test]
    fn fresh_holder_is_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawler.lock");
        let info = LockInfo {
            pid: i32::MAX,
            pgid: i32::MAX,
            job: "fresh".to_string(),
            acquired_at: Utc::now(),
        };
        std::fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();
        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        evict_if_stale(&mut file);
        // Lock file untouched for a fresh holder.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("fresh"));
    }
}
