//! Single-instance guard.
//!
//! An exclusive advisory lock on `<cache_dir>/daemon.pid` prevents two
//! daemons from sharing one cache tree. The file descriptor must live
//! for the whole process lifetime; dropping it releases the lock.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("another daemon is already running{0}")]
    AlreadyRunning(String),

    #[error("could not create pid file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct InstanceLock {
    _file: std::fs::File,
}

impl InstanceLock {
    /// Acquire the lock or fail with the holder's pid.
    pub fn acquire(pid_file: &Path) -> Result<Self, InstanceError> {
        if let Some(parent) = pid_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(pid_file)?;
        if file.try_lock_exclusive().is_err() {
            let mut existing = String::new();
            let _ = file.read_to_string(&mut existing);
            let holder = existing.trim();
            let hint = if holder.is_empty() {
                String::new()
            } else {
                format!(" (PID {holder})")
            };
            return Err(InstanceError::AlreadyRunning(hint));
        }
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        info!(path = %pid_file.display(), "instance lock acquired");
        Ok(Self { _file: file })
    }
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock").finish_non_exhaustive()
    }
}
