//! Writer lock: an OS-level exclusive lock on a file next to the store.
//!
//! Exactly one process may hold it. The holder keeps the file descriptor
//! open for its whole lifetime and writes its identity into the file so
//! that `health` and a refused second writer can name it. On clean shutdown
//! the file is removed; after a crash the OS drops the lock and the stale
//! contents are simply overwritten by the next holder.

use anyhow::{Context, Result};
use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::DaemonError;

/// Identity recorded in the lock file by the current holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at: String,
    pub store: String,
    /// Actual control-plane address once the server is bound.
    #[serde(default)]
    pub control_addr: Option<String>,
    /// Run identifier of the session holding the lock.
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug)]
pub struct WriterLock {
    file: Option<File>,
    path: PathBuf,
    holder: LockHolder,
}

impl WriterLock {
    /// Try to become the single writer for `store`.
    ///
    /// Never blocks: if another live process holds the lock this returns
    /// [`DaemonError::LockContention`] without touching the store or the
    /// holder's recorded identity.
    pub fn acquire(lock_path: &Path, store: &Path, run_id: &str) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        // No truncate here: the current holder's identity must survive a
        // refused attempt.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .with_context(|| format!("failed to open {}", lock_path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                return Err(contention(lock_path).into());
            }
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => {
                return Err(contention(lock_path).into());
            }
            Err(err) => return Err(err.into()),
        }

        let holder = LockHolder {
            pid: std::process::id(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
            store: store.display().to_string(),
            control_addr: None,
            run_id: Some(run_id.to_string()),
        };

        let mut lock = Self {
            file: Some(file),
            path: lock_path.to_path_buf(),
            holder,
        };
        lock.write_holder()?;
        Ok(lock)
    }

    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the bound control-plane address so clients can find it.
    pub fn set_control_addr(&mut self, addr: &str) -> Result<()> {
        self.holder.control_addr = Some(addr.to_string());
        self.write_holder()
    }

    /// Clean release: remove the lock file, then drop the descriptor.
    pub fn release(mut self) {
        self.remove();
    }

    fn write_holder(&mut self) -> Result<()> {
        let body = serde_json::to_string(&self.holder)?;
        if let Some(file) = self.file.as_mut() {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(body.as_bytes())?;
            file.sync_data()?;
        }
        Ok(())
    }

    fn remove(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs::remove_file(&self.path);
            let _ = file.unlock();
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Read whatever identity the lock file currently records.
///
/// The presence of a holder does not prove the lock is held; use
/// [`is_held`] for that.
pub fn read_holder(lock_path: &Path) -> Option<LockHolder> {
    fs::read_to_string(lock_path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Check whether a live process currently holds the lock.
pub fn is_held(lock_path: &Path) -> bool {
    let file = match OpenOptions::new().read(true).write(true).open(lock_path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.unlock();
            false
        }
        Err(_) => true,
    }
}

fn contention(lock_path: &Path) -> DaemonError {
    let holder = read_holder(lock_path)
        .map(|h| format!("pid {} since {}", h.pid, h.acquired_at))
        .unwrap_or_else(|| "unknown holder".to_string());
    DaemonError::LockContention {
        path: lock_path.display().to_string(),
        holder,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_writer_is_refused() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("store.sqlite.lock");
        let store = tmp.path().join("store.sqlite");

        let first = WriterLock::acquire(&lock_path, &store, "run-a").unwrap();
        assert!(is_held(&lock_path));

        let err = WriterLock::acquire(&lock_path, &store, "run-b").unwrap_err();
        let daemon_err = err.downcast_ref::<DaemonError>().unwrap();
        assert!(matches!(daemon_err, DaemonError::LockContention { .. }));

        // The refused attempt left the holder's identity intact
        let holder = read_holder(&lock_path).unwrap();
        assert_eq!(holder.run_id.as_deref(), Some("run-a"));
        assert_eq!(holder.pid, std::process::id());

        first.release();
        assert!(!lock_path.exists());
        assert!(!is_held(&lock_path));
    }

    #[test]
    fn control_addr_is_published() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("s.lock");
        let mut lock = WriterLock::acquire(&lock_path, &tmp.path().join("s"), "r").unwrap();
        lock.set_control_addr("127.0.0.1:4567").unwrap();
        let holder = read_holder(&lock_path).unwrap();
        assert_eq!(holder.control_addr.as_deref(), Some("127.0.0.1:4567"));
    }

    #[test]
    fn reacquire_after_drop() {
        let tmp = TempDir::new().unwrap();
        let lock_path = tmp.path().join("s.lock");
        {
            let _lock = WriterLock::acquire(&lock_path, &tmp.path().join("s"), "r1").unwrap();
        }
        let lock = WriterLock::acquire(&lock_path, &tmp.path().join("s"), "r2").unwrap();
        assert_eq!(lock.holder().run_id.as_deref(), Some("r2"));
    }
}
