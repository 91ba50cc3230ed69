//! File locks shared between conbuilder processes.
//!
//! `flock` locks belong to the open file description, so two handles opened
//! in the same process exclude each other just like two processes do.

use crate::error::{ConbuilderError, ConbuilderResult};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock, released on drop
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Block until the lock is held
    pub(crate) fn acquire(path: &Path) -> ConbuilderResult<Self> {
        let file = open_lock_file(path)?;
        flock_exclusive(&file)
            .map_err(|e| ConbuilderError::io(format!("locking {}", path.display()), e))?;
        Ok(Self { _file: file })
    }

    /// Acquire without blocking the async runtime
    pub(crate) async fn acquire_async(path: PathBuf) -> ConbuilderResult<Self> {
        debug!("Waiting for lock {}", path.display());
        tokio::task::spawn_blocking(move || Self::acquire(&path))
            .await
            .map_err(|e| ConbuilderError::Internal(format!("lock task failed: {}", e)))?
    }
}

fn open_lock_file(path: &Path) -> ConbuilderResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            ConbuilderError::io(format!("creating lock directory {}", parent.display()), e)
        })?;
    }

    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| ConbuilderError::io(format!("opening lock file {}", path.display()), e))
}

fn flock_exclusive(file: &File) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn lock_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locks").join("a.lock");
        let _lock = FileLock::acquire(&path).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.lock");
        {
            let _lock = FileLock::acquire(&path).unwrap();
        }
        // would block forever if the first lock were still held
        let _again = FileLock::acquire(&path).unwrap();
    }

    #[test]
    fn second_holder_waits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.lock");
        let first = FileLock::acquire(&path).unwrap();
        let acquired = Arc::new(AtomicBool::new(false));

        let handle = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _second = FileLock::acquire(&path).unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));

        drop(first);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }
}
