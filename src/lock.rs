//! System-wide singleton lock for the "one supervisor per user" role.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use tracing::info;

/// Lock file name inside the execution directory.
pub const LOCK_FILE_NAME: &str = "server.lock";

/// Exclusive advisory lock held for the supervisor's entire running
/// lifetime. Dropping the handle unlocks and closes the file.
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl SingletonLock {
    /// Take the lock inside `execution_dir`, creating the directory and the
    /// lock file as needed. `Ok(None)` means another process already holds
    /// it — a normal contention outcome, not an error.
    ///
    /// Performs synchronous file I/O; call from a blocking-allowed context.
    pub fn acquire_in(execution_dir: &Path) -> io::Result<Option<Self>> {
        fs::create_dir_all(execution_dir)?;
        Self::acquire(&execution_dir.join(LOCK_FILE_NAME))
    }

    /// Take the lock on an explicit lock-file path.
    pub fn acquire(path: &Path) -> io::Result<Option<Self>> {
        let Some(file) = open_exclusive(path)? else {
            info!(
                path = %path.display(),
                "companion server already owned by another process"
            );
            return Ok(None);
        };

        info!(path = %path.display(), "acquired exclusive server lock");
        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        // On windows the exclusive share mode is released when the handle
        // closes with the struct.
        info!(path = %self.path.display(), "released server lock");
    }
}

#[cfg(unix)]
fn open_exclusive(path: &Path) -> io::Result<Option<File>> {
    use std::os::fd::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    // Non-blocking: contention is reported to the caller, never waited out.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => Ok(None),
        _ => Err(err),
    }
}

#[cfg(windows)]
fn open_exclusive(path: &Path) -> io::Result<Option<File>> {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;

    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .share_mode(0)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(err) if err.raw_os_error() == Some(ERROR_SHARING_VIOLATION) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(LOCK_FILE_NAME);

        let first = SingletonLock::acquire(&path).expect("first acquire");
        assert!(first.is_some());

        let second = SingletonLock::acquire(&path).expect("second acquire");
        assert!(second.is_none(), "lock must be exclusive while held");
    }

    #[test]
    fn reacquire_succeeds_after_release() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(LOCK_FILE_NAME);

        let first = SingletonLock::acquire(&path).expect("first acquire");
        drop(first);

        let second = SingletonLock::acquire(&path).expect("reacquire");
        assert!(second.is_some(), "released lock must be reacquirable");
    }

    #[test]
    fn acquire_in_creates_execution_dir() {
        let dir = TempDir::new().expect("tempdir");
        let exec_dir = dir.path().join("run");

        let lock = SingletonLock::acquire_in(&exec_dir).expect("acquire_in");
        assert!(lock.is_some());
        assert!(exec_dir.join(LOCK_FILE_NAME).exists());
    }
}
