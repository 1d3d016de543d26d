//! Singleton-daemon PID file
//!
//! The daemon takes an exclusive `lockf` region on its PID file; a second
//! instance fails the lock and exits as already running. The lock lives
//! as long as the returned handle.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::status::Status;

/// Held PID-file lock; dropping it releases the lock but leaves the file
/// in place, [`PidFile::remove`] deletes it on clean shutdown.
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    /// Create (or reuse) the PID file and take the singleton lock.
    pub fn acquire(path: &Path) -> Result<Self, Status> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| Status::FileOpen {
                path: path.to_path_buf(),
                source,
            })?;
        let rc = unsafe { libc::lockf(file.as_raw_fd(), libc::F_TLOCK, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EAGAIN) => Err(Status::AlreadyRunning),
                _ => Err(Status::FileLock {
                    path: path.to_path_buf(),
                    source: err,
                }),
            };
        }
        let mut pidfile = PidFile {
            file,
            path: path.to_path_buf(),
        };
        pidfile
            .file
            .set_len(0)
            .and_then(|_| writeln!(pidfile.file, "{}", std::process::id()))
            .map_err(|source| Status::FileWrite {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(pidfile)
    }

    /// Delete the file on clean shutdown.
    pub fn remove(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
