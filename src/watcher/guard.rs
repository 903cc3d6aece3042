//! Single-instance guard
//!
//! An exclusive, non-blocking `flock` on the lock file. The holder's PID is
//! written into the file so a refused instance can report who owns it. The lock
//! is released when the guard drops or the process dies.

use crate::common::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct InstanceGuard {
    _lock: Flock<File>,
    path: PathBuf,
}

impl InstanceGuard {
    /// Take the lock, or fail with `AlreadyRunning` when another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((mut file, errno)) if errno == Errno::EWOULDBLOCK => {
                let mut pid = String::new();
                file.read_to_string(&mut pid)?;
                return Err(Error::AlreadyRunning(pid.trim().to_string()));
            }
            Err((_, errno)) => return Err(errno.into()),
        };

        lock.set_len(0)?;
        lock.seek(SeekFrom::Start(0))?;
        write!(lock, "{}", std::process::id())?;
        lock.sync_all()?;

        tracing::info!(path = %path.display(), pid = std::process::id(), "Instance lock acquired");
        Ok(Self {
            _lock: lock,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_instance_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run").join("watcher.lock");

        let guard = InstanceGuard::acquire(&path).unwrap();
        let pid = std::fs::read_to_string(guard.path()).unwrap();
        assert_eq!(pid, std::process::id().to_string());

        match InstanceGuard::acquire(&path) {
            Err(Error::AlreadyRunning(owner)) => assert_eq!(owner, pid),
            other => panic!("expected AlreadyRunning, got {:?}", other.map(|_| ())),
        }

        drop(guard);
        assert!(InstanceGuard::acquire(&path).is_ok());
    }
}
