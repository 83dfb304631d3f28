//! Single-instance lock file.
//!
//! Exclusive-create semantics: the file's content is the owning PID. A lock
//! whose owner no longer exists is reclaimed by deleting it and retrying the
//! exclusive create — only one contender can win the retry.

use std::{fs::OpenOptions, io, io::Write as _, path::PathBuf};

use nix::{sys::signal::kill, unistd::Pid};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("another instance is active (pid {pid})")]
    Held { pid: i32 },
    #[error("lock file {path} is unreadable: {source}")]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// An acquired PID lock; released (best-effort) on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    owned: bool,
}

impl LockFile {
    /// Acquires the lock at `path`, reclaiming it if the recorded owner is
    /// no longer alive.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        match Self::try_create(&path) {
            Ok(lock) => return Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|source| Error::Unreadable { path: path.clone(), source })?;
        let pid: i32 = contents.trim().parse().unwrap_or(0);

        if pid > 0 && pid_alive(pid) {
            return Err(Error::Held { pid });
        }

        tracing::warn!(path = %path.display(), stale_pid = pid, "reclaiming stale lock");
        let _ = std::fs::remove_file(&path);

        // Another contender may have won the race between remove and create;
        // exclusive create decides.
        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let pid = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|c| c.trim().parse().ok())
                    .unwrap_or(0);
                Err(Error::Held { pid })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        Ok(Self { path: path.clone(), owned: true })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Reads the owner recorded in a lock file, if one exists and is alive.
    pub fn holder(path: &PathBuf) -> Option<i32> {
        let pid: i32 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
        (pid > 0 && pid_alive(pid)).then_some(pid)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), ?e, "failed to release lock");
            }
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    // Signal 0: existence check without delivering anything.
    kill(Pid::from_raw(pid), None).is_ok()
}
