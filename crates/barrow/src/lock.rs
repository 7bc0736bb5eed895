//! Advisory file locks.
//!
//! The configuration lock is taken without blocking so a second barrow
//! process fails fast. The journal lock is waited for, polling until an
//! optional timeout runs out.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;
use tracing::debug;

/// Delay between two attempts while waiting for a lock.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot open lock file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path:?} is locked: another barrow process is likely running")]
    Busy { path: PathBuf },

    #[error("timed out after {waited:?} waiting for lock {path:?}")]
    Timeout { path: PathBuf, waited: Duration },

    #[error("flock on {path:?} failed: {errno}")]
    Flock { path: PathBuf, errno: Errno },
}

/// An exclusive lock held until dropped.
pub struct FileLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

impl FileLock {
    /// Take the lock or fail immediately with [`LockError::Busy`].
    pub fn try_acquire(path: &Path) -> Result<Self, LockError> {
        let file = open_lock_file(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Self::held(path, lock)),
            Err((_, Errno::EWOULDBLOCK)) => Err(LockError::Busy {
                path: path.to_path_buf(),
            }),
            Err((_, errno)) => Err(LockError::Flock {
                path: path.to_path_buf(),
                errno,
            }),
        }
    }

    /// Wait for the lock, forever when `timeout` is `None`.
    pub fn acquire(path: &Path, timeout: Option<Duration>) -> Result<Self, LockError> {
        let Some(timeout) = timeout else {
            let file = open_lock_file(path)?;
            return Flock::lock(file, FlockArg::LockExclusive)
                .map(|lock| Self::held(path, lock))
                .map_err(|(_, errno)| LockError::Flock {
                    path: path.to_path_buf(),
                    errno,
                });
        };

        let started = Instant::now();
        let mut file = open_lock_file(path)?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(lock) => return Ok(Self::held(path, lock)),
                Err((back, Errno::EWOULDBLOCK)) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(LockError::Timeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    file = back;
                    thread::sleep(POLL_INTERVAL);
                }
                Err((_, errno)) => {
                    return Err(LockError::Flock {
                        path: path.to_path_buf(),
                        errno,
                    });
                }
            }
        }
    }

    fn held(path: &Path, lock: Flock<File>) -> Self {
        debug!(?path, "lock acquired");
        Self {
            path: path.to_path_buf(),
            _lock: lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> Result<File, LockError> {
    let open_err = |source| LockError::Open {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(open_err)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(open_err)
}
