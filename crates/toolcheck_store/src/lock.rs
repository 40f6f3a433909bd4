//! Cross-process mutual exclusion over the result database.
//!
//! The database may live on a share that several machines write to, so the lock is a marker file next to it
//! rather than an OS advisory lock. A caller claims the lock by atomically creating the marker; everyone else
//! polls until it disappears.
//!
//! A holder that dies without releasing leaves the marker behind and every later caller waits forever (unless a
//! timeout is configured). [`FileLock`] logs a warning naming the marker and its recorded holder once the wait
//! passes the stale threshold so an operator can remove it by hand.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("cannot create lock marker {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out after {waited:?} waiting for lock marker {}", .path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("cannot remove lock marker {}: {source}", .path.display())]
    Release {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Something that grants exclusive access for the lifetime of its guard.
pub trait Lock {
    type Guard<'a>
    where
        Self: 'a;

    /// Block until the lock is held.
    fn acquire(&self) -> Result<Self::Guard<'_>, LockError>;
}

/// Marker-file lock.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
    timeout: Option<Duration>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            timeout: None,
        }
    }

    /// Give up with [`LockError::Timeout`] after `timeout` instead of waiting forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_claim(&self) -> Result<bool, LockError> {
        match fs::OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(mut file) => {
                // Holder details are informational only; the marker's existence is the lock.
                let _ = writeln!(file, "pid={} acquired={}", std::process::id(), Utc::now().to_rfc3339());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn holder(&self) -> String {
        fs::read_to_string(&self.path)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl Lock for FileLock {
    type Guard<'a> = FileLockGuard;

    fn acquire(&self) -> Result<Self::Guard<'_>, LockError> {
        let started = Instant::now();
        let mut warned = false;

        loop {
            if self.try_claim()? {
                tracing::trace!(path = %self.path.display(), "lock acquired");
                return Ok(FileLockGuard {
                    path: Some(self.path.clone()),
                });
            }

            let waited = started.elapsed();
            if let Some(timeout) = self.timeout {
                if waited >= timeout {
                    return Err(LockError::Timeout {
                        path: self.path.clone(),
                        waited,
                    });
                }
            }
            if !warned && waited >= self.stale_after {
                tracing::warn!(
                    path = %self.path.display(),
                    holder = %self.holder(),
                    waited_secs = waited.as_secs(),
                    "still waiting for lock; remove the marker by hand if its holder is gone"
                );
                warned = true;
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// Held [`FileLock`]. Dropping it removes the marker.
#[derive(Debug)]
pub struct FileLockGuard {
    path: Option<PathBuf>,
}

impl FileLockGuard {
    /// Release now and report a failure to remove the marker.
    pub fn release(mut self) -> Result<(), LockError> {
        match self.path.take() {
            Some(path) => fs::remove_file(&path).map_err(|source| LockError::Release { path, source }),
            None => Ok(()),
        }
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::error!(path = %path.display(), error = %e, "failed to remove lock marker");
            }
        }
    }
}
