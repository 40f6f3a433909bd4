//! Durable run queue and result store for toolcheck.
//!
//! [`ResultStore`] keeps runs and test instances in a SQLite file and serializes every access through a
//! [`Lock`], by default a [`FileLock`] marker beside the database.

pub mod lock;
pub mod store;

pub use lock::{FileLock, FileLockGuard, Lock, LockError};
pub use store::{
    DequeuedBatch, EnqueuedRun, InstanceRecord, LOCK_FILENAME, ResultStore, RunRecord, Snapshot, StoreError,
    format_timestamp,
};
