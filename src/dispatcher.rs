//! Periodic dispatch of queued test instances to isolated worker processes.
//!
//! One pass (`run-all --env <e>`, usually from cron) dequeues the newest eligible batch for an environment, starts
//! one worker per instance in discovery order, and cleans each instance's staged inputs after its worker exits,
//! whatever the outcome. Worker results are written by the workers themselves; the dispatcher only observes exit
//! codes.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use chrono::Utc;
use thiserror::Error;
use toolcheck_core::Env;
use toolcheck_core::naming::{run_logfile, single_test_inputs};
use toolcheck_store::{FileLock, Lock, ResultStore, StoreError};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::catalog::{CatalogError, DiscoveredTest, find_tests};
use crate::fsutil::remove_tree;
use crate::logging::LogSession;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("cannot open run log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Exit status of a finished worker. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// One instance to hand to a worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerRequest<'a> {
    pub definition_path: &'a Path,
    pub run_id: i64,
    pub env: Env,
}

/// Starts a worker for one instance and waits for it.
pub trait WorkerLauncher: Sync {
    fn launch(&self, request: &WorkerRequest<'_>) -> io::Result<WorkerExit>;
}

/// Re-executes a toolcheck binary as `run-one`.
#[derive(Debug, Clone)]
pub struct ProcessWorkerLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessWorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Launch workers with the currently running executable.
    pub fn current_exe(config: Option<PathBuf>) -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }

    fn command(&self, request: &WorkerRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("run-one")
            .arg("--path")
            .arg(request.definition_path)
            .arg("--run-id")
            .arg(request.run_id.to_string())
            .arg("--env")
            .arg(request.env.as_str());
        cmd
    }
}

impl WorkerLauncher for ProcessWorkerLauncher {
    fn launch(&self, request: &WorkerRequest<'_>) -> io::Result<WorkerExit> {
        let status = self.command(request).status()?;
        Ok(WorkerExit { code: status.code() })
    }
}

/// Counts for one batch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub dispatched: usize,
    /// Workers that exited 0 (test passed)
    pub passed: usize,
    /// Workers that exited non-zero or were killed
    pub failed: usize,
    /// Workers that could not be started
    pub launch_errors: usize,
    /// Batch ids with no definition on disk
    pub missing: Vec<String>,
}

enum Outcome {
    Passed,
    Failed,
    LaunchError,
}

pub struct Dispatcher<'a, W: WorkerLauncher, L: Lock = FileLock> {
    store: &'a ResultStore<L>,
    launcher: &'a W,
    tests_dir: PathBuf,
    logs_dir: PathBuf,
    scratch_root: PathBuf,
    parallel_workers: usize,
}

impl<'a, W: WorkerLauncher, L: Lock> Dispatcher<'a, W, L> {
    pub fn new(
        store: &'a ResultStore<L>,
        launcher: &'a W,
        tests_dir: impl Into<PathBuf>,
        logs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            launcher,
            tests_dir: tests_dir.into(),
            logs_dir: logs_dir.into(),
            scratch_root: std::env::temp_dir(),
            parallel_workers: 1,
        }
    }

    /// Must match the workers' scratch root so staged inputs can be cleaned up.
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    /// Number of workers alive at once. Values below 1 are treated as 1.
    pub fn with_parallel_workers(mut self, parallel_workers: usize) -> Self {
        self.parallel_workers = parallel_workers.max(1);
        self
    }

    /// One full pass for `env`: dequeue, run the batch, stamp the run's end time.
    ///
    /// Returns `None` when nothing was eligible. The batch logs to `<logs_dir>/{run_id:03}_{env}_<time>.log`.
    pub fn run_pending(&self, env: Env, console: BoxMakeWriter) -> Result<Option<(i64, BatchSummary)>, DispatchError> {
        let Some(batch) = self.store.dequeue(env)? else {
            tracing::info!("no queued tests eligible to run");
            return Ok(None);
        };
        tracing::info!("{} tests for {env} updated from queued to waiting", batch.test_ids.len());

        let summary = {
            let log_path = self.logs_dir.join(run_logfile(batch.run_id, env));
            let _session = LogSession::start(&log_path, true, console)
                .map_err(|source| DispatchError::Log { path: log_path, source })?;
            self.run_batch(env, batch.run_id, &batch.test_ids)?
        };

        self.store.set_run_end(batch.run_id, Utc::now())?;
        Ok(Some((batch.run_id, summary)))
    }

    /// Dispatch every discovered definition whose id is in `test_ids`.
    #[tracing::instrument(skip_all, fields(run_id = run_id, env = %env))]
    pub fn run_batch(&self, env: Env, run_id: i64, test_ids: &BTreeSet<String>) -> Result<BatchSummary, DispatchError> {
        tracing::info!("RUN ALL");
        tracing::debug!(tests_dir = %self.tests_dir.display(), workers = self.parallel_workers);

        let mut seen = BTreeSet::new();
        let mut selected = Vec::new();
        for test in find_tests(&self.tests_dir)? {
            if !test_ids.contains(&test.id) {
                continue;
            }
            if seen.insert(test.id.clone()) {
                selected.push(test);
            } else {
                tracing::warn!("skipping duplicate definition {} for {}", test.path.display(), test.id);
            }
        }
        let missing: Vec<String> = test_ids.difference(&seen).cloned().collect();
        for id in &missing {
            tracing::warn!("no definition found for queued test {id}");
        }
        tracing::info!("found {} tests to run", selected.len());

        let outcomes = if self.parallel_workers <= 1 || selected.len() <= 1 {
            selected
                .iter()
                .enumerate()
                .map(|(i, test)| dispatch_one(self.launcher, &self.scratch_root, &self.tests_dir, env, run_id, i, test))
                .collect()
        } else {
            self.dispatch_parallel(env, run_id, &selected)
        };

        let mut summary = BatchSummary {
            dispatched: selected.len(),
            missing,
            ..BatchSummary::default()
        };
        for outcome in outcomes {
            match outcome {
                Outcome::Passed => summary.passed += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::LaunchError => summary.launch_errors += 1,
            }
        }
        tracing::info!(
            passed = summary.passed,
            failed = summary.failed,
            launch_errors = summary.launch_errors,
            "FINISHED ALL"
        );
        Ok(summary)
    }

    /// Workers pull the next definition from a shared cursor, so start order is still discovery order.
    fn dispatch_parallel(&self, env: Env, run_id: i64, selected: &[DiscoveredTest]) -> Vec<Outcome> {
        let cursor = AtomicUsize::new(0);
        let outcomes = Mutex::new(Vec::with_capacity(selected.len()));
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let threads = self.parallel_workers.min(selected.len());
        let launcher = self.launcher;
        let (scratch_root, tests_dir) = (self.scratch_root.as_path(), self.tests_dir.as_path());

        thread::scope(|scope| {
            for _ in 0..threads {
                scope.spawn(|| {
                    tracing::dispatcher::with_default(&dispatch, || {
                        loop {
                            let i = cursor.fetch_add(1, Ordering::SeqCst);
                            let Some(test) = selected.get(i) else { break };
                            let outcome = dispatch_one(launcher, scratch_root, tests_dir, env, run_id, i, test);
                            outcomes
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner)
                                .push(outcome);
                        }
                    })
                });
            }
        });

        outcomes.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn dispatch_one<W: WorkerLauncher + ?Sized>(
    launcher: &W,
    scratch_root: &Path,
    tests_dir: &Path,
    env: Env,
    run_id: i64,
    index: usize,
    test: &DiscoveredTest,
) -> Outcome {
    let shown = test.path.strip_prefix(tests_dir).unwrap_or(&test.path);
    tracing::debug!("{index} RUN {}", shown.display());

    let request = WorkerRequest {
        definition_path: &test.path,
        run_id,
        env,
    };
    let outcome = match launcher.launch(&request) {
        Ok(exit) if exit.success() => Outcome::Passed,
        Ok(exit) => {
            match exit.code {
                Some(1) => tracing::info!("{} failed", test.id),
                Some(code) => {
                    tracing::warn!("worker for {} exited with {code}; its instance may still be running", test.id)
                }
                None => tracing::warn!("worker for {} was killed; its instance may still be running", test.id),
            }
            Outcome::Failed
        }
        Err(e) => {
            tracing::error!("cannot start worker for {}: {e}", test.id);
            Outcome::LaunchError
        }
    };

    let staged = single_test_inputs(env, &test.id);
    let test_dir = test.path.parent().unwrap_or(tests_dir);
    for parent in [test_dir, scratch_root] {
        let dir = parent.join(&staged);
        tracing::debug!("REMOVE {}", dir.display());
        if let Err(e) = remove_tree(&dir) {
            tracing::warn!("cannot remove {}: {e}", dir.display());
        }
    }
    outcome
}
