//! Execution of one test instance inside a worker process.
//!
//! ## Steps
//!
//! 1. Open the per-test log and mark the instance `running`.
//! 2. Parse the definition and check that `inputs/` beside it has something in it.
//! 3. Stage `inputs/` into `inputs_{env}_{id}` under the scratch root (system temp when `run_local`, else the
//!    definition's directory).
//! 4. Rewrite `inputs/...` parameter values into the staged copy and invoke the tool with its diagnostics captured.
//! 5. Copy declared outputs into `outputs_{env}_{id}` beside the definition.
//! 6. Mark the instance `complete` with `PASS`, or `FAIL` if any step above failed.
//!
//! Test failures never leave this module as errors: they are logged and recorded as `FAIL`. Only store and
//! log-file errors propagate.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::any::Any;
use std::env;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use toolcheck_core::model::parameter_map;
use toolcheck_core::naming::{
    INPUTS_DIRNAME, LOGS_DIRNAME, single_test_inputs, single_test_logfile, single_test_outputs,
};
use toolcheck_core::{DefinitionError, Env, RunResult, Status, TestDefinition, definition};
use toolcheck_store::{FileLock, Lock, ResultStore, StoreError};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::capture::{DiagnosticChannels, OutputCapture};
use crate::fsutil::{copy_tree, dir_has_entries, remove_tree};
use crate::logging::LogSession;
use crate::tool::{ToolError, ToolRuntime};

/// Which half of the pipeline a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Before the tool ran
    Setup,
    /// While running the tool or collecting its outputs
    Execution,
}

/// Why a test instance is recorded as `FAIL`.
#[derive(Debug, Error)]
pub enum TestFailure {
    #[error("cannot read definition {}: {source}", .path.display())]
    DefinitionRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("No inputs in {}", .dir.display())]
    NoInputs { dir: PathBuf },

    #[error("cannot stage inputs into {}: {source}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("tool invocation failed: {0}")]
    ToolInvocationFailed(#[source] ToolError),

    #[error("tool panicked: {0}")]
    ToolPanicked(String),

    #[error("declared output {} {reason}", .path.display())]
    MalformedOutput { path: PathBuf, reason: &'static str },

    #[error("cannot copy output {} to {}: {source}", .from.display(), .to.display())]
    Materialize {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TestFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            TestFailure::DefinitionRead { .. }
            | TestFailure::Definition(_)
            | TestFailure::NoInputs { .. }
            | TestFailure::Staging { .. } => FailureClass::Setup,
            TestFailure::ToolInvocationFailed(_)
            | TestFailure::ToolPanicked(_)
            | TestFailure::MalformedOutput { .. }
            | TestFailure::Materialize { .. } => FailureClass::Execution,
        }
    }
}

/// Errors that abort the worker without a recorded result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot open test log {}: {source}", .path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} does not name a test definition", .0.display())]
    BadPath(PathBuf),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn materialize_err(from: &Path, to: &Path) -> impl FnOnce(io::Error) -> TestFailure {
    let (from, to) = (from.to_path_buf(), to.to_path_buf());
    move |source| TestFailure::Materialize { from, to, source }
}

/// Paths one execution works with.
struct Layout {
    inputs: PathBuf,
    staged: PathBuf,
    outputs: PathBuf,
    toolbox: PathBuf,
}

/// Runs single test instances against one environment's tool runtime.
pub struct Pipeline<'a, R: ToolRuntime + ?Sized, L: Lock = FileLock> {
    store: &'a ResultStore<L>,
    runtime: &'a R,
    channels: DiagnosticChannels,
    toolbox_root: PathBuf,
    scratch_root: PathBuf,
}

impl<'a, R: ToolRuntime + ?Sized, L: Lock> Pipeline<'a, R, L> {
    /// `toolbox_root` is `<toolboxes_dir>/<env>`; definitions' toolbox paths resolve against it.
    pub fn new(store: &'a ResultStore<L>, runtime: &'a R, toolbox_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            runtime,
            channels: DiagnosticChannels::default(),
            toolbox_root: toolbox_root.into(),
            scratch_root: env::temp_dir(),
        }
    }

    /// Slot the tool reports through. Errors still reach its sink while the log captures everything else.
    pub fn with_channels(mut self, channels: DiagnosticChannels) -> Self {
        self.channels = channels;
        self
    }

    /// Where `run_local` tests are staged. Defaults to the system temp directory.
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    /// Run the definition at `definition_path` as instance `(run_id, env, <file stem>)`.
    ///
    /// Returns the recorded result. The log goes to `<definition dir>/logs/`, with INFO and above mirrored to
    /// `console`.
    pub fn run_single_test(
        &self,
        definition_path: &Path,
        run_id: i64,
        env: Env,
        console: BoxMakeWriter,
    ) -> Result<RunResult, PipelineError> {
        let test_id = definition_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::BadPath(definition_path.to_path_buf()))?;
        let test_dir = definition_path.parent().unwrap_or_else(|| Path::new(""));

        let log_path = test_dir.join(LOGS_DIRNAME).join(single_test_logfile(run_id, env, &test_id));
        let session = LogSession::start(&log_path, true, console).map_err(|source| PipelineError::Log {
            path: log_path.clone(),
            source,
        })?;
        tracing::debug!(run_id, env = %env, log = %session.path().display(), "worker started");

        self.store.update_status(run_id, env, &test_id, Status::Running, None, None)?;

        let result = match self.execute(definition_path, test_dir, &test_id, env) {
            Ok(()) => {
                tracing::info!("test finished");
                RunResult::Pass
            }
            Err(failure) => {
                tracing::error!(class = ?failure.class(), "FAIL: {failure}");
                RunResult::Fail
            }
        };

        self.store
            .update_status(run_id, env, &test_id, Status::Complete, Some(result), None)?;
        Ok(result)
    }

    fn execute(&self, definition_path: &Path, test_dir: &Path, test_id: &str, env: Env) -> Result<(), TestFailure> {
        let text = fs::read_to_string(definition_path).map_err(|source| TestFailure::DefinitionRead {
            path: definition_path.to_path_buf(),
            source,
        })?;
        let test = definition::parse(&text)?;

        let scratch_parent = if test.run_local { self.scratch_root.as_path() } else { test_dir };
        let layout = Layout {
            inputs: test_dir.join(INPUTS_DIRNAME),
            staged: scratch_parent.join(single_test_inputs(env, test_id)),
            outputs: test_dir.join(single_test_outputs(env, test_id)),
            toolbox: self.toolbox_root.join(&test.toolbox),
        };

        tracing::info!("Test:        {test_id}");
        tracing::info!("Toolbox:     {}", test.toolbox);
        tracing::info!("Alias:       {}", test.alias);
        tracing::info!("Description: {}", test.description);
        tracing::info!("Run Local:   {}", test.run_local);
        tracing::debug!(toolbox = %layout.toolbox.display(), inputs = %layout.inputs.display(),
            staged = %layout.staged.display(), outputs = %layout.outputs.display(), "paths");

        if !dir_has_entries(&layout.inputs) {
            return Err(TestFailure::NoInputs { dir: layout.inputs });
        }

        tracing::info!("copying inputs to scratch directory");
        copy_tree(&layout.inputs, &layout.staged).map_err(|source| TestFailure::Staging {
            path: layout.staged.clone(),
            source,
        })?;

        self.invoke(&test, &layout)?;
        self.materialize(&test, &layout)
    }

    fn invoke(&self, test: &TestDefinition, layout: &Layout) -> Result<(), TestFailure> {
        let params = parameter_map(&test.resolve_inputs(&layout.staged));
        tracing::debug!(?params, "resolved parameters");

        let started = Instant::now();
        tracing::info!("running...");
        tracing::debug!("--- start tool output ---");
        let outcome = {
            let _capture = OutputCapture::begin(&self.channels);
            panic::catch_unwind(AssertUnwindSafe(|| {
                self.runtime.invoke(&layout.toolbox, &test.alias, &params, &self.channels)
            }))
        };
        tracing::debug!("---  end tool output  ---");

        match outcome {
            Ok(Ok(())) => {
                tracing::info!("took {:.3?}", started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => Err(TestFailure::ToolInvocationFailed(e)),
            Err(payload) => Err(TestFailure::ToolPanicked(panic_message(payload.as_ref()))),
        }
    }

    fn materialize(&self, test: &TestDefinition, layout: &Layout) -> Result<(), TestFailure> {
        let transfers = test
            .resolve_outputs(&layout.staged, &layout.outputs)
            .map_err(|e| TestFailure::MalformedOutput {
                path: PathBuf::from(e.output),
                reason: "leaves the test directory",
            })?;
        remove_tree(&layout.outputs).map_err(materialize_err(&layout.staged, &layout.outputs))?;
        if transfers.is_empty() {
            tracing::info!("saving no outputs");
            return Ok(());
        }

        tracing::info!("copying expected outputs to output directory");
        for (i, (src, dst)) in transfers.iter().enumerate() {
            tracing::debug!(src = %src.display(), dst = %dst.display(), "output {i}");
            if src.is_file() {
                if let Some(parent) = dst.parent() {
                    fs::create_dir_all(parent).map_err(materialize_err(src, dst))?;
                }
                fs::copy(src, dst).map_err(materialize_err(src, dst))?;
            } else if src.is_dir() {
                copy_tree(src, dst).map_err(materialize_err(src, dst))?;
            } else {
                return Err(TestFailure::MalformedOutput {
                    path: src.clone(),
                    reason: "is neither a file nor a directory",
                });
            }
        }
        Ok(())
    }
}
