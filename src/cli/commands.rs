//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use toolcheck_core::naming::PSEUDO_ISO_FMT;
use toolcheck_core::Env;
use toolcheck_store::format_timestamp;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use super::{CliError, CliResult, ExitCode};
use crate::catalog::{create_new_tests, find_tests, normalize_toolboxes};
use crate::config::GeneralConfig;
use crate::dispatcher::{Dispatcher, ProcessWorkerLauncher};
use crate::logging::{GENERAL_LOGFILE, LogSession};
use crate::pipeline::Pipeline;
use crate::report::render_report;
use crate::tool::CommandToolRuntime;

fn failure(err: impl Display) -> CliError {
    CliError::failure(err.to_string())
}

/// Console half of every log session.
fn console() -> BoxMakeWriter {
    BoxMakeWriter::new(io::stderr)
}

/// `<logs_dir>/general.log`, shared by every non-worker command.
fn general_log(config: &GeneralConfig) -> CliResult<LogSession> {
    let path = config.logs_dir.join(GENERAL_LOGFILE);
    LogSession::start(&path, false, console())
        .map_err(|e| CliError::failure(format!("cannot open log {}: {e}", path.display())))
}

// ============================================================================
// Worker
// ============================================================================

/// Run one instance. The exit code tells the dispatcher what happened.
pub fn run_one(config: &GeneralConfig, path: &Path, run_id: i64, env: Env) -> CliResult<ExitCode> {
    let worker_error = |message: String| CliError::new(message, ExitCode::WORKER_ERROR);

    let path = std::path::absolute(path).map_err(|e| worker_error(format!("{}: {e}", path.display())))?;
    let launcher = config.launcher(env).map_err(|e| worker_error(e.to_string()))?;
    let runtime = CommandToolRuntime::new(launcher.clone());
    let store = config.open_store();
    let pipeline = Pipeline::new(&store, &runtime, config.toolbox_root(env));

    match pipeline.run_single_test(&path, run_id, env, console()) {
        Ok(result) if result.is_pass() => Ok(ExitCode::SUCCESS),
        Ok(_) => Ok(ExitCode::FAILURE),
        Err(e) => Err(worker_error(format!("{} (run {run_id}, {env}): {e}", path.display()))),
    }
}

// ============================================================================
// Scheduling
// ============================================================================

pub fn run_all(config: &GeneralConfig, env: Env) -> CliResult<ExitCode> {
    config.launcher(env)?;
    let _log = general_log(config)?;
    tracing::debug!("START CMD_RUN_ALL");

    let store = config.open_store();
    let launcher = ProcessWorkerLauncher::current_exe(config.source.clone())
        .map_err(|e| CliError::failure(format!("cannot locate the toolcheck executable: {e}")))?;
    let dispatcher = Dispatcher::new(&store, &launcher, config.tests_dir.clone(), config.logs_dir.clone())
        .with_parallel_workers(config.parallel_workers);

    if let Some((run_id, summary)) = dispatcher.run_pending(env, console()).map_err(failure)? {
        tracing::info!(
            run_id,
            passed = summary.passed,
            failed = summary.failed,
            launch_errors = summary.launch_errors,
            "run finished for {env}"
        );
    }

    tracing::debug!("END CMD_RUN_ALL");
    Ok(ExitCode::SUCCESS)
}

pub fn enqueue(config: &GeneralConfig, only_prior_failures: bool, start: DateTime<Utc>) -> CliResult<ExitCode> {
    let _log = general_log(config)?;
    tracing::debug!("START CMD_ENQUEUE");

    let ids: Vec<String> = find_tests(&config.tests_dir)
        .map_err(failure)?
        .into_iter()
        .map(|test| test.id)
        .collect();
    let envs = config.envs();
    tracing::info!("Found {} tests", ids.len());
    tracing::info!(
        "Found {} environments: {}",
        envs.len(),
        envs.iter().map(|e| e.as_str()).collect::<Vec<_>>().join(", ")
    );
    tracing::debug!(start = %format_timestamp(start), only_prior_failures);

    let store = config.open_store();
    match store.enqueue_run(&ids, &envs, only_prior_failures, start).map_err(failure)? {
        Some(run) => tracing::info!("Queued {} tests for run {}", run.test_ids.len(), run.run_id),
        None => tracing::info!("Queued 0 tests"),
    }

    tracing::debug!("END CMD_ENQUEUE");
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Catalog maintenance
// ============================================================================

pub fn create(config: &GeneralConfig, env: Env) -> CliResult<ExitCode> {
    let runtime = CommandToolRuntime::new(config.launcher(env)?.clone());
    let _log = general_log(config)?;
    tracing::debug!("START CMD_CREATE");

    let scan_dir = config.toolbox_root(env);
    tracing::info!("Scanning {}", scan_dir.display());
    let generated_at = Local::now().format(PSEUDO_ISO_FMT).to_string();
    let created = create_new_tests(&runtime, &scan_dir, &config.tests_dir, &generated_at).map_err(failure)?;
    tracing::info!("Created {created} new tests");

    tracing::debug!("END CMD_CREATE");
    Ok(ExitCode::SUCCESS)
}

pub fn normalize(config: &GeneralConfig) -> CliResult<ExitCode> {
    let _log = general_log(config)?;
    tracing::debug!("START CMD_TBNORMALIZE");

    for env in config.envs() {
        let root = config.toolbox_root(env);
        tracing::info!("Normalizing {env}");
        tracing::info!("Root: {}", root.display());
        for (old, new) in normalize_toolboxes(&root).map_err(failure)? {
            let old = old.strip_prefix(&root).unwrap_or(&old);
            let new = new.strip_prefix(&root).unwrap_or(&new);
            tracing::info!("{} -> {}", old.display(), new.display());
        }
    }

    tracing::debug!("END CMD_TBNORMALIZE");
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Reporting
// ============================================================================

pub fn report(config: &GeneralConfig, path: &Path) -> CliResult<ExitCode> {
    let snapshot = config.open_store().fetch_all().map_err(failure)?;
    fs::write(path, render_report(&snapshot))
        .map_err(|e| CliError::failure(format!("cannot write report {}: {e}", path.display())))?;
    println!(
        "wrote {} ({} runs, {} instances)",
        path.display(),
        snapshot.runs.len(),
        snapshot.instances.len()
    );
    Ok(ExitCode::SUCCESS)
}
