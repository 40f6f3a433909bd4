//! CLI module for toolcheck
//!
//! ## Commands
//!
//! - `run-one --path P --run-id N --env E` - Worker: run one test instance (exit 0 PASS, 1 FAIL, 2 error)
//! - `run-all --env E` - Dispatch the newest eligible queued batch for an environment
//! - `enqueue [--fails] [--start ISO]` - Queue every discovered test for every configured environment
//! - `create --env E` - Write templates for tools that have no test yet
//! - `tbnormalize` - Rename toolbox files and folders to their normalized names
//! - `report [--path FILE]` - Write the HTML report
//!
//! ## Design
//!
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;

use std::fmt;
use std::path::PathBuf;
use std::process;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use toolcheck_core::Env;

use crate::config::{ConfigError, DEFAULT_CONFIG_FILENAME, GeneralConfig};
use crate::version::TOOLCHECK_VERSION;

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
    /// A worker could not record a result
    pub const WORKER_ERROR: ExitCode = ExitCode(2);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::failure(format!("{:?}", miette::Report::new(err)))
    }
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Regression-test orchestration across a baseline and a target environment
#[derive(Parser, Debug)]
#[command(name = "toolcheck")]
#[command(version = TOOLCHECK_VERSION)]
#[command(about = "Run tool regression tests against baseline and target environments", long_about = None)]
pub struct Cli {
    /// Path to config.json
    #[arg(long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILENAME, global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a single test instance (started by `run-all`)
    RunOne {
        /// Path to the test definition (.ini)
        #[arg(long, value_name = "PATH")]
        path: PathBuf,
        /// Run id the instance belongs to
        #[arg(long)]
        run_id: i64,
        /// Environment to run in
        #[arg(long)]
        env: Env,
    },

    /// Run queued tests for one environment (run periodically, e.g. from cron)
    RunAll {
        #[arg(long)]
        env: Env,
    },

    /// Queue a new run of every test for every configured environment
    Enqueue {
        /// Only tests whose most recent result is FAIL
        #[arg(long)]
        fails: bool,
        /// Local date and time the run may start (default: now)
        #[arg(long, value_name = "ISO", value_parser = parse_local_start)]
        start: Option<DateTime<Utc>>,
    },

    /// Scan an environment's toolboxes and write test templates for new tools
    Create {
        #[arg(long)]
        env: Env,
    },

    /// Normalize toolbox folder and file names for all environments
    Tbnormalize,

    /// Write an HTML report of all runs and test instances
    Report {
        #[arg(long, value_name = "PATH", default_value = "report.html")]
        path: PathBuf,
    },
}

/// Parse `--start` as local time. An explicit offset is honored as given.
fn parse_local_start(text: &str) -> Result<DateTime<Utc>, String> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| format!("'{text}' is not an ISO date or date-time"))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|ts| ts.with_timezone(&Utc))
        .ok_or_else(|| format!("'{text}' does not exist in the local time zone"))
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let cli = Cli::parse();

    match execute(cli) {
        Ok(exit_code) => {
            if exit_code.0 != 0 {
                process::exit(exit_code.0);
            }
        }
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{}", e.message);
            }
            process::exit(e.exit_code.0);
        }
    }
}

/// Execute the CLI command and return result.
fn execute(cli: Cli) -> CliResult<ExitCode> {
    let config = GeneralConfig::load(&cli.config)?;

    match cli.command {
        Command::RunOne { path, run_id, env } => commands::run_one(&config, &path, run_id, env),
        Command::RunAll { env } => commands::run_all(&config, env),
        Command::Enqueue { fails, start } => commands::enqueue(&config, fails, start.unwrap_or_else(Utc::now)),
        Command::Create { env } => commands::create(&config, env),
        Command::Tbnormalize => commands::normalize(&config),
        Command::Report { path } => commands::report(&config, &path),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run_one() {
        let cli = Cli::try_parse_from([
            "toolcheck",
            "run-one",
            "--path",
            "tests/a.Buffer.default/a.Buffer.default.ini",
            "--run-id",
            "7",
            "--env",
            "target",
        ])
        .unwrap();
        match cli.command {
            Command::RunOne { run_id, env, .. } => {
                assert_eq!(run_id, 7);
                assert_eq!(env, Env::Target);
            }
            other => panic!("Expected RunOne, got {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILENAME));
    }

    #[test]
    fn test_cli_rejects_unknown_env() {
        assert!(Cli::try_parse_from(["toolcheck", "run-all", "--env", "staging"]).is_err());
    }

    #[test]
    fn test_cli_parse_enqueue() {
        let cli = Cli::try_parse_from(["toolcheck", "enqueue", "--fails"]).unwrap();
        assert!(matches!(cli.command, Command::Enqueue { fails: true, start: None }));

        let cli = Cli::try_parse_from(["toolcheck", "enqueue", "--start", "2024-05-01T22:00:00"]).unwrap();
        assert!(matches!(cli.command, Command::Enqueue { start: Some(_), .. }));
    }

    #[test]
    fn test_cli_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["toolcheck", "report", "--config", "/srv/vt/config.json"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/srv/vt/config.json"));
        assert!(matches!(cli.command, Command::Report { ref path } if path == &PathBuf::from("report.html")));
    }

    #[test]
    fn test_parse_local_start_formats() {
        let with_offset = parse_local_start("2024-05-01T22:00:00+02:00").unwrap();
        assert_eq!(with_offset.to_rfc3339(), "2024-05-01T20:00:00+00:00");

        let local = parse_local_start("2024-05-01 22:00").unwrap();
        let expected = Local
            .with_ymd_and_hms(2024, 5, 1, 22, 0, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(local, expected);

        assert!(parse_local_start("2024-05-01").is_ok());
        assert!(parse_local_start("tomorrow").is_err());
    }
}
