//! Directory and file naming conventions shared by the dispatcher, the worker and reporting.
//!
//! Scratch and output directories carry the environment and test id so that concurrent workers for different
//! tests or different environments never write the same path.

use crate::status::Env;

/// First path component that marks a parameter value or output as living in the fixture tree.
pub const INPUTS_DIRNAME: &str = "inputs";

/// Directory beside each test definition that receives per-worker logs.
pub const LOGS_DIRNAME: &str = "logs";

/// File extension of test definitions.
pub const DEFINITION_EXTENSION: &str = "ini";

/// Variant label used when a tool only has one test.
pub const DEFAULT_VARIANT: &str = "default";

/// `Y-m-d H:M:S`, used in log lines and generated templates.
pub const PSEUDO_ISO_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// `YmdHMS`, used to make log file names unique.
pub const EXTRA_PSEUDO_ISO_FMT: &str = "%Y%m%d%H%M%S";

/// Log file name of a single test's worker.
pub fn single_test_logfile(run_id: i64, env: Env, test_id: &str) -> String {
    format!("{run_id:03}_{env}_{test_id}.log")
}

/// Staged copy of a test's inputs.
pub fn single_test_inputs(env: Env, test_id: &str) -> String {
    format!("inputs_{env}_{test_id}")
}

/// Materialized outputs of a test.
pub fn single_test_outputs(env: Env, test_id: &str) -> String {
    format!("outputs_{env}_{test_id}")
}

/// Log file name of one dispatcher pass.
pub fn run_logfile(run_id: i64, env: Env) -> String {
    format!("{run_id:03}_{env}.log")
}
