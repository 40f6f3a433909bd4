//! `config.json` loading and validation.
//!
//! ```json
//! {
//!   "environments": {
//!     "baseline": "C:/envs/baseline/run-tool.exe",
//!     "target": { "launcher": "/opt/target/bin/run-tool", "args": ["--quiet"] }
//!   },
//!   "root_dir": "/srv/versiontesting",
//!   "toolboxes_dir": "toolboxes",
//!   "tests_dir": "tests",
//!   "logs_dir": "logs",
//!   "database": "results.sqlite",
//!   "parallel_workers": 1,
//!   "lock_timeout_secs": null
//! }
//! ```
//!
//! Relative directories resolve against `root_dir`, which itself resolves against the config file's directory
//! (and defaults to it).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use toolcheck_core::Env;
use toolcheck_store::ResultStore;

pub const DEFAULT_CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("cannot read config {}", .path.display())]
    #[diagnostic(
        code(toolcheck::config::read),
        help("run from the directory holding config.json or pass --config <path>")
    )]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}", .path.display())]
    #[diagnostic(code(toolcheck::config::parse))]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown environment '{name}'")]
    #[diagnostic(
        code(toolcheck::config::environment),
        help("environment keys must be `baseline` or `target`")
    )]
    UnknownEnvironment { name: String },

    #[error("no environments configured")]
    #[diagnostic(code(toolcheck::config::environment), help("add a launcher under `environments`"))]
    NoEnvironments,

    #[error("environment {0} is not configured")]
    #[diagnostic(code(toolcheck::config::environment), help("add a launcher for it under `environments`"))]
    MissingEnvironment(Env),

    #[error("parallel_workers must be at least 1")]
    #[diagnostic(code(toolcheck::config::workers))]
    ZeroWorkers,
}

/// How an environment's launcher is written in the file: a bare path or a path with arguments.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawLauncher {
    Program(PathBuf),
    WithArgs {
        launcher: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    environments: BTreeMap<String, RawLauncher>,
    #[serde(default)]
    root_dir: Option<PathBuf>,
    #[serde(default = "default_toolboxes_dir")]
    toolboxes_dir: PathBuf,
    #[serde(default = "default_tests_dir")]
    tests_dir: PathBuf,
    #[serde(default = "default_logs_dir")]
    logs_dir: PathBuf,
    #[serde(default = "default_database")]
    database: PathBuf,
    #[serde(default = "default_parallel_workers")]
    parallel_workers: usize,
    #[serde(default)]
    lock_timeout_secs: Option<u64>,
}

fn default_toolboxes_dir() -> PathBuf {
    PathBuf::from("toolboxes")
}

fn default_tests_dir() -> PathBuf {
    PathBuf::from("tests")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_database() -> PathBuf {
    PathBuf::from("results.sqlite")
}

fn default_parallel_workers() -> usize {
    1
}

/// The executable (plus leading arguments) that hosts tool invocations for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Validated configuration with every path resolved.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub environments: BTreeMap<Env, Launcher>,
    pub root_dir: PathBuf,
    pub toolboxes_dir: PathBuf,
    pub tests_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub database: PathBuf,
    pub parallel_workers: usize,
    pub lock_timeout: Option<Duration>,
    /// File this configuration was read from, forwarded to worker processes
    pub source: Option<PathBuf>,
}

impl GeneralConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut config = Self::from_json(&text, &base).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate config text; relative paths resolve against `base_dir`.
    pub fn from_json(text: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<memory>"),
            source,
        })?;

        if raw.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }
        if raw.parallel_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        let mut environments = BTreeMap::new();
        for (name, launcher) in raw.environments {
            let env = name
                .parse::<Env>()
                .map_err(|_| ConfigError::UnknownEnvironment { name: name.clone() })?;
            let launcher = match launcher {
                RawLauncher::Program(program) => Launcher {
                    program,
                    args: Vec::new(),
                },
                RawLauncher::WithArgs { launcher, args } => Launcher {
                    program: launcher,
                    args,
                },
            };
            environments.insert(env, launcher);
        }

        let root_dir = match raw.root_dir {
            Some(root) => base_dir.join(root),
            None => base_dir.to_path_buf(),
        };

        Ok(Self {
            environments,
            toolboxes_dir: root_dir.join(raw.toolboxes_dir),
            tests_dir: root_dir.join(raw.tests_dir),
            logs_dir: root_dir.join(raw.logs_dir),
            database: root_dir.join(raw.database),
            root_dir,
            parallel_workers: raw.parallel_workers,
            lock_timeout: raw.lock_timeout_secs.map(Duration::from_secs),
            source: None,
        })
    }

    pub fn launcher(&self, env: Env) -> Result<&Launcher, ConfigError> {
        self.environments.get(&env).ok_or(ConfigError::MissingEnvironment(env))
    }

    /// Configured environments in stable order.
    pub fn envs(&self) -> Vec<Env> {
        self.environments.keys().copied().collect()
    }

    /// `<toolboxes_dir>/<env>`
    pub fn toolbox_root(&self, env: Env) -> PathBuf {
        self.toolboxes_dir.join(env.as_str())
    }

    pub fn open_store(&self) -> ResultStore {
        ResultStore::open_with_timeout(&self.database, self.lock_timeout)
    }
}
