//! Per-session log files.
//!
//! Every command (and every worker) writes its own log file: DEBUG and above go to the file, INFO and above
//! (or whatever `RUST_LOG` selects) are mirrored to a console writer chosen by the caller. A session installs its
//! subscriber as the thread's default for as long as the [`LogSession`] lives.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Local};
use toolcheck_core::naming::{EXTRA_PSEUDO_ISO_FMT, PSEUDO_ISO_FMT};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::{self, MakeWriter, time::ChronoLocal};
use tracing_subscriber::prelude::*;

/// Log file name of general (non-run) commands.
pub const GENERAL_LOGFILE: &str = "general.log";

/// `dir/name.log` becomes `dir/name_<YYYYmmddHHMMSS>.log`.
pub fn timestamped(path: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let tag = now.format(EXTRA_PSEUDO_ISO_FMT);
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_{tag}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{tag}"),
    };
    path.with_file_name(file_name)
}

fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn timer() -> ChronoLocal {
    ChronoLocal::new(PSEUDO_ISO_FMT.to_string())
}

/// An installed file + console subscriber. Dropping it restores the previous default.
#[must_use = "the session's subscriber is uninstalled when it is dropped"]
pub struct LogSession {
    path: PathBuf,
    _guard: tracing::subscriber::DefaultGuard,
}

impl LogSession {
    /// Open (append) `path`, optionally timestamping its name, and install the session on this thread.
    pub fn start<W>(path: &Path, add_timestamp: bool, console: W) -> io::Result<Self>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let path = if add_timestamp {
            timestamped(path, Local::now())
        } else {
            path.to_path_buf()
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let file_layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
            .with_timer(timer())
            .with_filter(LevelFilter::DEBUG);
        let console_layer = fmt::layer()
            .with_writer(console)
            .with_target(false)
            .with_timer(timer())
            .with_filter(console_filter());

        let subscriber = tracing_subscriber::registry().with(file_layer).with(console_layer);
        let guard = tracing::subscriber::set_default(subscriber);

        Ok(Self { path, _guard: guard })
    }

    /// The log file actually written, including any timestamp.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
