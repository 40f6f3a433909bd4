//! Tool invocation boundary.
//!
//! The harness never loads tools itself. Each environment has a launcher executable that hosts the tool runtime
//! for that installation, and [`CommandToolRuntime`] talks to it over argv and standard streams:
//!
//! - `<launcher> [args] invoke <toolbox> <alias> name=value ...`: run a tool. Each stdout line is a message
//!   (a `WARNING:` prefix makes it a warning), each stderr line is an error. A non-zero exit is a failure.
//! - `<launcher> [args] list <toolbox>`: one tool alias per line.
//! - `<launcher> [args] describe <toolbox> <alias>`: JSON array of
//!   `{"name", "value", "display_name", "data_type"}` objects.

use std::collections::BTreeMap;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;

use serde::Deserialize;
use thiserror::Error;
use toolcheck_core::Parameter;

use crate::capture::{Channel, DiagnosticChannels};
use crate::config::Launcher;

const WARNING_PREFIX: &str = "WARNING:";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("cannot start launcher {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{what} exited with {status}: {message}")]
    Failed {
        what: String,
        status: String,
        message: String,
    },

    #[error("unexpected launcher output for {what}: {reason}")]
    Protocol { what: String, reason: String },

    #[error("I/O error talking to launcher: {0}")]
    Io(#[from] io::Error),
}

/// Runs tools and answers questions about toolboxes.
pub trait ToolRuntime {
    /// Run `alias` from `toolbox` with named arguments, reporting diagnostics through `channels`.
    fn invoke(
        &self,
        toolbox: &Path,
        alias: &str,
        params: &BTreeMap<String, String>,
        channels: &DiagnosticChannels,
    ) -> Result<(), ToolError>;

    /// Aliases of every tool in `toolbox`.
    fn list_tools(&self, toolbox: &Path) -> Result<Vec<String>, ToolError>;

    /// Parameters of one tool, with their default values.
    fn describe_parameters(&self, toolbox: &Path, alias: &str) -> Result<Vec<Parameter>, ToolError>;
}

/// [`ToolRuntime`] backed by an environment's launcher executable.
#[derive(Debug, Clone)]
pub struct CommandToolRuntime {
    launcher: Launcher,
}

#[derive(Debug, Deserialize)]
struct DescribedParameter {
    name: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    data_type: String,
}

fn classify_stdout(line: &str) -> (Channel, String) {
    match line.strip_prefix(WARNING_PREFIX) {
        Some(rest) => (Channel::Warning, rest.trim_start().to_string()),
        None => (Channel::Message, line.to_string()),
    }
}

/// Forward every line of `reader` until EOF. Invalid UTF-8 is replaced rather than ending the stream.
fn forward_lines(reader: impl Read, tx: Sender<(Channel, String)>, is_stderr: bool) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                let item = if is_stderr {
                    (Channel::Error, line.to_string())
                } else {
                    classify_stdout(line)
                };
                if tx.send(item).is_err() {
                    break;
                }
            }
        }
    }
}

impl CommandToolRuntime {
    pub fn new(launcher: Launcher) -> Self {
        Self { launcher }
    }

    fn command(&self, verb: &str) -> Command {
        let mut cmd = Command::new(&self.launcher.program);
        cmd.args(&self.launcher.args).arg(verb);
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.launcher.program.clone(),
            source,
        }
    }

    fn checked_output(&self, what: String, mut cmd: Command) -> Result<Output, ToolError> {
        let output = cmd.stdin(Stdio::null()).output().map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Failed {
                what,
                status: output.status.to_string(),
                message: stderr.lines().last().unwrap_or("no error output").to_string(),
            });
        }
        Ok(output)
    }
}

impl ToolRuntime for CommandToolRuntime {
    fn invoke(
        &self,
        toolbox: &Path,
        alias: &str,
        params: &BTreeMap<String, String>,
        channels: &DiagnosticChannels,
    ) -> Result<(), ToolError> {
        let mut cmd = self.command("invoke");
        cmd.arg(toolbox)
            .arg(alias)
            .args(params.iter().map(|(name, value)| format!("{name}={value}")))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        tracing::debug!(launcher = %self.launcher.program.display(), alias, "starting tool");
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let (tx, rx) = mpsc::channel();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut last_error = None;

        // Lines are emitted on this thread so the caller's thread-local log session receives them.
        thread::scope(|scope| {
            if let Some(out) = stdout {
                let tx = tx.clone();
                scope.spawn(move || forward_lines(out, tx, false));
            }
            if let Some(err) = stderr {
                let tx = tx.clone();
                scope.spawn(move || forward_lines(err, tx, true));
            }
            drop(tx);

            for (channel, line) in rx {
                if channel == Channel::Error {
                    last_error = Some(line.clone());
                }
                channels.emit(channel, &line);
            }
        });

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                what: alias.to_string(),
                status: status.to_string(),
                message: last_error.unwrap_or_else(|| "no error output".to_string()),
            })
        }
    }

    fn list_tools(&self, toolbox: &Path) -> Result<Vec<String>, ToolError> {
        let mut cmd = self.command("list");
        cmd.arg(toolbox);
        let output = self.checked_output(format!("list {}", toolbox.display()), cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn describe_parameters(&self, toolbox: &Path, alias: &str) -> Result<Vec<Parameter>, ToolError> {
        let mut cmd = self.command("describe");
        cmd.arg(toolbox).arg(alias);
        let what = format!("describe {alias}");
        let output = self.checked_output(what.clone(), cmd)?;
        let described: Vec<DescribedParameter> = serde_json::from_slice(&output.stdout).map_err(|e| {
            ToolError::Protocol {
                what,
                reason: e.to_string(),
            }
        })?;
        Ok(described
            .into_iter()
            .map(|p| Parameter::new(p.name, p.value.unwrap_or_default()).with_metadata(p.display_name, p.data_type))
            .collect())
    }
}
