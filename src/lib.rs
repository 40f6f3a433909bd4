#![forbid(unsafe_code)]
//! toolcheck: regression testing of tools across two runtime installations
//!
//! Tests are queued in a SQLite result store, dispatched per environment to isolated worker processes, and each
//! worker runs one tool against a staged copy of its fixture, recording `PASS` or `FAIL`.
//!
//! The pure data model and definition format live in `toolcheck_core`; the lock and result store in
//! `toolcheck_store`. This crate holds everything that touches processes, the filesystem or the terminal.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` and `pipeline` modules
//!   enforce `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Tool panics**: a panic inside a [`tool::ToolRuntime`] is caught by the pipeline and recorded as `FAIL`.

pub mod capture;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod fsutil;
pub mod logging;
pub mod pipeline;
pub mod report;
pub mod tool;
pub mod version;

pub use capture::{Channel, DiagnosticChannels, DiagnosticSink, OutputCapture};
pub use config::GeneralConfig;
pub use dispatcher::{BatchSummary, Dispatcher, ProcessWorkerLauncher, WorkerExit, WorkerLauncher, WorkerRequest};
pub use pipeline::{Pipeline, TestFailure};
pub use tool::{CommandToolRuntime, ToolError, ToolRuntime};
