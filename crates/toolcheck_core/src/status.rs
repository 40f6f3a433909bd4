//! Environment, instance status and run result vocabularies.
//!
//! Each enum round-trips through the exact text stored in the result database, so
//! `as_str` / `FromStr` are the only conversions callers should use.
//!
//! ## Status state machine
//!
//! ```text
//! (absent) -> queued -> waiting -> running -> complete
//! ```
//!
//! Transitions only move forward one step at a time. Re-posting the current status is
//! allowed so that upserts stay idempotent.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Raised when stored or user-provided text does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// A forbidden status change at the storage boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal status transition {} -> {to}", .from.map(Status::as_str).unwrap_or("(absent)"))]
pub struct TransitionError {
    pub from: Option<Status>,
    pub to: Status,
}

/// One of the two side-by-side runtime installations being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Env {
    Baseline,
    Target,
}

impl Env {
    pub const ALL: [Env; 2] = [Env::Baseline, Env::Target];

    pub fn as_str(self) -> &'static str {
        match self {
            Env::Baseline => "baseline",
            Env::Target => "target",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Env {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(Env::Baseline),
            "target" => Ok(Env::Target),
            other => Err(ParseEnumError {
                kind: "environment",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle position of one test instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Queued,
    Waiting,
    Running,
    Complete,
}

impl Status {
    pub const ALL: [Status; 4] = [Status::Queued, Status::Waiting, Status::Running, Status::Complete];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Complete => "complete",
        }
    }

    /// The single status an instance may move to next, if any.
    pub fn successor(self) -> Option<Status> {
        match self {
            Status::Queued => Some(Status::Waiting),
            Status::Waiting => Some(Status::Running),
            Status::Running => Some(Status::Complete),
            Status::Complete => None,
        }
    }

    /// Check a write of `to` over a row currently at `from` (`None` = no row yet).
    pub fn check_transition(from: Option<Status>, to: Status) -> Result<(), TransitionError> {
        let allowed = match from {
            None => to == Status::Queued,
            Some(current) => current == to || current.successor() == Some(to),
        };
        if allowed { Ok(()) } else { Err(TransitionError { from, to }) }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "status",
                value: s.to_string(),
            })
    }
}

/// Coarse outcome of a finished execution. Failure detail lives in the per-test log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunResult {
    Pass,
    Fail,
}

impl RunResult {
    pub fn as_str(self) -> &'static str {
        match self {
            RunResult::Pass => "PASS",
            RunResult::Fail => "FAIL",
        }
    }

    pub fn is_pass(self) -> bool {
        self == RunResult::Pass
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunResult {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(RunResult::Pass),
            "FAIL" => Ok(RunResult::Fail),
            other => Err(ParseEnumError {
                kind: "run result",
                value: other.to_string(),
            }),
        }
    }
}
