//! Data model and on-disk conventions shared by every toolcheck component.
//!
//! This crate holds the vocabulary that the store, the worker pipeline and the dispatcher must agree on:
//! environment and status names, test ids, scratch/output directory names, and the test-definition text format.
//!
//! ## Notes
//!
//! - **No IO**: nothing here touches the filesystem, spawns processes or reads the clock. Callers pass in text,
//!   paths and timestamps.
//! - The textual forms of [`Env`], [`Status`] and [`RunResult`] are the exact values persisted in the result store.

pub mod definition;
pub mod model;
pub mod naming;
pub mod status;

pub use definition::DefinitionError;
pub use model::{EscapingOutput, Parameter, TestDefinition, normalize_toolbox_name, test_id};
pub use status::{Env, ParseEnumError, RunResult, Status, TransitionError};
