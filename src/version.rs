//! toolcheck version information.
//!
//! The value is taken from Cargo metadata (`CARGO_PKG_VERSION`) at compile time. Prefer this constant over
//! repeating `env!("CARGO_PKG_VERSION")` so every subcommand reports the same version.

/// The toolcheck version string (for example, `0.3.0`).
pub const TOOLCHECK_VERSION: &str = env!("CARGO_PKG_VERSION");
