//! Command-line interface for srmd.
//!
//! Provides commands for running the engine, migrating its database and
//! inspecting stored jobs and configuration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, JobFilter};
