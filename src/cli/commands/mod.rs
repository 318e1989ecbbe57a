//! Command implementations for the CLI.

pub mod config;
pub mod scan;
pub mod watch;
