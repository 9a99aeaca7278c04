//! Subcommand implementations.

pub mod build;
pub mod publish;
pub mod run;
