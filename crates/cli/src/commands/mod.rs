//! Subcommands.

pub mod devices;
pub mod run;
pub mod validate;
