//! Operator surfaces: the daemon's stdin console and the one-shot subcommands.

pub mod commands;
pub mod console;
