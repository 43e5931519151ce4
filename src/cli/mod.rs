//! Command-line interface definitions and helpers.
//!
//! This module contains CLI argument parsing, config overrides, and
//! subcommand handlers.

mod args;
mod commands;

pub use args::{parse_dimensions, Args, Command, ConfigAction};
pub use commands::handle_config_action;
