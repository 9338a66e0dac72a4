//! Tessera CLI.
//!
//! - `tessera start` - Start the broker
//! - `tessera check-config` - Validate a configuration file
//! - `tessera permit` - Evaluate the permission matcher

mod args;
pub mod commands;

pub use args::{CheckConfigArgs, Cli, Commands, PermitArgs, StartArgs};
