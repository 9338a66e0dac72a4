//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tessera - multi-tenant MQTT 3.1/3.1.1 broker.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(version)]
#[command(about = "Tessera MQTT broker and permission tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Load and validate a configuration file
    CheckConfig(CheckConfigArgs),

    /// Evaluate a granted permission against a required one
    Permit(PermitArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tessera.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct CheckConfigArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tessera.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct PermitArgs {
    /// Granted permission, e.g. `PUBLISH:%p/%c/#`
    pub granted: String,

    /// Required permission, e.g. `PUBLISH:p1/dev1/temp`
    pub required: String,

    #[arg(long, default_value = "default")]
    pub partition: String,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long, default_value = "")]
    pub client_id: String,

    /// Compare segments case-sensitively
    #[arg(long)]
    pub case_sensitive: bool,
}
