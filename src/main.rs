//! Tessera - unified CLI entrypoint.
//!
//! Usage:
//!   tessera start --config config/tessera.toml
//!   tessera check-config --config config/tessera.toml
//!   tessera permit 'PUBLISH:%p/%c/#' 'PUBLISH:p1/dev1/temp' --partition p1 --client-id dev1

use anyhow::Result;
use clap::Parser;
use tessera::cli::commands::{run_check_config, run_permit, run_start};
use tessera::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::CheckConfig(args) => run_check_config(args),
        Commands::Permit(args) => run_permit(args),
    }
}
