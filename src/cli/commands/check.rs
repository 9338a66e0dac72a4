use crate::broker::BrokerSettings;
use crate::cli::args::CheckConfigArgs;
use crate::core::config::Config;
use anyhow::Result;

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    BrokerSettings::from_config(&config)?;
    println!(
        "{}: ok (node {} cluster {}, {} accounts)",
        args.config.display(),
        config.node.node_id,
        config.node.cluster,
        config.identity.accounts.len()
    );
    Ok(())
}
