//! Start command - launches the broker on the configured listener.

use crate::auth::StaticIdentity;
use crate::broker::{Broker, BrokerSettings};
use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::net::{ConnectionRouter, Listener};
use crate::ops::telemetry;
use crate::store::MemoryStore;
use anyhow::Result;
use std::env;
use std::sync::Arc;
use tracing::info;

pub async fn run_start(args: StartArgs) -> Result<()> {
    // Set config path via environment so Config::load_from_env picks it up
    env::set_var("TESSERA_CONFIG", args.config.display().to_string());

    let config = Config::load_from_env()?;
    config.validate()?;
    telemetry::init_tracing(config.telemetry.log_level.as_deref())?;

    let settings = BrokerSettings::from_config(&config)?;
    let router = Arc::new(ConnectionRouter::new(
        settings.node_id.clone(),
        settings.cluster.clone(),
    ));
    let broker = Arc::new(Broker::new(
        settings,
        Arc::new(MemoryStore::new()),
        Arc::new(StaticIdentity::from_config(&config.identity)),
        router.clone(),
    ));
    let listener = Listener::bind(&config.listener, broker, router).await?;
    info!(
        "tessera started node_id={} cluster={} bind={}",
        config.node.node_id,
        config.node.cluster,
        listener.local_addr()?
    );

    tokio::select! {
        res = listener.serve() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    }
}
