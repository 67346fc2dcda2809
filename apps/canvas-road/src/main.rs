use anyhow::Result;
use clap::Parser;
use tracing::info;

use canvas_road::cli::run_watch;
use canvas_road::config::{Cli, Commands, ServerConfig};
use canvas_road::server;
use canvas_road::telemetry::Telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Watch(args)) = cli.command {
        return run_watch(args).await;
    }

    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        max_active_regions = config.max_active_regions,
        hibernate_after_secs = config.hibernate_after.as_secs(),
        "starting canvas-road server"
    );

    server::run(config, telemetry.metrics_handle()).await
}
