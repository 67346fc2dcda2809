use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::time::Duration;

use crate::region::{RegionKey, MAX_ACTIVE_REGIONS};
use crate::registry::RoomSettings;

#[derive(Debug, Parser)]
#[command(
    name = "canvas-road",
    author,
    version,
    about = "Room server for the shared infinite text canvas"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Subscribe to regions of a room and print every envelope received
    Watch(WatchArgs),
}

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Server base URL (e.g., ws://localhost:8080)
    #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
    pub url: String,

    /// Room to join
    #[arg(short, long)]
    pub room: String,

    /// Region to subscribe to, as <col>-<row>; repeat for more
    #[arg(long = "region", required = true, value_parser = RegionKey::parse, allow_hyphen_values = true)]
    pub regions: Vec<RegionKey>,

    /// Stop after this many envelopes
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "CANVAS_ROAD_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Redis connection URI for region content. Without it content is kept
    /// in memory (development mode).
    #[arg(long, env = "CANVAS_ROAD_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Maximum number of regions one connection may subscribe to.
    #[arg(long, env = "CANVAS_ROAD_MAX_ACTIVE_REGIONS", default_value_t = MAX_ACTIVE_REGIONS)]
    pub max_active_regions: usize,

    /// Idle time before a room's in-memory state is dropped.
    #[arg(long, env = "CANVAS_ROAD_HIBERNATE_AFTER_SECS", default_value_t = 30)]
    pub hibernate_after_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "CANVAS_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub redis_url: Option<String>,
    pub max_active_regions: usize,
    pub hibernate_after: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_active_regions: self.max_active_regions,
            hibernate_after: self.hibernate_after,
        }
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.max_active_regions == 0 {
            bail!("max active regions must be at least 1");
        }
        if args.hibernate_after_secs == 0 {
            bail!("hibernate-after must be at least one second");
        }
        let redis_url = args.redis_url.filter(|url| !url.trim().is_empty());
        Ok(ServerConfig {
            listen_addr,
            redis_url,
            max_active_regions: args.max_active_regions,
            hibernate_after: Duration::from_secs(args.hibernate_after_secs),
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
