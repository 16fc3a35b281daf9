//! Lock-step peer node.
//!
//! Runs one two-player session over TCP. One side hosts, the other joins;
//! both must use the same seed and map.
//!
//! # Usage
//!
//! ```bash
//! # Player 0 waits for its peer
//! cargo run -p lockstep_node -- host --listen 127.0.0.1:7777 --seed 42
//!
//! # Player 1 connects
//! cargo run -p lockstep_node -- join --connect 127.0.0.1:7777 --seed 42
//! ```
//!
//! Logs go to stderr and are filtered with `RUST_LOG`.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lockstep_core::command::{MovableType, PlayerId, Tick};
use lockstep_core::config::LockstepConfig;
use lockstep_core::context::SimulationContext;
use lockstep_core::dispatcher::HeadlessUi;
use lockstep_core::error::CoreError;
use lockstep_core::grid::{GridPos, MapGrid};
use lockstep_core::persistence::FileSaveSink;
use lockstep_core::world::World;
use lockstep_net::{AsyncChannel, Channel, NetError, Session};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HOST_PLAYER: PlayerId = 0;
const JOIN_PLAYER: PlayerId = 1;

#[derive(Parser)]
#[command(name = "lockstep_node")]
#[command(about = "Run one lock-step peer over TCP")]
#[command(version)]
struct Cli {
    /// RON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured seed
    #[arg(short, long, global = true)]
    seed: Option<u64>,

    /// Stop after this tick
    #[arg(short, long, global = true)]
    ticks: Option<Tick>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for the peer and play as player 0
    Host {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7777")]
        listen: SocketAddr,
    },
    /// Connect to a host and play as player 1
    Join {
        /// Host address
        #[arg(short = 'a', long, default_value = "127.0.0.1:7777")]
        connect: SocketAddr,
    },
}

#[derive(Debug, Error)]
enum NodeError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %err, "Node failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), NodeError> {
    let mut config = match &cli.config {
        Some(path) => LockstepConfig::load(path)?,
        None => LockstepConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    config.player_count = 2;

    let (stream, peer) = match cli.command {
        Commands::Host { listen } => {
            config.local_player = HOST_PLAYER;
            let listener = TcpListener::bind(listen).await?;
            info!(addr = %listen, "Waiting for peer");
            let (stream, addr) = listener.accept().await?;
            info!(%addr, "Peer connected");
            (stream, JOIN_PLAYER)
        }
        Commands::Join { connect } => {
            config.local_player = JOIN_PLAYER;
            let stream = TcpStream::connect(connect).await?;
            info!(addr = %connect, "Connected to host");
            (stream, HOST_PLAYER)
        }
    };
    stream.set_nodelay(true)?;
    config.validate()?;

    let context = SimulationContext::new(
        &config,
        starting_world(&config),
        Box::new(HeadlessUi),
        Box::new(FileSaveSink::new(config.save_dir.clone())),
    )?;
    let (mut session, handle) = Session::new(context, config.local_player, config.seed);
    if let Some(ticks) = cli.ticks {
        session = session.stop_at(ticks);
    }
    session.add_peer(
        peer,
        AsyncChannel::new(Channel::new(stream, config.max_packet_len)),
    )?;

    let running = tokio::spawn(session.run());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            let _ = handle.shutdown();
        }
    });

    let summary = running
        .await
        .map_err(|err| NodeError::Io(std::io::Error::other(err)))??;
    info!(
        tick = summary.final_tick,
        hash = %format_args!("{:016x}", summary.state_hash),
        applied = summary.stats.applied,
        stale = summary.stats.stale,
        "Done"
    );
    Ok(())
}

/// Same open map and starting units on every peer.
fn starting_world(config: &LockstepConfig) -> World {
    let mut world = World::new(
        MapGrid::new(config.map_width, config.map_height),
        config.player_count,
    );
    let kinds = [
        MovableType::Bearer,
        MovableType::Bearer,
        MovableType::Pioneer,
        MovableType::Swordsman,
        MovableType::Bowman,
    ];
    for player in 0..config.player_count {
        let base = GridPos::new(4, 4 + i32::from(player) * 6);
        for (i, kind) in kinds.into_iter().enumerate() {
            world.spawn_movable(player, kind, base.offset(i as i32, 0));
        }
    }
    world
}
