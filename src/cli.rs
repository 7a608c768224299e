use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use iroh::EndpointId;

use crate::core::config::ArenaConfig;
use crate::engine::runner::{self, HostOptions, HostRunner};
use crate::engine::sim::{SimOptions, Simulation};

#[derive(Parser)]
#[command(name = "blastgrid")]
#[command(about = "Host-authoritative bomb arena simulation with peer replication")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host an arena and replicate it to connecting peers
    Host {
        /// JSON arena configuration (missing fields use defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fixed map seed
        #[arg(short, long)]
        seed: Option<u64>,

        /// Peers to wait for before the round starts
        #[arg(short, long, default_value_t = 1)]
        peers: usize,

        #[arg(long, default_value_t = 50)]
        tick_ms: u64,

        /// Length of the intro before the map opens
        #[arg(long, default_value_t = 3000)]
        intro_ms: u64,

        /// Let bots place bombs and pick up power-ups
        #[arg(long)]
        autoplay: bool,
    },
    /// Join a host and mirror its arena
    Join {
        /// Endpoint ID printed by the host
        peer: String,
    },
    /// Run a host and several mirrors in-process over a shuffling transport
    Simulate {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value_t = 0)]
        seed: u64,

        #[arg(short, long, default_value_t = 3)]
        mirrors: usize,

        #[arg(short, long, default_value_t = 600)]
        ticks: u32,
    },
}

fn load_config(path: Option<PathBuf>, seed: Option<u64>) -> Result<ArenaConfig> {
    let mut config = match path {
        Some(path) => ArenaConfig::from_json_file(path)?,
        None => ArenaConfig::default(),
    };
    if seed.is_some() {
        config.seed = seed;
    }
    config.validate()?;
    Ok(config)
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Host {
            config,
            seed,
            peers,
            tick_ms,
            intro_ms,
            autoplay,
        } => {
            if tick_ms == 0 {
                bail!("--tick-ms must be positive");
            }
            let config = load_config(config, seed)?;
            let options = HostOptions {
                min_peers: peers,
                tick: Duration::from_millis(tick_ms),
                intro: Duration::from_millis(intro_ms),
                autoplay,
            };
            HostRunner::new(config, options).await?.run().await?;
        }

        Commands::Join { peer } => {
            let host: EndpointId = peer.trim().parse()?;
            runner::run_client(host).await?;
        }

        Commands::Simulate {
            config,
            seed,
            mirrors,
            ticks,
        } => {
            let config = load_config(config, Some(seed))?;
            let options = SimOptions {
                seed,
                mirrors,
                ticks,
                late_join_tick: Some(ticks / 3),
                ..SimOptions::default()
            };
            let (report, sim) = Simulation::new(config, options)?.run()?;
            println!("{}", sim.host_grid());
            println!("{report:#?}");
            if !report.converged {
                bail!("mirrors diverged from the host");
            }
        }
    }

    Ok(())
}
