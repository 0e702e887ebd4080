//! Process entry point: launches either the master (listener + dispatcher)
//! or one worker, per §6.2's spawn contract. Reads config the way
//! `sem_os_server`'s binary reads its env vars, but through
//! `caldav_sched_types::ServerConfig::load` so master and worker agree on
//! one source of truth.

mod master;
mod worker;

use clap::{Parser, Subcommand};

use caldav_sched_types::ServerConfig;

#[derive(Parser)]
#[command(name = "caldav-server")]
struct Cli {
    /// Path to the YAML configuration file (§6.5's knobs).
    #[arg(long, default_value = "caldav-server.yaml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run as the master process: accept connections, dispatch fds to workers.
    Master {
        #[arg(long, default_value_t = 4)]
        workers: u32,
    },
    /// Run as one worker: read fd 3 until exit.
    Worker {
        #[arg(long)]
        worker_id: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caldav_server=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    match cli.role {
        Role::Master { workers } => master::run(config, workers).await,
        Role::Worker { worker_id } => worker::run(config, worker_id).await,
    }
}
