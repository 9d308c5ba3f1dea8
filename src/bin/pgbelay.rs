//! pgbelay CLI - bring up a containerized PostgreSQL instance.
//!
//! Configuration comes from environment variables (`DB_NAME`, `DB_USER`,
//! `DB_PASSWORD`, `DB_PORT`, `DB_DATA_DIR`, `DB_LOG_DIR`); flags override.
//! Exit code 0 on a fully converged instance, 1 on any fatal step.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pgbelay::{Bootstrap, Config, ReadinessPoller, readiness};

#[derive(Parser, Debug)]
#[command(
    name = "pgbelay",
    about = "Idempotently provision a PostgreSQL instance: init, configure, start, converge role and database"
)]
struct Args {
    /// Database name (overrides DB_NAME)
    #[arg(long)]
    database: Option<String>,

    /// Login role (overrides DB_USER)
    #[arg(long)]
    user: Option<String>,

    /// Role password (overrides DB_PASSWORD)
    #[arg(long)]
    password: Option<String>,

    /// Listen port (overrides DB_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Cluster data directory (overrides DB_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log and artifact directory (overrides DB_LOG_DIR)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Readiness poll attempts, spaced one second apart
    #[arg(long, default_value_t = readiness::DEFAULT_ATTEMPTS)]
    ready_attempts: u32,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Args::parse()).await {
        error!("bootstrap failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(database) = args.database {
        config.database = database;
    }
    if let Some(user) = args.user {
        config.user = user;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log_dir) = args.log_dir {
        config.log_dir = log_dir;
    }

    let bootstrap = Bootstrap::with_cli_adapters(config)?
        .with_poller(ReadinessPoller::new(args.ready_attempts, readiness::POLL_INTERVAL));
    bootstrap.run().await?;
    Ok(())
}
