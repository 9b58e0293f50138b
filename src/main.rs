use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use prefab::config::ServerConfig;
use prefab::server;

#[derive(Parser)]
#[command(name = "prefab")]
#[command(version, about = "Prompt-to-application generation server")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Base directory holding `.prefab/` (config and database)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the generation API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "prefab=debug" } else { "prefab=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, dev } => {
            let base_dir = cli.base_dir.unwrap_or_else(|| PathBuf::from("."));
            let mut config = ServerConfig::load(&base_dir)?;
            if let Some(port) = port {
                config.port = port;
            }
            if dev {
                config.dev_mode = true;
            }
            server::start_server(config).await
        }
    }
}
