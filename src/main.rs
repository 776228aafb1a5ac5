use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use shipyard::config::{CONFIG_FILE_NAME, NamespaceBackendKind};

mod cmd;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(version, about = "Namespace, test and deploy orchestration over WebSocket sessions")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file (defaults to ./shipyard.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the WebSocket session server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,

        /// Namespace backend: local, docker
        #[arg(long)]
        namespace_backend: Option<NamespaceBackendKind>,
    },
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default shipyard.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let config_path = cli.config_path();
    match &cli.command {
        Commands::Serve {
            host,
            port,
            dev,
            namespace_backend,
        } => {
            cmd::cmd_serve(
                &config_path,
                cmd::ServeOverrides {
                    host: host.clone(),
                    port: *port,
                    dev: *dev,
                    namespace_backend: *namespace_backend,
                },
                cli.verbose,
            )
            .await?;
        }
        Commands::Config { command } => cmd::cmd_config(&config_path, command.clone())?,
    }

    Ok(())
}
