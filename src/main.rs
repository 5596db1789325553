use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about = "Workspace runtime orchestrator")]
pub struct Cli {
    /// Log at debug level regardless of `[logging].level`
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, env = "BERTH_CONFIG", default_value = berth::config::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control API, agent relay, terminals and workspace proxy
    Serve {
        /// Address to listen on, overriding `[server].bind`
        #[arg(long)]
        bind: Option<String>,

        /// Enable dev mode (CORS permissive for a local frontend dev server)
        #[arg(long)]
        dev: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Agent token utilities
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default berth.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum TokenCommands {
    /// Print the digest to put under `[agent.tokens]`
    Hash { token: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { bind, dev } => {
            cmd::cmd_serve(&cli.config, bind.clone(), *dev, cli.verbose).await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::Token { command } => cmd::cmd_token(command.clone()),
    }

    Ok(())
}
