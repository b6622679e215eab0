use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use thiserror::Error;

mod commands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] siphon_core::ConfigError),
    #[error("download error: {0}")]
    Download(#[from] siphon_core::DownloadError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Siphon download pipeline control interface", long_about = None)]
pub struct Cli {
    /// Path to the main siphon.toml
    #[arg(long, default_value = "config/siphon.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download one or more URLs and wait for them to finish
    Fetch(FetchArgs),
    /// Configuration inspection
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,
    /// Destination directory override
    #[arg(long)]
    pub dest: Option<PathBuf>,
    /// Concurrency limit override
    #[arg(long)]
    pub limit: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Parse the config file and print the effective settings
    Check,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Fetch(args) => commands::fetch::run(&cli, args).await,
        Commands::Config(ConfigCommands::Check) => commands::config::check(&cli),
        Commands::Completions(args) => {
            let mut command = Cli::command();
            clap_complete::generate(
                args.shell,
                &mut command,
                "siphonctl",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}
