//! Quokka mail server
//!
//! Usage:
//!   quokka config create            # write a default config.toml
//!   quokka serve -c config.toml     # start the configured listeners
//!
//! Runs until interrupted with Ctrl-C, then closes every listener and lets
//! open sessions finish.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quokka::{Config, DEFAULT_CONFIG_FILE, Quokka};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "quokka")]
#[command(about = "Modern, self-hosted mail server", version)]
struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse the configuration file and start the server(s)
    Serve {
        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Create a new configuration file with default settings
    Create {
        /// Where to write the file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the Argon2 hash to use as an auth user's password-hash
    HashPassword {
        password: String,
    },

    /// Parse and validate a configuration file
    Check {
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli.command).await {
        eprintln!("error: {e:#}");
        eprintln!("See 'quokka --help' for usage.");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { config } => serve(config).await,
        Commands::Config { command } => match command {
            ConfigCommands::Create { output, force } => {
                Config::default().write_to(&output, force)?;
                println!("Created {}", output.display());
                Ok(())
            }
            ConfigCommands::HashPassword { password } => {
                println!("{}", quokka_smtp::hash_password(&password)?);
                Ok(())
            }
            ConfigCommands::Check { config } => {
                Config::load(&config)?;
                println!("{} is valid", config.display());
                Ok(())
            }
        },
    }
}

async fn serve(path: PathBuf) -> Result<()> {
    let config = Config::load(&path)?;
    info!(config = %path.display(), domain = %config.domain, "Quokka starting...");

    let app = Quokka::start(&config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt signal")?;
    info!("got an interrupt signal");

    app.shutdown().await;
    Ok(())
}
