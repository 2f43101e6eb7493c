//! docsearch CLI - Main entry point

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};

use docsearch::{Config, Status, commands};

/// Output format for configuration dumps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// YAML output
    #[default]
    Yaml,
    /// JSON output
    Json,
}

#[derive(Parser)]
#[command(name = "docsearch")]
#[command(version, about = "docsearch - Zero-downtime documentation search reindexing")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Path to configuration file (YAML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reindex every source into a fresh index generation
    Reindex,

    /// Repair index aliases left behind by an interrupted reindex
    Recover,

    /// Serve the admin endpoint (GET|POST /reindex) until Ctrl-C
    Serve,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current effective configuration
    Show {
        /// Output format
        #[arg(long, default_value = "yaml")]
        format: OutputFormat,
    },

    /// Initialize a default configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.debug {
        EnvFilter::from_default_env().add_directive("docsearch=debug".parse()?)
    } else {
        EnvFilter::from_default_env().add_directive("docsearch=info".parse()?)
    };

    fmt().with_env_filter(filter).with_target(false).init();

    // `config init` must work before any configuration exists
    if let Commands::Config {
        action: ConfigAction::Init { output, force },
    } = &cli.command
    {
        let path = commands::config_init(output.clone(), *force)?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::from_env()?
    };

    // Execute command
    match cli.command {
        Commands::Reindex => {
            let status = commands::reindex(&config).await?;
            if matches!(status, Status::Critical | Status::Unstable) {
                anyhow::bail!("reindexing finished with status {status}");
            }
        }
        Commands::Recover => {
            commands::recover(&config).await?;
        }
        Commands::Serve => {
            commands::serve(&config).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show { format } => {
                commands::config_show(&config, format == OutputFormat::Json)?;
            }
            ConfigAction::Init { .. } => {}
        },
    }

    Ok(())
}
