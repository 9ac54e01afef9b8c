use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use uplift::config::UpliftConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "uplift")]
#[command(version, about = "Modernize a repository's outdated code and open a pull request")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Path to the config file (defaults to .uplift/uplift.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP control surface and the progress WebSocket
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,
    },
    /// Run one update in-process and print its progress
    Update {
        /// Repository clone URL
        repository: String,

        /// Repository owner (inferred from GitHub URLs)
        #[arg(long)]
        owner: Option<String>,

        /// Repository name (inferred from GitHub URLs)
        #[arg(long)]
        name: Option<String>,

        /// Open the pull request in a browser when done
        #[arg(long)]
        open: bool,
    },
    /// Show recorded runs, or the events of one run
    History {
        /// Run id to show events for
        #[arg(long)]
        run: Option<String>,

        /// Maximum number of runs to list
        #[arg(long, default_value = "20")]
        limit: i64,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Create the config file and database
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = UpliftConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let _log_guard = uplift::logging::init_logging(
        cli.verbose,
        cli.log_json || config.logging.json,
        config.logging.dir.as_deref(),
    )?;

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            config.server.dev_mode |= dev;
            cmd::cmd_serve(config).await?;
        }
        Commands::Update {
            repository,
            owner,
            name,
            open,
        } => {
            cmd::cmd_update(&config, repository, owner, name, open).await?;
        }
        Commands::History { run, limit, db_path } => {
            let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
            cmd::cmd_history(&db_path, run.as_deref(), limit)?;
        }
        Commands::Init { db_path } => {
            let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
            cmd::cmd_init(&config, &db_path)?;
        }
        Commands::Config => cmd::cmd_config(&config, cli.config.as_deref())?,
    }

    Ok(())
}
