use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::OutputFormat;

#[derive(Parser)]
#[command(name = "segbackup")]
#[command(about = "Parallel backup and restore for segment-based MPP databases", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backup operation
    Backup {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Report format: text, json or yaml
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a restore operation
    Restore {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Plan the restore and report what would run without touching the target
        #[arg(long)]
        dry_run: bool,

        /// Report format: text, json or yaml
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List available backups
    List {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Specific backup ID to show details for
        #[arg(short, long)]
        backup_id: Option<String>,
    },

    /// Validate a backup's integrity
    Validate {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Backup ID to validate
        #[arg(short, long)]
        backup_id: String,

        /// Decompress every data chunk and check its row count
        #[arg(long, default_value = "false")]
        deep: bool,
    },

    /// Show the manifest of a backup
    Describe {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Backup ID to describe
        #[arg(short, long)]
        backup_id: String,

        /// Output format: text, json or yaml
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: RUST_LOG env var > verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Backup { config, format } => {
            commands::backup::run(&config, OutputFormat::from(format.as_str())).await?;
        }
        Commands::Restore {
            config,
            dry_run,
            format,
        } => {
            commands::restore::run(&config, dry_run, OutputFormat::from(format.as_str())).await?;
        }
        Commands::List { path, backup_id } => {
            commands::list::run(&path, backup_id.as_deref()).await?;
        }
        Commands::Validate {
            path,
            backup_id,
            deep,
        } => {
            commands::validate::run(&path, &backup_id, deep).await?;
        }
        Commands::Describe {
            path,
            backup_id,
            format,
        } => {
            commands::describe::run(&path, &backup_id, OutputFormat::from(format.as_str())).await?;
        }
    }

    Ok(())
}
