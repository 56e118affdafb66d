mod commands;
mod prompt;

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use vaultsync_config::{AppConfig, TelemetryConfig};

use crate::commands::Session;

#[derive(Debug, Parser)]
#[command(
    name = "vaultsync",
    version,
    about = "Keep a markdown checklist in sync with the note on disk"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "config/vaultsync.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pick a note (or a vault directory) and remember it.
    Open {
        path: PathBuf,
    },
    /// Print the checklist.
    Show {
        path: Option<PathBuf>,
    },
    /// Flip the completion flag of item N.
    Toggle {
        position: usize,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Append an item.
    Add {
        text: String,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Delete item N.
    Remove {
        position: usize,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Replace the text of item N.
    Edit {
        position: usize,
        text: String,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Follow external changes until Ctrl-C.
    Watch {
        path: Option<PathBuf>,
    },
    /// List checklist items across every note in the vault.
    Scan {
        root: Option<PathBuf>,
        /// Only unfinished items.
        #[arg(long)]
        open: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show the stored handle slots.
    Handles,
}

/// Stderr always; a daily-rotated file too when `telemetry.log_dir` is set.
/// `RUST_LOG` wins over `telemetry.log_level`.
fn init_tracing(telemetry: &TelemetryConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    let (file_layer, guard) = if telemetry.log_dir.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(&telemetry.log_dir, "vaultsync.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_ansi(false).with_writer(writer)),
            Some(guard),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config.telemetry);

    let session = Session::new(config);
    match cli.command {
        Commands::Open { path } => session.open(path).await?,
        Commands::Show { path } => session.show(path).await?,
        Commands::Toggle { position, file } => {
            session
                .mutate(file, |doc| commands::toggle(doc, position))
                .await?
        }
        Commands::Add { text, file } => {
            session.mutate(file, |doc| commands::add(doc, &text)).await?
        }
        Commands::Remove { position, file } => {
            session
                .mutate(file, |doc| commands::remove(doc, position))
                .await?
        }
        Commands::Edit {
            position,
            text,
            file,
        } => {
            session
                .mutate(file, |doc| commands::rename(doc, position, &text))
                .await?
        }
        Commands::Watch { path } => session.watch(path).await?,
        Commands::Scan { root, open, json } => session.scan(root, open, json).await?,
        Commands::Handles => session.handles().await?,
    }
    Ok(())
}
