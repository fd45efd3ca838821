use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use odm::cli::commands::{self, HashOptions};
use odm::cli::console::spawn_console;
use odm::core::{NotificationSink, Orchestrator, TracingSink};
use odm::{adapters, config, context, logging};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "odm")]
#[command(about = "Clone one disk image onto many removable drives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use simulated drives instead of real hardware
    #[arg(long, global = true)]
    simulation: bool,

    /// Config file (default /etc/odm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch for drives and run clone jobs; reads commands from stdin
    Daemon(ServerArgs),
    /// List removable drives
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// SHA-1 and SHA-256 of a file or a byte range of it
    Hash {
        file: PathBuf,
        #[arg(long)]
        offset: Option<u64>,
        #[arg(long)]
        length: Option<u64>,
        /// Hash one MBR partition of an image (1-4)
        #[arg(long, conflicts_with_all = ["offset", "length"])]
        partition: Option<u8>,
        /// Compare against a known SHA-1 or SHA-256 value
        #[arg(long)]
        expect: Option<String>,
    },
    /// Show the partition table of an image
    Partitions { image: PathBuf },
    /// Read a drive back into an image file
    Backup {
        /// Disk identity, device node or volume name
        #[arg(long)]
        device: String,
        #[arg(long)]
        output: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Args, Serialize, Default)]
struct ServerArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    image: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    tool_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    max_concurrent: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    auto_clone_on_insert: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    slot_count: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

/// Command-line values layered over file and environment configuration.
#[derive(Serialize)]
struct Overrides<'a> {
    #[serde(flatten)]
    server: Option<&'a ServerArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    simulation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_logs: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = Overrides {
        server: match &cli.command {
            Commands::Daemon(args) => Some(args),
            _ => None,
        },
        simulation: cli.simulation.then_some(true),
        verbose: cli.verbose.then_some(true),
        json_logs: cli.json_logs.then_some(true),
    };
    let config = config::AppConfig::new(cli.config.as_deref(), Some(&overrides))
        .context("Failed to load configuration")?;
    logging::init(logging::LogConfig::from(&config));

    let ctx = context::AppContext::new(config);
    let sink: Arc<dyn NotificationSink> = Arc::new(TracingSink);

    match cli.command {
        Commands::Daemon(_) => run_daemon(ctx, sink).await.context("Daemon failed")?,
        Commands::Devices { json } => {
            let (source, _simulator) = adapters::get_source(ctx.config.simulation);
            commands::devices(source.as_ref(), json)?
        }
        Commands::Hash {
            file,
            offset,
            length,
            partition,
            expect,
        } => {
            let options = HashOptions {
                file,
                offset,
                length,
                partition,
                expect,
            };
            commands::hash(&ctx, options, sink).await?;
        }
        Commands::Partitions { image } => commands::partitions(&image)?,
        Commands::Backup { device, output } => {
            let (source, _simulator) = adapters::get_source(ctx.config.simulation);
            commands::backup(&ctx, source.as_ref(), &device, &output, sink).await?;
        }
        Commands::Config => commands::config(&ctx)?,
    }

    Ok(())
}

async fn run_daemon(ctx: context::AppContext, sink: Arc<dyn NotificationSink>) -> Result<()> {
    let (source, simulator) = adapters::get_source(ctx.config.simulation);

    let (tx, rx) = mpsc::channel(16);
    spawn_console(std::io::BufReader::new(std::io::stdin()), tx).context("Failed to start console")?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping all jobs");
            signal_token.cancel();
        }
    });

    Orchestrator::new(ctx, source, sink, simulator)
        .run(rx, shutdown)
        .await
}
