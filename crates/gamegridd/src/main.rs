//! gamegridd: the GameGrid daemon.
//!
//! Single binary around the VM pool orchestrator:
//! - `run`: idle reclaimer over the on-disk registry (redb)
//! - `simulate`: allocator, session binder, activity tracker and reclaimer
//!   end to end against the simulated provider
//! - `vms` / `sessions` / `check-config` / `init`: inspection and setup
//!
//! # Usage
//!
//! ```text
//! gamegridd run --config gamegrid.toml --data-dir /var/lib/gamegrid
//! gamegridd vms --data-dir /var/lib/gamegrid
//! gamegridd simulate --users 8
//! ```

mod daemon;
mod inspect;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,gamegridd=debug,gamegrid_scheduler=debug,gamegrid_reclaim=debug";

#[derive(Parser)]
#[command(name = "gamegridd", about = "GameGrid daemon: VM pool orchestrator for game sessions")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Reclaim idle VMs in the on-disk pool until Ctrl-C.
    Run {
        /// Path to gamegrid.toml (defaults apply when omitted).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the registry.
        #[arg(long, default_value = "/var/lib/gamegrid")]
        data_dir: PathBuf,

        /// Describe polls before a simulated VM reports ready.
        #[arg(long, default_value = "0")]
        boot_polls: u32,
    },

    /// Print VM records as JSON.
    Vms {
        #[arg(long, default_value = "/var/lib/gamegrid")]
        data_dir: PathBuf,
    },

    /// Print session records as JSON.
    Sessions {
        #[arg(long, default_value = "/var/lib/gamegrid")]
        data_dir: PathBuf,

        /// Only sessions that have not ended.
        #[arg(long)]
        active: bool,
    },

    /// Validate a configuration file and print the resolved settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },

    /// Write a starter configuration file.
    Init {
        #[arg(long, default_value = "gamegrid.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Start and end sessions against an in-memory pool, then reclaim it.
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Concurrent users to start sessions for.
        #[arg(long, default_value = "4")]
        users: usize,

        /// Game to start (defaults to the first catalog entry).
        #[arg(long)]
        game: Option<String>,

        /// How long sessions stay open, e.g. "250ms".
        #[arg(long, default_value = "100ms")]
        hold: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            boot_polls,
        } => daemon::run(config, data_dir, boot_polls).await,
        Command::Vms { data_dir } => inspect::vms(&data_dir),
        Command::Sessions { data_dir, active } => inspect::sessions(&data_dir, active),
        Command::CheckConfig { config } => inspect::check_config(&config),
        Command::Init { path, force } => inspect::init(&path, force),
        Command::Simulate {
            config,
            users,
            game,
            hold,
        } => simulate::run(config, users, game, &hold).await,
    }
}

/// Logs go to stderr so JSON printed on stdout stays machine-readable.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
