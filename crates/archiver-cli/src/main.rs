mod cmd;
mod forwarder;
mod output;
mod settings;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "atarchiver",
    about = "AT archiver director: supervisory state machine, handshakes and heartbeats",
    version,
    propagate_version = true
)]
struct Cli {
    /// Config file (default: ./atarchiver.yaml if present, else built-in defaults)
    #[arg(long, global = true, env = "ATARCHIVER_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the director end to end against in-process peers
    Simulate {
        /// Number of exposures to drive through the handshakes
        #[arg(long, default_value = "3")]
        images: u32,

        /// Start a forwarder that never answers, to exercise fault handling
        #[arg(long)]
        silent_forwarder: bool,
    },

    /// Inspect and validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Simulate { .. } => tracing::Level::INFO,
        Commands::Config { .. } => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = settings::resolve_config(cli.config.as_deref());

    let result = match cli.command {
        Commands::Simulate {
            images,
            silent_forwarder,
        } => cmd::simulate::run(config_path.as_deref(), images, silent_forwarder, cli.json),
        Commands::Config { subcommand } => {
            cmd::config::run(config_path.as_deref(), subcommand, cli.json)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
