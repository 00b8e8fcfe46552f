use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{LevelFilter, debug};

mod config;
mod indicator;
mod machine;
mod manager;
mod messages;
mod mqtt;
mod ports;
mod registry;
mod server;
mod signal;
mod topics;

#[derive(Parser, Debug)]
#[command(version, about = "Device identity handshake over MQTT")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Default log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Join the bus, obtain an identity and publish heartbeats
    Device,
    /// Assign identities to devices and acknowledge their heartbeats
    Server,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    pretty_env_logger::formatted_timed_builder()
        .filter_level(cli.log_level)
        .parse_default_env()
        .init();

    let config = config::AppConfig::load(&cli.config)?;
    debug!("Configuration: {:?}", config);

    match cli.command.unwrap_or(Command::Device) {
        Command::Device => manager::Manager::new(&config)?.run_loop().await,
        Command::Server => server::run(&config).await,
    }
}
