//! espota CLI - OTA update server for ESP8266 devices

use anyhow::Result;
use clap::{Parser, Subcommand};
use espota_cli::{config, logging};
use std::net::SocketAddr;
use std::path::PathBuf;

mod cmd;

/// espota - firmware update server for ESP8266httpUpdate clients
#[derive(Parser)]
#[command(name = "espota")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: ./espota.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data root, overrides storage.root
    #[arg(long, global = true)]
    data: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve device check-ins and the admin API
    Serve {
        /// Listen address, overrides server.listen
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Keep everything in memory instead of the data root
        #[arg(long)]
        memory: bool,
        /// Seed the memory store, one application per device
        #[arg(long = "device", value_name = "MAC=FILE", requires = "memory")]
        devices: Vec<String>,
        /// Do not record device info or request logs
        #[arg(long)]
        no_audit: bool,
    },
    /// Manage applications and their binaries
    #[command(subcommand)]
    App(AppCommands),
    /// Manage device assignments
    #[command(subcommand)]
    Device(DeviceCommands),
    /// Show configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum AppCommands {
    /// Create an application (no-op if it exists)
    Create {
        name: String,
    },
    /// Upload a firmware binary to an application
    Upload {
        app: String,
        file: PathBuf,
        /// Binary name (default: the file name); `.bin` is appended if missing
        #[arg(long)]
        name: Option<String>,
        /// Make it the active binary right away
        #[arg(long)]
        activate: bool,
    },
    /// Make a binary the one devices of the application receive
    Activate {
        app: String,
        binary: String,
    },
    /// List applications and binaries
    List,
}

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Point a device at an application
    Assign {
        /// Station MAC, e.g. 18:FE:AA:AA:AA:AA
        mac: String,
        app: String,
    },
    /// List known devices
    List,
    /// Show a device's latest info and recent check-ins
    Show {
        mac: String,
        /// Number of check-ins to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print an example config file
    Example,
    /// Print the per-user config file location
    Path {
        /// Write the example there if no file exists
        #[arg(long)]
        create: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, source) = config::load(cli.config.as_deref())?;
    if let Some(root) = cli.data {
        config.storage.root = root;
    }

    let _log_guard = logging::init(&config.logging)?;

    match cli.command {
        Commands::Serve {
            listen,
            memory,
            devices,
            no_audit,
        } => cmd::serve::run(&config, listen, memory, !no_audit, &devices).await,
        Commands::App(command) => cmd::app::run(&config, command).await,
        Commands::Device(command) => cmd::device::run(&config, command).await,
        Commands::Config(command) => match command {
            ConfigCommands::Show => cmd::config::run_show(&config, source.as_deref()),
            ConfigCommands::Example => cmd::config::run_example(),
            ConfigCommands::Path { create } => cmd::config::run_path(create),
        },
    }
}
