use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use gateway_core::paths::{ipc_socket_path, settings_path};
use gateway_core::GatewaySettings;
use gateway_service::host::GatewayHost;
use gateway_service::ipc::IpcServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Token gateway service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve gateway sessions over local IPC
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Write a default settings file
    InitConfig {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, socket } => run_command(config, socket).await,
        Commands::InitConfig { config, force } => init_config_command(config, force),
    }
}

fn init_logging(settings: &GatewaySettings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn init_config_command(config: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match config {
        Some(path) => path,
        None => settings_path()?,
    };
    if path.exists() && !force {
        return Err(anyhow!(
            "settings already exist at {} (use --force to overwrite)",
            path.display()
        ));
    }
    GatewaySettings::default().save(&path)?;
    println!("Settings written to {}", path.display());
    Ok(())
}

async fn run_command(config: Option<PathBuf>, socket: Option<PathBuf>) -> Result<()> {
    let path = match config {
        Some(path) => path,
        None => settings_path()?,
    };
    let settings = GatewaySettings::load(&path)?;
    init_logging(&settings);

    let socket_path = match socket.or_else(|| settings.socket_path.clone()) {
        Some(path) => path,
        None => ipc_socket_path()?,
    };
    let host = Arc::new(GatewayHost::from_settings(&settings)?);
    let server = Arc::new(IpcServer::new(host.clone(), socket_path));

    let mut server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };

    info!(settings = %path.display(), "service started");
    tokio::select! {
        res = signal::ctrl_c() => res?,
        res = &mut server_task => return res?,
    }
    info!(sessions = host.active_sessions(), "service stopping");
    server_task.abort();
    Ok(())
}
