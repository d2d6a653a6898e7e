//! usbscale-service - Background scale reader and HTTP API.
//!
//! Run with: `cargo run -p usbscale-service`

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use usbscale_core::{
    AcquisitionOptions, AcquisitionWorker, EventDispatcher, EventReceiver, ScaleEvent, ScaleState,
    UsbScale,
};
use usbscale_service::{ApiServer, AppState, Config};

mod service;

/// usbscale-service - Background scale reader and HTTP REST API.
#[derive(Parser, Debug)]
#[command(name = "usbscale-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API host (overrides config).
    #[arg(long, global = true)]
    host: Option<String>,

    /// API port (overrides config).
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Do not start the HTTP API (reader only).
    #[arg(long, global = true)]
    no_api: bool,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the service in the foreground (default behavior).
    Run,

    /// Manage the background service.
    Service {
        #[command(subcommand)]
        action: ServiceAction,

        /// Use a system-level service instead of a user-level one.
        #[arg(long, global = true)]
        system: bool,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ServiceAction {
    /// Install usbscale-service with the native service manager.
    Install,
    /// Uninstall the usbscale-service service.
    Uninstall,
    /// Start the installed service.
    Start,
    /// Stop the installed service.
    Stop,
    /// Check the status of the installed service.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Service { action, system }) => handle_service_action(action, system),
        Some(Command::Run) | None => run_service(args).await,
    }
}

fn handle_service_action(action: ServiceAction, system: bool) -> anyhow::Result<()> {
    let level = service::Level::from_system_flag(system);

    let (action_name, result) = match action {
        ServiceAction::Install => ("install", service::install(level)),
        ServiceAction::Uninstall => ("uninstall", service::uninstall(level)),
        ServiceAction::Start => ("start", service::start(level)),
        ServiceAction::Stop => ("stop", service::stop(level)),
        ServiceAction::Status => match service::status(level) {
            Ok(status) => {
                println!("usbscale-service is {}", status);
                return Ok(());
            }
            Err(e) => {
                eprintln!("Failed to get status: {}", e);
                return Err(e.into());
            }
        },
    };

    match result {
        Ok(()) => {
            println!("Successfully ran {} for usbscale-service", action_name);
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to {} service: {}", action_name, e);
            Err(e.into())
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new("usbscale_service=info,usbscale_core=info,tower_http=debug")
    })?;

    let file_layer = match log_file {
        Some(path) => {
            let file: File = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Falling back to default configuration: {}", e);
            Config::default()
        }),
    };

    if let Some(host) = &args.host {
        config.api.host = host.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    config.validate()?;
    Ok(config)
}

/// Log connection changes and errors as they happen.
async fn report_events(mut events: EventReceiver) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(ScaleEvent::ConnectionChanged {
                connected: true,
                label: Some(label),
                ..
            }) => {
                info!("Scale connected: {} ({})", label.name, label.connection.as_str());
            }
            Ok(ScaleEvent::ConnectionChanged {
                connected: true, ..
            }) => info!("Scale connected"),
            Ok(ScaleEvent::ConnectionChanged {
                connected: false,
                reason,
                ..
            }) => match reason {
                Some(reason) => info!("Scale disconnected: {:?}", reason),
                None => info!("Scale disconnected"),
            },
            Ok(ScaleEvent::ErrorOccurred { message }) => debug!("Scale: {}", message),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("Event reporter lagged, skipped {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_service(args: Args) -> anyhow::Result<()> {
    init_logging(args.log_file.as_deref())?;

    let config = load_config(&args)?;

    if let Some(enabled) = config.application.autostart_at_login
        && let Err(e) = service::sync_autostart(enabled)
    {
        warn!("Could not update login autostart: {}", e);
    }

    let scale = ScaleState::new();
    let events = EventDispatcher::default();
    let reporter = tokio::spawn(report_events(events.subscribe()));

    let acquisition = AcquisitionWorker::spawn(
        UsbScale::new(),
        scale.clone(),
        events.clone(),
        AcquisitionOptions::default(),
    )?;

    let serve_api = config.api.autostart && !args.no_api;
    let api_url = config.api.url();
    let state = AppState::new(scale, config);
    let mut server = ApiServer::new(state);

    if serve_api {
        if let Err(e) = server.start().await {
            error!("Failed to start API server at {}: {}", api_url, e);
        }
    } else {
        info!("HTTP API disabled");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    acquisition.shutdown().await;
    server.stop().await;
    drop(events);
    reporter.abort();

    Ok(())
}
