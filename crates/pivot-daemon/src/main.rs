//! Pivot Agent - Main entry point
//!
//! Serves the SSH agent protocol with keys held on PIV tokens.

use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pivot_daemon::device::yubikey::YubiKeyBackend;
use pivot_daemon::{
    AgentServer, CommandNotifier, DaemonConfig, DeviceRegistry, DeviceSelector, LogNotifier,
    NotificationSink, PinentryBroker, PivAgent, TouchWatchdog,
};

#[derive(Debug, Parser)]
#[command(name = "pivot-agent", version, about = "SSH agent for keys held on PIV tokens")]
struct Args {
    /// Configuration file (defaults to $PIVOT_CONFIG, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket path (or pipe name) to listen on
    #[arg(short = 'l', long)]
    listen: Option<PathBuf>,

    /// Only use the token with this serial number
    #[arg(long)]
    serial: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pivot_daemon=info,pivot_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Pivot agent v{}", env!("CARGO_PKG_VERSION"));

    if std::io::stdin().is_terminal() {
        warn!("pivot-agent is meant to run as a background service, not from a terminal");
    }

    let args = Args::parse();

    // Load or create config
    let config_path = args
        .config
        .or_else(|| std::env::var_os("PIVOT_CONFIG").map(PathBuf::from))
        .unwrap_or_else(DaemonConfig::default_path);
    let mut config = DaemonConfig::load_or_create(&config_path)?;
    if let Some(listen) = args.listen {
        config.socket_path = listen;
    }
    if let Some(serial) = args.serial {
        config.device = DeviceSelector::Serial(serial);
    }

    config.ensure_directories()?;

    // Initialize components
    let sink: Arc<dyn NotificationSink> = match &config.notify_command {
        Some(argv) => Arc::new(CommandNotifier::new(argv.clone())),
        None => Arc::new(LogNotifier),
    };

    let registry = DeviceRegistry::new(
        Box::new(YubiKeyBackend::new()),
        config.device,
        config.release,
    );

    let agent = PivAgent::new(
        registry,
        config.slots.clone(),
        Arc::new(PinentryBroker::new(config.pinentry_program.clone())),
        TouchWatchdog::new(config.touch_grace(), sink, tokio::runtime::Handle::current()),
    );

    // Close sessions on hang-up so the next request rediscovers tokens
    #[cfg(unix)]
    {
        let agent = agent.clone();
        let mut hangups =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangups.recv().await.is_some() {
                info!("Received SIGHUP, releasing tokens");
                if let Err(e) = agent.close().await {
                    warn!("Failed to release tokens: {}", e);
                }
            }
        });
    }

    let server = Arc::new(AgentServer::new(config.socket_path.clone(), agent.clone()));

    // Start agent server
    let server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Agent server error: {}", e);
            }
        })
    };

    info!("Agent started successfully");

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_handle => {
            error!("Agent server exited unexpectedly");
        }
    }

    info!("Agent shutting down");

    if let Err(e) = agent.close().await {
        warn!("Failed to release tokens: {}", e);
    }
    server.cleanup()?;

    Ok(())
}
