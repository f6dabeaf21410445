//! Relay Agent - Entry Point
//!
//! CLI application for running the agent and talking to one.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use relay_agent::{is_running_at, send_event, Agent, Config, Event, DEFAULT_ADDR, VERSION};

/// Relay Agent - forwards local events to a fan-out relay
#[derive(Parser)]
#[command(name = "relay-agent")]
#[command(version = VERSION)]
#[command(about = "Local forwarder that pushes events into a fan-out relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "agent-config.toml")]
        config: PathBuf,
    },
    /// Post one event to a running agent
    Send {
        /// Agent address
        #[arg(long, default_value = DEFAULT_ADDR)]
        addr: String,
        /// Event type
        #[arg(long = "type")]
        kind: String,
        /// Run identifier
        #[arg(long)]
        run_id: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Check whether an agent is running
    Status {
        /// Agent address
        #[arg(long, default_value = DEFAULT_ADDR)]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_agent(config).await,
        Commands::Send {
            addr,
            kind,
            run_id,
            payload,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("--payload must be valid JSON")?;
            send_event(&addr, &Event::new(kind, run_id, payload))
                .await
                .with_context(|| format!("Failed to send event to {}", addr))?;
            Ok(())
        }
        Commands::Status { addr } => {
            if is_running_at(&addr).await {
                println!("running at {}", addr);
                Ok(())
            } else {
                println!("not running at {}", addr);
                std::process::exit(1);
            }
        }
    }
}

async fn run_agent(config_path: PathBuf) -> Result<()> {
    // Load configuration
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize tracing
    init_tracing(&config.logging)?;

    info!(
        version = VERSION,
        config_path = ?config_path,
        upstream = %config.upstream.ws_endpoint,
        "Starting Relay Agent"
    );

    let agent = Agent::start(&config).await?;

    let handle = agent.handle();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                handle.stop();
            }
            _ = handle.stopped() => {}
        }
    });

    if let Err(e) = agent.run().await {
        error!(error = %e, "Agent error");
        return Err(e);
    }

    Ok(())
}

fn init_tracing(logging_config: &relay_agent::config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = if logging_config.format == "json" {
        subscriber.with(fmt::layer().json()).try_init()
    } else {
        subscriber.with(fmt::layer()).try_init()
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
