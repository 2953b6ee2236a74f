//! stompbus daemon - STOMP gateway over SockJS HTTP transports

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stompbus::security::SecurityRegistry;
use stompbus::server::{
    build_router, AppState, EventRegistry, LocalBroker, Relay, ServerConfig, SessionRegistry,
};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stompbusd")]
#[command(about = "STOMP gateway daemon with SockJS fallback transports")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8081", env = "STOMPBUS_BIND")]
    bind: String,

    /// Streaming response byte limit before the client must reconnect
    #[arg(long, default_value_t = 128 * 1024, env = "STOMPBUS_RESPONSE_LIMIT")]
    response_limit: usize,

    /// Heartbeat interval for open streams, in seconds
    #[arg(long, default_value_t = 25, env = "STOMPBUS_HEARTBEAT_SECS")]
    heartbeat_secs: u64,

    /// Session inactivity threshold, in seconds
    #[arg(long, default_value_t = 5, env = "STOMPBUS_SESSION_TIMEOUT_SECS")]
    session_timeout_secs: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(ServerConfig {
        response_limit: args.response_limit,
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs),
        session_timeout: Duration::from_secs(args.session_timeout_secs),
        ..ServerConfig::default()
    });

    // default-allow until customizers register limitations
    let security = Arc::new(SecurityRegistry::new());

    let events = Arc::new(EventRegistry::new());
    let registry = SessionRegistry::new(events, config.session_timeout, config.grace_period);
    let sweeper = registry.spawn_sweeper(config.sweep_interval);

    let relay = Relay::new(Arc::new(LocalBroker::new()));
    relay.register_teardown(registry.events());
    relay
        .connect_system()
        .await
        .context("Failed to open system broker connection")?;

    let state = AppState::new(registry, relay, security, config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!(addr = %args.bind, "stompbus daemon listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("Server error")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server");
        }
    }

    sweeper.abort();
    info!("stompbus daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
