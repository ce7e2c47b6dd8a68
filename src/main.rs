//! cosession - shared browsing session server
//!
//! Hosts collaborative sessions over WebSocket: one participant controls the
//! page, everyone else follows the relayed DOM and form events.
//!
//! **Default** (no subcommand) or `cosession serve`: run the server.
//! `cosession list` / `cosession health` query a running server over HTTP.

use clap::{Args, Parser as ClapParser, Subcommand};
use cosession::{
    api::{self, RouterConfig},
    config::{Config, ConfigError},
    gateway,
    registry::SessionRegistry,
    session::SessionSummary,
    shutdown::ShutdownCoordinator,
    sweeper::Sweeper,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// cosession - shared browsing session server
#[derive(ClapParser, Debug)]
#[command(name = "cosession", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Args, Debug, Clone, Default)]
struct ServeArgs {
    /// Address to bind the HTTP/WebSocket server [default: 127.0.0.1:3001]
    #[arg(long, env = "COSESSION_BIND")]
    bind: Option<SocketAddr>,

    /// Listen on 0.0.0.0 at this port, as hosting platforms expect.
    /// Ignored when --bind is given.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long, env = "COSESSION_CONFIG")]
    config: Option<PathBuf>,

    /// Allowed browser origin; repeat for several. `https://*.example.com`
    /// matches any subdomain. Replaces the configured list.
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Seconds between stale-session sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Sessions older than this many seconds are swept
    #[arg(long)]
    session_max_age_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the collaboration server (the default)
    Serve(ServeArgs),

    /// List active sessions on a running server
    List {
        /// Address of the server
        #[arg(long, env = "COSESSION_BIND", default_value = "127.0.0.1:3001")]
        bind: SocketAddr,
    },

    /// Print a running server's health report
    Health {
        /// Address of the server
        #[arg(long, env = "COSESSION_BIND", default_value = "127.0.0.1:3001")]
        bind: SocketAddr,
    },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Some(Commands::Serve(args)) => run_server(args).await,
        Some(Commands::List { bind }) => run_list(bind).await,
        Some(Commands::Health { bind }) => run_health(bind).await,
        None => run_server(cli.serve).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cosession=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Merge CLI flags over the config file over built-in defaults.
/// For the listen address: --bind, then PORT, then the file.
fn resolve_config(args: &ServeArgs) -> Result<Config, ServerError> {
    let mut config = match &args.config {
        Some(path) => match Config::load(path)? {
            Some(config) => config,
            None => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Config::default()
            }
        },
        None => Config::default(),
    };

    match (args.bind, args.port) {
        (Some(bind), _) => config.server.bind = bind,
        (None, Some(port)) => config.server.bind = SocketAddr::from(([0, 0, 0, 0], port)),
        (None, None) => {}
    }
    if !args.cors_origins.is_empty() {
        config.server.cors_origins = args.cors_origins.clone();
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweeper.interval_secs = secs;
    }
    if let Some(secs) = args.session_max_age_secs {
        config.sweeper.max_age_secs = secs;
    }
    config.validate()?;
    Ok(config)
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(args: ServeArgs) -> Result<(), ServerError> {
    let config = resolve_config(&args)?;
    let bind = config.server.bind;
    tracing::info!("cosession server starting");

    let (gateway, gateway_task) = gateway::spawn(SessionRegistry::new());
    let shutdown = ShutdownCoordinator::new();
    let sweeper = Sweeper::start(gateway.clone(), config.sweeper_config());

    let state = api::AppState {
        gateway,
        shutdown: shutdown.clone(),
    };
    let app = api::router(state, RouterConfig::from_patterns(&config.server.cors_origins));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, origins = ?config.server.cors_origins, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(Duration::from_secs(2)).await {
        tracing::warn!(
            remaining = shutdown.active_count(),
            "websocket handlers still open after grace period"
        );
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _ = server_shutdown_tx.send(());
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(?e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    sweeper.stop().await;
    // The router held the last gateway handles; the worker drains and exits.
    match tokio::time::timeout(Duration::from_secs(2), gateway_task).await {
        Ok(result) => result?,
        Err(_) => tracing::warn!("gateway worker did not drain in time"),
    }

    tracing::info!("cosession server exiting");
    Ok(())
}

// ── Client commands ────────────────────────────────────────────────

async fn fetch_json<T: serde::de::DeserializeOwned>(
    command: &str,
    bind: SocketAddr,
    path: &str,
) -> Result<T, ServerError> {
    let url = format!("http://{}{}", bind, path);
    let resp = match reqwest::Client::new().get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            if e.is_connect() {
                eprintln!(
                    "cosession {}: could not connect to server at {}. Is it running?",
                    command, bind
                );
                std::process::exit(1);
            }
            return Err(e.into());
        }
    };
    if !resp.status().is_success() {
        eprintln!("cosession {}: server returned status {}", command, resp.status());
        std::process::exit(1);
    }
    Ok(resp.json().await?)
}

async fn run_list(bind: SocketAddr) -> Result<(), ServerError> {
    let sessions: Vec<SessionSummary> = fetch_json("list", bind, "/sessions").await?;

    if sessions.is_empty() {
        println!("No active sessions.");
    } else {
        println!(
            "{:<12} {:<14} {:<8} {}",
            "ID", "PARTICIPANTS", "ACTIVE", "CREATED"
        );
        for s in &sessions {
            println!(
                "{:<12} {:<14} {:<8} {}",
                s.id,
                s.participant_count,
                if s.is_active { "yes" } else { "no" },
                s.created_at.to_rfc3339(),
            );
        }
    }
    Ok(())
}

async fn run_health(bind: SocketAddr) -> Result<(), ServerError> {
    let health: serde_json::Value = fetch_json("health", bind, "/health").await?;
    println!(
        "status: {}\nsessions: {}\nconnections: {}\ntimestamp: {}",
        health["status"].as_str().unwrap_or("unknown"),
        health["activeSessions"],
        health["activeConnections"],
        health["timestamp"].as_str().unwrap_or("-"),
    );
    Ok(())
}
