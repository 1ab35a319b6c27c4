//! rollout API server

use clap::{Parser, ValueEnum};
use rollout_api::{AppState, routes};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rollout-server")]
#[command(about = "Accept pipeline triggers over HTTP", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ROLLOUT_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Pipeline configurations, one per service
    #[arg(
        long = "config",
        env = "ROLLOUT_CONFIG",
        value_delimiter = ',',
        default_value = "rollout.kdl"
    )]
    configs: Vec<PathBuf>,

    /// PostgreSQL URL for run records and deployment state
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let state = AppState::load(&args.configs, args.database_url.as_deref()).await?;
    info!(services = ?state.orchestrator.services(), "Pipelines loaded");

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", args.bind);
    let listener = TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
