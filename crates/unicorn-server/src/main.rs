use anyhow::Result;
use axum::http::HeaderValue;
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

mod config;
mod error;
mod routes;
mod store;
mod ws;

#[derive(Debug, Parser)]
#[command(name = "unicorn-server", about = "Solo Unicorn board server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        db_path: Option<PathBuf>,
        /// TOML config file; defaults to <config dir>/solo-unicorn/server.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve { port, db_path, config } => {
            let config = config::load(config.as_deref())?.with_overrides(port, db_path);
            serve(config).await?
        }
    }

    Ok(())
}

async fn serve(config: config::ServerConfig) -> Result<()> {
    let connection = store::init_db(&config.db_path)?;
    let state = routes::AppState::new(connection, config.broadcast_capacity);

    let app = routes::router(state)
        .layer(cors_layer(config.allowed_origin.as_deref())?)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("board server listening on http://{}", addr);
    info!("sqlite database at {}", config.db_path.display());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn cors_layer(allowed_origin: Option<&str>) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    Ok(match allowed_origin {
        Some(origin) => layer.allow_origin(origin.parse::<HeaderValue>()?),
        None => layer.allow_origin(Any),
    })
}
