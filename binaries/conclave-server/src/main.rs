mod config;
mod registry;
mod rekey;
mod slot;
mod ws;

use std::sync::Arc;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::CONFIG;
use crate::registry::Registry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conclave_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let registry = Arc::new(Registry::new());
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(registry);
    let listener = TcpListener::bind(CONFIG.listen).await?;
    tracing::info!(listen = %CONFIG.listen, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
