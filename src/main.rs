//! Snake Arena Server
//!
//! Binds the WebSocket listener and serves matches until Ctrl-C.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snake_arena::{
    network::{AuthConfig, GameServer, ServerConfig},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("reading server configuration")?;
    let auth = AuthConfig::from_env();

    info!("Snake Arena Server v{}", VERSION);
    info!(
        "Grid {}x{}, tick {:?}, reconnect grace {:?}",
        config.coordinator.session.grid.width,
        config.coordinator.session.grid.height,
        config.coordinator.session.tick_interval,
        config.coordinator.reconnect_grace
    );

    let server = std::sync::Arc::new(GameServer::new(config, auth));

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            signal_server.shutdown();
        }
    });

    server.run().await.context("server stopped")?;
    info!("Server stopped");
    Ok(())
}
