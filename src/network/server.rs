//! WebSocket Game Server
//!
//! Accepts WebSocket connections, establishes identity from the upgrade
//! request, and runs one reader loop plus one writer task per
//! connection. All game logic lives in the `Coordinator`.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use futures_util::StreamExt;
use tracing::{debug, error, info, instrument, warn};

use crate::core::grid::GridSize;
use crate::game::state::SPAWN_MARGIN;
use crate::network::auth::AuthConfig;
use crate::network::coordinator::{Coordinator, CoordinatorConfig, Credentials};
use crate::network::outbound::{spawn_ws_writer, Outbox};
use crate::network::protocol::{ErrorCode, ServerMessage};

/// Smallest board width that fits two mirrored spawns.
pub const MIN_GRID_WIDTH: i32 = 2 * SPAWN_MARGIN + 4;

/// Smallest board height.
pub const MIN_GRID_HEIGHT: i32 = 3;

/// How often finished games are pruned.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub outbound_capacity: usize,
    /// Game and reconnection settings.
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            outbound_capacity: 256,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, GameServerError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SNAKE_BIND_ADDR") {
            config.bind_addr = addr
                .parse()
                .map_err(|_| GameServerError::Config(format!("invalid SNAKE_BIND_ADDR: {}", addr)))?;
        }
        if let Some(n) = env_parse("SNAKE_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = env_parse::<usize>("SNAKE_OUTBOUND_CAPACITY") {
            config.outbound_capacity = n.max(1);
        }

        let coordinator = &mut config.coordinator;
        if let Some(ms) = env_parse::<u64>("SNAKE_TICK_MS") {
            coordinator.session.tick_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = env_parse("SNAKE_COUNTDOWN_MS") {
            coordinator.session.countdown_step = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("SNAKE_RECONNECT_GRACE_MS") {
            coordinator.reconnect_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("SNAKE_EVICTION_GRACE_MS") {
            coordinator.eviction_grace = Duration::from_millis(ms);
        }

        let grid = coordinator.session.grid;
        let width = env_parse("SNAKE_GRID_WIDTH").unwrap_or(grid.width);
        let height = env_parse("SNAKE_GRID_HEIGHT").unwrap_or(grid.height);
        coordinator.session.grid = clamp_grid(width, height);

        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Board size raised to the playable minimum.
pub fn clamp_grid(width: i32, height: i32) -> GridSize {
    if width < MIN_GRID_WIDTH || height < MIN_GRID_HEIGHT {
        warn!(
            "Grid {}x{} too small, using at least {}x{}",
            width, height, MIN_GRID_WIDTH, MIN_GRID_HEIGHT
        );
    }
    GridSize::new(width.max(MIN_GRID_WIDTH), height.max(MIN_GRID_HEIGHT))
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Shared match state.
    coordinator: Arc<Coordinator>,
    /// Open connections.
    connections: Arc<AtomicUsize>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig, auth: AuthConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let coordinator = Arc::new(Coordinator::new(config.coordinator.clone(), auth));

        Self {
            config,
            coordinator,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Shared match state.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_coordinator = self.coordinator.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_coordinator).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        Ok(())
    }

    /// Handle a new TCP connection on its own task.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let coordinator = self.coordinator.clone();
        let connections = self.connections.clone();
        let capacity = self.config.outbound_capacity;
        let shutdown_rx = self.shutdown_tx.subscribe();

        connections.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            if let Err(e) = Self::serve_connection(stream, addr, coordinator, capacity, shutdown_rx).await {
                debug!("Connection {} ended with error: {}", addr, e);
            }
            connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn serve_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Arc<Coordinator>,
        capacity: usize,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), GameServerError> {
        let mut credentials = None;
        let capture_credentials = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            credentials = parse_credentials(req);
            Ok(resp)
        };
        let ws_stream = accept_hdr_async(stream, capture_credentials).await?;

        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbox, receiver) = Outbox::new(capacity);
        let conn_id = outbox.id();
        let writer = spawn_ws_writer(ws_sender, receiver, conn_id);

        let credentials = match credentials {
            Some(credentials) => credentials,
            None => {
                let _ = outbox.push(ServerMessage::error(
                    ErrorCode::InvalidMessage,
                    "token or username required",
                ));
                outbox.close();
                let _ = writer.await;
                return Ok(());
            }
        };

        let player = match coordinator.connect(credentials, outbox.clone()).await {
            Ok(player) => player,
            Err(e) => {
                info!("Handshake from {} rejected: {}", addr, e);
                if let Some(msg) = e.to_message() {
                    let _ = outbox.push(msg);
                }
                outbox.close();
                let _ = writer.await;
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !coordinator.handle_frame(player, &text).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        // Pings are answered by the protocol layer.
                        _ => {}
                    }
                }
                _ = outbox.closed() => {
                    debug!("Connection {} of {} shut down", conn_id, player.short());
                    break;
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        outbox.close();
        coordinator.connection_lost(player, conn_id).await;
        let _ = writer.await;
        debug!("Client {} cleaned up", addr);
        Ok(())
    }

    /// Periodically drop finished games nobody is connected to.
    async fn run_cleanup_loop(coordinator: Arc<Coordinator>) {
        let mut interval = interval(CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            coordinator.prune_finished().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    /// Get game count.
    pub async fn game_count(&self) -> usize {
        self.coordinator.games().len().await
    }
}

/// Credentials of an upgrade request.
///
/// A token comes from `?token=` or an `Authorization: Bearer` header; a
/// username from `?username=` or an `X-Username` header. A token wins.
pub fn parse_credentials(req: &Request) -> Option<Credentials> {
    let query = req.uri().query().unwrap_or("");

    if let Some(token) = query_param(query, "token").or_else(|| bearer_token(req)) {
        return Some(Credentials::Token(token));
    }
    query_param(query, "username")
        .or_else(|| header_value(req, "x-username"))
        .map(Credentials::Username)
}

fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)?
        .to_str()
        .ok()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn bearer_token(req: &Request) -> Option<String> {
    let value = header_value(req, "authorization")?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.coordinator.session.tick_interval, Duration::from_millis(100));
        assert_eq!(config.coordinator.session.grid, GridSize::new(40, 30));
    }

    #[test]
    fn test_clamp_grid() {
        assert_eq!(clamp_grid(40, 30), GridSize::new(40, 30));
        assert_eq!(clamp_grid(4, 1), GridSize::new(MIN_GRID_WIDTH, MIN_GRID_HEIGHT));
    }

    fn upgrade(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_parse_credentials_from_query() {
        assert_eq!(
            parse_credentials(&upgrade("/?username=Alice%20B", &[])),
            Some(Credentials::Username("Alice B".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/?username=a+b%21", &[])),
            Some(Credentials::Username("a b!".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/?username=bob&token=abc.def", &[])),
            Some(Credentials::Token("abc.def".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/?token=&username=carol", &[])),
            Some(Credentials::Username("carol".into()))
        );
        assert_eq!(parse_credentials(&upgrade("/?foo=bar", &[])), None);
        assert_eq!(parse_credentials(&upgrade("/", &[])), None);
    }

    #[test]
    fn test_parse_credentials_from_headers() {
        assert_eq!(
            parse_credentials(&upgrade("/", &[("Authorization", "Bearer abc.def")])),
            Some(Credentials::Token("abc.def".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/", &[("X-Username", "dave")])),
            Some(Credentials::Username("dave".into()))
        );
        // Query beats header, token beats username.
        assert_eq!(
            parse_credentials(&upgrade("/?token=q", &[("Authorization", "Bearer h")])),
            Some(Credentials::Token("q".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/?username=erin", &[("Authorization", "Bearer h")])),
            Some(Credentials::Token("h".into()))
        );
        assert_eq!(
            parse_credentials(&upgrade("/", &[("Authorization", "Basic xyz")])),
            None
        );
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(ServerConfig::default(), AuthConfig::default());

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.game_count().await, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = Arc::new(GameServer::new(ServerConfig::default(), AuthConfig::default()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run_with_listener(listener).await });

        // Give the accept loop a moment to subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();
        assert!(handle.await.unwrap().is_ok());
    }
}
