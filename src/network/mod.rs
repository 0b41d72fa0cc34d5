//! Network Layer
//!
//! WebSocket server, identity, lobby, matchmaking and game sessions.
//! Everything with a clock or a lock lives here; the round rules
//! themselves come from `game/`.

pub mod auth;
pub mod protocol;
pub mod outbound;
pub mod directory;
pub mod lobby;
pub mod matchmaking;
pub mod signaling;
pub mod session;
pub mod coordinator;
pub mod game_loop;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, issue_token, validate_token};
pub use protocol::{ClientMessage, ServerMessage, ErrorCode, GameSnapshot};
pub use outbound::{Outbox, OutboxReceiver, DeliveryError};
pub use session::{GameSession, GameTable, SessionConfig, SessionError};
pub use coordinator::{Coordinator, CoordinatorConfig, Credentials, HandlerError};
pub use server::{GameServer, ServerConfig, GameServerError};
