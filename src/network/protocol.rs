//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON object with a `type` discriminator. Several
//! server messages may share one text frame, newline-joined, and each
//! line is decoded on its own.

use serde::{Serialize, Deserialize};

use crate::core::grid::{Cell, Direction};
use crate::game::state::{GameId, GameStatus, PlayerId, Snake};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter the lobby.
    JoinLobby,

    /// Leave the lobby.
    LeaveLobby,

    /// Invite a lobby member to a match.
    GameRequest { target_id: PlayerId },

    /// Withdraw an invitation sent earlier.
    GameRequestCancel { target_id: PlayerId },

    /// Accept an invitation.
    GameAccept { game_id: GameId },

    /// Decline an invitation.
    GameReject { game_id: GameId },

    /// Mark ready in a waiting game.
    PlayerReady { game_id: GameId },

    /// Steer the snake.
    PlayerMove { game_id: GameId, direction: Direction },

    /// Ask for the list of running games.
    ListGames,

    /// Watch a game.
    JoinSpectator { game_id: GameId },

    /// Ask the opponent for another round.
    RematchRequest { game_id: GameId },

    /// Agree to the opponent's rematch request.
    RematchAccept { game_id: GameId },

    /// Start a solo game.
    StartSinglePlayer,

    /// Ask for the current snapshot of a game.
    GetGameState { game_id: GameId },

    /// Leave a game without disconnecting.
    LeaveGame { game_id: GameId },

    /// Peer transport offer, relayed untouched.
    PeerOffer(PeerRelay),

    /// Peer transport answer, relayed untouched.
    PeerAnswer(PeerRelay),

    /// Peer transport ICE candidate, relayed untouched.
    PeerIceCandidate(PeerRelay),
}

/// Outgoing peer-bootstrap payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRelay {
    /// Recipient.
    pub to_player_id: PlayerId,
    /// Opaque body (SDP, candidate, ...).
    #[serde(default)]
    pub payload: serde_json::Value,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected { player: PlayerInfo, token: String },

    /// Full lobby membership.
    LobbyStatus { players: Vec<LobbyEntry> },

    /// Running games.
    GamesList { games: Vec<GameListing> },

    /// Somebody invited you.
    MatchFound { game_id: GameId, from_player: PlayerInfo },

    /// Your invitation is pending.
    GameRequestSent { game_id: GameId, to_player: PlayerInfo },

    /// Invitation accepted.
    GameAccept { game_id: GameId, data: GameSnapshot },

    /// Invitation declined by its target.
    GameReject(Withdrawal),

    /// Invitation withdrawn (cancelled, or counterpart left).
    GameRequestCancel(Withdrawal),

    /// State change for principals.
    GameUpdate { data: GameSnapshot },

    /// Round started.
    GameStart { data: GameSnapshot },

    /// Round over.
    GameOver { data: GameSnapshot },

    /// State change for spectators.
    SpectatorUpdate { game_id: GameId, data: GameSnapshot },

    /// Opponent wants a rematch.
    RematchRequest {
        game_id: GameId,
        requester_id: PlayerId,
        requester_name: String,
    },

    /// Rematch agreed.
    RematchAccept {
        game_id: GameId,
        accepted_by: String,
        accepted_by_id: PlayerId,
    },

    /// Rematch countdown step.
    RematchCountdown { game_id: GameId, countdown: u32 },

    /// Opponent left a running game.
    PlayerDisconnected {
        game_id: GameId,
        player: String,
        message: String,
    },

    /// Relayed peer offer.
    PeerOffer(PeerSignal),

    /// Relayed peer answer.
    PeerAnswer(PeerSignal),

    /// Relayed peer ICE candidate.
    PeerIceCandidate(PeerSignal),

    /// Error message.
    Error(ServerError),
}

/// Public part of a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
}

/// One row of `lobby_status`.
#[derive(Debug, Clone, Serialize)]
pub struct LobbyEntry {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
    /// Ready in their current game, if any.
    pub ready: bool,
    /// When the player record was created.
    pub joined_at: chrono::DateTime<chrono::Utc>,
    /// Principal of a game that has not finished.
    pub in_game: bool,
}

/// One row of `games_list`.
#[derive(Debug, Clone, Serialize)]
pub struct GameListing {
    /// Game id.
    pub id: GameId,
    /// Slot A.
    pub player1: PlayerInfo,
    /// Slot B (absent for solo games).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player2: Option<PlayerInfo>,
    /// Current status.
    pub status: GameStatus,
    /// Number of spectators.
    pub spectators: usize,
    /// Score per username, only while playing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<std::collections::BTreeMap<String, u32>>,
    /// Solo game.
    pub is_single_player: bool,
}

/// Body of `game_reject` / `game_request_cancel`.
#[derive(Debug, Clone, Serialize)]
pub struct Withdrawal {
    /// The game that no longer exists.
    pub game_id: GameId,
    /// Who withdrew.
    pub player: PlayerInfo,
    /// Human-readable reason.
    pub message: String,
}

/// Relayed peer-bootstrap payload.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSignal {
    /// Sender.
    pub from_player_id: PlayerId,
    /// Opaque body as sent.
    pub payload: serde_json::Value,
}

/// Ready flag of one principal, as shown in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStatus {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
    /// Ready flag.
    pub ready: bool,
}

/// Food position wrapper.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Food {
    /// Food cell.
    pub position: Cell,
}

/// Full game state as sent in a `data` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct GameSnapshot {
    /// Game id.
    pub id: GameId,
    /// Snakes in slot order (empty before the first round).
    pub snakes: Vec<Snake>,
    /// Food.
    pub food: Food,
    /// Status.
    pub status: GameStatus,
    /// Seconds left in the countdown, 0 otherwise.
    pub countdown: u32,
    /// Winner id, or `"tie"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// Principals with their ready flags.
    pub players: Vec<PlayerStatus>,
    /// Solo game.
    pub is_single_player: bool,
    /// Why the round ended, when it was not a collision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error message.
#[derive(Debug, Clone, Serialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Token missing, malformed, expired, or badly signed.
    InvalidToken,
    /// Display name already held by a live connection.
    UsernameExists,
    /// Frame could not be decoded or lacks required fields.
    InvalidMessage,
    /// Sender is not a principal of the game.
    NotAPlayer,
    /// Unknown game id.
    GameNotFound,
    /// Unknown or offline player id.
    PlayerNotFound,
    /// Sender already plays in the game.
    AlreadyPlayer,
    /// Identical pending request exists.
    DuplicateRequest,
    /// Only the invited player may answer.
    NotTarget,
    /// Rematch partner is gone.
    OpponentDisconnected,
    /// Operation not allowed in the game's current status.
    InvalidState,
    /// Request aimed at oneself or at a busy player.
    InvalidTarget,
}

impl ServerError {
    /// Build an error message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Decode every newline-separated message in a text frame.
    ///
    /// Blank lines are skipped; each remaining line succeeds or fails
    /// independently.
    pub fn parse_frame(frame: &str) -> Vec<Result<Self, serde_json::Error>> {
        frame
            .split('\n')
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Self::from_json)
            .collect()
    }

    /// Message type name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinLobby => "join_lobby",
            ClientMessage::LeaveLobby => "leave_lobby",
            ClientMessage::GameRequest { .. } => "game_request",
            ClientMessage::GameRequestCancel { .. } => "game_request_cancel",
            ClientMessage::GameAccept { .. } => "game_accept",
            ClientMessage::GameReject { .. } => "game_reject",
            ClientMessage::PlayerReady { .. } => "player_ready",
            ClientMessage::PlayerMove { .. } => "player_move",
            ClientMessage::ListGames => "list_games",
            ClientMessage::JoinSpectator { .. } => "join_spectator",
            ClientMessage::RematchRequest { .. } => "rematch_request",
            ClientMessage::RematchAccept { .. } => "rematch_accept",
            ClientMessage::StartSinglePlayer => "start_single_player",
            ClientMessage::GetGameState { .. } => "get_game_state",
            ClientMessage::LeaveGame { .. } => "leave_game",
            ClientMessage::PeerOffer(_) => "peer_offer",
            ClientMessage::PeerAnswer(_) => "peer_answer",
            ClientMessage::PeerIceCandidate(_) => "peer_ice_candidate",
        }
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError::new(code, message))
    }
}

/// Join already-serialized messages into one text frame.
pub fn coalesce(lines: &[String]) -> String {
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_tags() {
        let msg = ClientMessage::from_json(r#"{"type":"join_lobby"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinLobby));

        let id = GameId::random();
        let text = format!(r#"{{"type":"player_move","game_id":"{}","direction":"left"}}"#, id);
        match ClientMessage::from_json(&text).unwrap() {
            ClientMessage::PlayerMove { game_id, direction } => {
                assert_eq!(game_id, id);
                assert_eq!(direction, Direction::Left);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_bad_direction_rejected() {
        let text = format!(
            r#"{{"type":"player_move","game_id":"{}","direction":"north"}}"#,
            GameId::random()
        );
        assert!(ClientMessage::from_json(&text).is_err());
    }

    #[test]
    fn test_parse_frame_independent_lines() {
        let frame = "{\"type\":\"join_lobby\"}\n\n{\"type\":\"bogus\"}\n{\"type\":\"list_games\"}\n";
        let parsed = ClientMessage::parse_frame(frame);
        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[0], Ok(ClientMessage::JoinLobby)));
        assert!(parsed[1].is_err());
        assert!(matches!(parsed[2], Ok(ClientMessage::ListGames)));
    }

    #[test]
    fn test_peer_relay_payload_untouched() {
        let to = PlayerId::random();
        let text = format!(
            r#"{{"type":"peer_offer","to_player_id":"{}","payload":{{"sdp":"v=0","type":"offer"}}}}"#,
            to
        );
        match ClientMessage::from_json(&text).unwrap() {
            ClientMessage::PeerOffer(relay) => {
                assert_eq!(relay.to_player_id, to);
                assert_eq!(relay.payload["sdp"], "v=0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_codes_wire_names() {
        let json = ServerMessage::error(ErrorCode::NotAPlayer, "nope").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "NOT_A_PLAYER");

        let json = ServerMessage::error(ErrorCode::InvalidToken, "bad").to_json().unwrap();
        assert!(json.contains("\"INVALID_TOKEN\""));
    }

    #[test]
    fn test_snapshot_envelope() {
        let snapshot = GameSnapshot {
            id: GameId::random(),
            snakes: Vec::new(),
            food: Food { position: Cell::new(3, 4) },
            status: GameStatus::RematchCountdown,
            countdown: 5,
            winner: None,
            players: Vec::new(),
            is_single_player: false,
            reason: None,
        };
        let json = ServerMessage::GameUpdate { data: snapshot }.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "game_update");
        assert_eq!(value["data"]["status"], "rematch_countdown");
        assert_eq!(value["data"]["food"]["position"]["x"], 3);
        assert!(value["data"].get("winner").is_none());
    }

    #[test]
    fn test_withdrawal_shapes_match() {
        let w = Withdrawal {
            game_id: GameId::random(),
            player: PlayerInfo { id: PlayerId::random(), username: "bob".into() },
            message: "bob declined".into(),
        };
        let reject: serde_json::Value =
            serde_json::from_str(&ServerMessage::GameReject(w.clone()).to_json().unwrap()).unwrap();
        let cancel: serde_json::Value =
            serde_json::from_str(&ServerMessage::GameRequestCancel(w).to_json().unwrap()).unwrap();

        assert_eq!(reject["type"], "game_reject");
        assert_eq!(cancel["type"], "game_request_cancel");
        assert_eq!(reject["player"], cancel["player"]);
        assert_eq!(reject["game_id"], cancel["game_id"]);
    }

    #[test]
    fn test_coalesce() {
        let lines = vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()];
        assert_eq!(coalesce(&lines), "{\"a\":1}\n{\"b\":2}");
    }
}
