//! Match Coordinator
//!
//! Owns every shared registry (players, lobby, games, pending requests,
//! signaling mailboxes) and implements the client-facing operations on
//! top of them. One instance is built at startup and shared as an `Arc`.
//!
//! Lock order: pending edges, then the games table, then a single game,
//! then the player directory. The lobby lock is only taken on its own.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::core::grid::Direction;
use crate::game::state::{GameId, GameStatus, PlayerId};
use crate::network::auth::{issue_token, validate_token, AuthConfig};
use crate::network::directory::{Directory, Player};
use crate::network::game_loop;
use crate::network::lobby::Lobby;
use crate::network::matchmaking::{ClaimError, PendingRequest, PendingRequests};
use crate::network::outbound::{ConnectionId, Outbox};
use crate::network::protocol::{
    ClientMessage, ErrorCode, GameListing, GameSnapshot, LobbyEntry, PeerRelay, PeerSignal,
    PlayerInfo, ServerMessage, Withdrawal,
};
use crate::network::session::{
    GameSession, GameTable, SessionConfig, SessionError, SharedSession, REASON_DISCONNECT,
};
use crate::network::signaling::{SignalKind, SignalMailbox};

/// Frames buffered on a peer input link.
pub const PEER_LINK_CAPACITY: usize = 64;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Per-game settings.
    pub session: SessionConfig,
    /// How long a lost player is kept for a reconnect.
    pub reconnect_grace: Duration,
    /// Pause between closing an evicted connection and attaching its
    /// replacement.
    pub eviction_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            reconnect_grace: Duration::from_secs(10),
            eviction_grace: Duration::from_millis(100),
        }
    }
}

/// Handler failures, each mapped to a wire error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Malformed input. Logged and ignored.
    #[error("Invalid message: {0}")]
    Validation(String),

    /// Identity could not be established. Closes the connection.
    #[error("{1}")]
    Auth(ErrorCode, String),

    /// Sender may not do this.
    #[error("{1}")]
    Authorization(ErrorCode, String),

    /// Conflicts with current state; nothing was changed.
    #[error("{1}")]
    Conflict(ErrorCode, String),

    /// Referenced entity does not exist.
    #[error("{1}")]
    NotFound(ErrorCode, String),
}

impl HandlerError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Validation(_) => ErrorCode::InvalidMessage,
            HandlerError::Auth(code, _)
            | HandlerError::Authorization(code, _)
            | HandlerError::Conflict(code, _)
            | HandlerError::NotFound(code, _) => *code,
        }
    }

    /// Whether the connection must be closed after reporting.
    pub fn closes_connection(&self) -> bool {
        matches!(self, HandlerError::Auth(..))
    }

    /// Error event to send, if any.
    pub fn to_message(&self) -> Option<ServerMessage> {
        match self {
            HandlerError::Validation(_) => None,
            other => Some(ServerMessage::error(other.code(), other.to_string())),
        }
    }

    fn game_not_found() -> Self {
        HandlerError::NotFound(ErrorCode::GameNotFound, "Game not found".into())
    }

    fn player_not_found() -> Self {
        HandlerError::NotFound(ErrorCode::PlayerNotFound, "Player not found".into())
    }

    fn not_a_player() -> Self {
        HandlerError::Authorization(ErrorCode::NotAPlayer, "Not a player in this game".into())
    }

    fn invalid_state(message: impl Into<String>) -> Self {
        HandlerError::Conflict(ErrorCode::InvalidState, message.into())
    }
}

impl From<SessionError> for HandlerError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotAPlayer => HandlerError::not_a_player(),
            SessionError::AlreadyPlayer => {
                HandlerError::Conflict(ErrorCode::AlreadyPlayer, e.to_string())
            }
            SessionError::InvalidState(_) | SessionError::InvalidTransition { .. } => {
                HandlerError::invalid_state(e.to_string())
            }
        }
    }
}

/// How a connection identifies itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Previously issued token.
    Token(String),
    /// Display name for a first-time login.
    Username(String),
}

/// Which event a game fan-out carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Any state change.
    Update,
    /// Round started.
    Start,
    /// Round over.
    Over,
}

/// Recipients and snapshot of a game, captured under its lock.
#[derive(Debug, Clone)]
pub(crate) struct GameView {
    pub game_id: GameId,
    pub principals: Vec<PlayerId>,
    pub spectators: Vec<PlayerId>,
    pub snapshot: GameSnapshot,
}

impl GameView {
    pub(crate) fn of(game: &GameSession) -> Self {
        Self {
            game_id: game.id,
            principals: game.principals(),
            spectators: game.spectator_ids(),
            snapshot: game.snapshot(),
        }
    }

    fn everyone(&self) -> Vec<PlayerId> {
        self.principals.iter().chain(self.spectators.iter()).copied().collect()
    }
}

/// What a principal's departure did to one game.
enum Departure {
    /// A running round was forced to finish.
    Abandoned { view: GameView, opponent: Option<PlayerInfo> },
    /// A game that had not started was cancelled.
    Cancelled { opponent: Option<PlayerInfo> },
    /// A finished game was closed.
    Closed { opponent: Option<PlayerInfo> },
}

/// Shared match state and the operations on it.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    auth: AuthConfig,
    directory: Directory,
    lobby: Lobby,
    games: GameTable,
    requests: PendingRequests,
    mailbox: SignalMailbox,
}

impl Coordinator {
    /// Create a coordinator with empty registries.
    pub fn new(config: CoordinatorConfig, auth: AuthConfig) -> Self {
        Self {
            config,
            auth,
            directory: Directory::new(),
            lobby: Lobby::new(),
            games: GameTable::new(),
            requests: PendingRequests::new(),
            mailbox: SignalMailbox::new(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Token settings.
    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    /// Player records.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Idle players.
    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    /// All games.
    pub fn games(&self) -> &GameTable {
        &self.games
    }

    /// Pending match requests.
    pub fn requests(&self) -> &PendingRequests {
        &self.requests
    }

    /// Peer signaling mailboxes.
    pub fn mailbox(&self) -> &SignalMailbox {
        &self.mailbox
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Bind a new connection to a player and restore their state.
    ///
    /// `connected` is always the first message on the connection. On error
    /// nothing has been attached; the caller reports the error and closes
    /// the connection.
    #[instrument(skip(self, credentials, outbox), fields(conn = outbox.id()))]
    pub async fn connect(
        self: &Arc<Self>,
        credentials: Credentials,
        outbox: Outbox,
    ) -> Result<PlayerId, HandlerError> {
        let player = match credentials {
            Credentials::Token(token) => self.connect_with_token(token, outbox).await?,
            Credentials::Username(username) => self.connect_with_username(&username, outbox).await?,
        };

        self.restore_state(&player).await;
        Ok(player)
    }

    async fn connect_with_token(&self, token: String, outbox: Outbox) -> Result<PlayerId, HandlerError> {
        let claims = validate_token(&token, &self.auth).map_err(|e| {
            warn!("Token rejected: {}", e);
            HandlerError::Auth(ErrorCode::InvalidToken, "Invalid or expired token".into())
        })?;
        let id = claims
            .player_id()
            .map_err(|e| HandlerError::Auth(ErrorCode::InvalidToken, e.to_string()))?;
        let username = claims.username.trim();
        if username.is_empty() {
            return Err(HandlerError::Auth(
                ErrorCode::InvalidToken,
                "Token carries no username".into(),
            ));
        }

        if self.directory.contains(&id).await {
            // Evict the old connection and let its loops wind down first.
            if let Some(old) = self.directory.take_link(&id).await {
                info!("Evicting connection {} of {}", old.id(), id.short());
                old.close();
                tokio::time::sleep(self.config.eviction_grace).await;
            }
        } else {
            info!("Recreating player {} ({}) from token", id.short(), username);
        }

        // Recreates the record if it vanished while we waited.
        let displaced = self
            .directory
            .attach(Player::new(id, username), outbox, |player| ServerMessage::Connected { player, token })
            .await;
        if let Some(old) = displaced {
            old.close();
        }

        info!("Player {} reconnected", id.short());
        Ok(id)
    }

    async fn connect_with_username(&self, username: &str, outbox: Outbox) -> Result<PlayerId, HandlerError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(HandlerError::Auth(ErrorCode::InvalidMessage, "Username required".into()));
        }

        let id = PlayerId::random();
        let token = issue_token(&id, username, &self.auth)
            .map_err(|e| HandlerError::Auth(ErrorCode::InvalidToken, e.to_string()))?;

        if self
            .directory
            .claim_username(Player::new(id, username), outbox, |player| ServerMessage::Connected { player, token })
            .await
            .is_err()
        {
            return Err(HandlerError::Conflict(
                ErrorCode::UsernameExists,
                format!("Username '{}' is already taken", username),
            ));
        }

        info!("Player {} connected as {}", id.short(), username);
        Ok(id)
    }

    /// Send a (re)connected player whatever view they were in.
    async fn restore_state(&self, player: &PlayerId) {
        for game in self.games.games_of(player).await {
            let g = game.read().await;
            if g.status() != GameStatus::Finished {
                let data = g.snapshot();
                drop(g);
                self.send(player, ServerMessage::GameUpdate { data }).await;
                return;
            }
        }

        for game in self.games.all().await {
            let g = game.read().await;
            if g.is_spectator(player) {
                let msg = ServerMessage::SpectatorUpdate {
                    game_id: g.id,
                    data: g.snapshot(),
                };
                drop(g);
                self.send(player, msg).await;
                return;
            }
        }

        self.enter_lobby(player).await;
        let games = self.game_listings().await;
        self.send(player, ServerMessage::GamesList { games }).await;
    }

    /// A connection's read loop ended.
    ///
    /// The player is detached at once and removed for good only if no new
    /// connection attaches within the reconnect grace window.
    pub async fn connection_lost(self: &Arc<Self>, player: PlayerId, conn: ConnectionId) {
        let epoch = match self.directory.connection_lost(&player, conn).await {
            Some(epoch) => epoch,
            None => return,
        };
        info!("Player {} lost connection {}", player.short(), conn);

        if self.lobby.remove(&player).await {
            self.broadcast_lobby().await;
        }

        let coordinator = Arc::clone(self);
        let grace = self.config.reconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(record) = coordinator.directory.remove_if_detached(&player, epoch).await {
                info!("Player {} did not return, removing", player.short());
                coordinator.remove_player(&record.info()).await;
            }
        });
    }

    /// Permanently remove a player from lobby, requests and games.
    ///
    /// Exactly one game branch runs: a running round is forced to finish,
    /// else unstarted games are cancelled, else spectating stops.
    pub async fn remove_player(&self, player: &PlayerInfo) {
        let id = player.id;
        self.lobby.remove(&id).await;
        self.mailbox.purge(&id).await;

        let mut playing = None;
        let mut pre_play = Vec::new();
        for game in self.games.games_of(&id).await {
            let status = game.read().await.status();
            if status == GameStatus::Playing && playing.is_none() {
                playing = Some(game);
            } else if status.is_pre_play() {
                pre_play.push(game);
            }
        }

        if let Some(game) = playing {
            self.depart(player, &game).await;
        } else if !pre_play.is_empty() {
            for game in &pre_play {
                self.depart(player, game).await;
            }
        }

        // Spectating ends in every case; it only drives the listing when
        // no game branch ran.
        for game in self.games.all().await {
            game.write().await.remove_spectator(&id);
        }

        for edge in self.requests.clear_touching(&[id]).await {
            self.withdraw(edge, player, format!("{} left", player.username)).await;
        }

        self.broadcast_lobby().await;
        self.broadcast_games().await;
    }

    /// Attach a secondary input link for a player.
    ///
    /// Frames pushed into the returned sender are decoded like primary
    /// frames, but only `player_move` is honoured. Failures on this path
    /// are dropped without affecting the primary connection.
    ///
    /// The low-latency peer transport calls this once its data channel is
    /// open and forwards each text frame it receives.
    pub fn attach_peer_link(self: &Arc<Self>, player: PlayerId) -> mpsc::Sender<String> {
        let (tx, mut rx) = mpsc::channel::<String>(PEER_LINK_CAPACITY);
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                for msg in ClientMessage::parse_frame(&frame).into_iter().flatten() {
                    if let ClientMessage::PlayerMove { game_id, direction } = msg {
                        if let Err(e) = coordinator.player_move(player, game_id, direction).await {
                            debug!("Peer move from {} dropped: {}", player.short(), e);
                        }
                    }
                }
            }
        });
        tx
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Decode and handle one text frame.
    ///
    /// Returns false when the connection must be closed.
    pub async fn handle_frame(self: &Arc<Self>, player: PlayerId, frame: &str) -> bool {
        for parsed in ClientMessage::parse_frame(frame) {
            let result = match parsed {
                Ok(msg) => self.dispatch(player, msg).await,
                Err(e) => Err(HandlerError::Validation(e.to_string())),
            };
            if let Err(e) = result {
                if !self.report(&player, &e).await {
                    return false;
                }
            }
        }
        true
    }

    /// Send an error event. Returns false if the connection must close.
    async fn report(&self, player: &PlayerId, error: &HandlerError) -> bool {
        match error.to_message() {
            Some(msg) => {
                debug!("Error for {}: {}", player.short(), error);
                self.send(player, msg).await;
            }
            None => debug!("Ignoring message from {}: {}", player.short(), error),
        }
        !error.closes_connection()
    }

    /// Handle one decoded message.
    pub async fn dispatch(self: &Arc<Self>, player: PlayerId, msg: ClientMessage) -> Result<(), HandlerError> {
        debug!("{} from {}", msg.kind(), player.short());
        match msg {
            ClientMessage::JoinLobby => {
                self.enter_lobby(&player).await;
                Ok(())
            }
            ClientMessage::LeaveLobby => {
                if self.lobby.remove(&player).await {
                    self.broadcast_lobby().await;
                }
                Ok(())
            }
            ClientMessage::GameRequest { target_id } => self.game_request(player, target_id).await,
            ClientMessage::GameRequestCancel { target_id } => self.game_request_cancel(player, target_id).await,
            ClientMessage::GameAccept { game_id } => self.game_accept(player, game_id).await,
            ClientMessage::GameReject { game_id } => self.game_reject(player, game_id).await,
            ClientMessage::PlayerReady { game_id } => self.player_ready(player, game_id).await,
            ClientMessage::PlayerMove { game_id, direction } => {
                self.player_move(player, game_id, direction).await
            }
            ClientMessage::ListGames => {
                let games = self.game_listings().await;
                self.send(&player, ServerMessage::GamesList { games }).await;
                Ok(())
            }
            ClientMessage::JoinSpectator { game_id } => self.join_spectator(player, game_id).await,
            ClientMessage::RematchRequest { game_id } => self.rematch_request(player, game_id).await,
            ClientMessage::RematchAccept { game_id } => self.rematch_accept(player, game_id).await,
            ClientMessage::StartSinglePlayer => self.start_single_player(player).await,
            ClientMessage::GetGameState { game_id } => self.get_game_state(player, game_id).await,
            ClientMessage::LeaveGame { game_id } => self.leave_game(player, game_id).await,
            ClientMessage::PeerOffer(relay) => self.relay(player, SignalKind::Offer, relay).await,
            ClientMessage::PeerAnswer(relay) => self.relay(player, SignalKind::Answer, relay).await,
            ClientMessage::PeerIceCandidate(relay) => {
                self.relay(player, SignalKind::IceCandidate, relay).await
            }
        }
    }

    // =========================================================================
    // MATCHMAKING
    // =========================================================================

    async fn game_request(&self, player: PlayerId, target: PlayerId) -> Result<(), HandlerError> {
        if target == player {
            return Err(HandlerError::Conflict(
                ErrorCode::InvalidTarget,
                "Cannot challenge yourself".into(),
            ));
        }
        if !self.lobby.contains(&target).await || !self.directory.is_live(&target).await {
            return Err(HandlerError::NotFound(
                ErrorCode::PlayerNotFound,
                "Player is not in the lobby".into(),
            ));
        }
        let from = self.player_info(&player).await?;
        let to = self.player_info(&target).await?;

        let request = self.requests.open(player, target).await.map_err(|_| {
            HandlerError::Conflict(ErrorCode::DuplicateRequest, "Request already pending".into())
        })?;
        let game_id = request.game_id;
        self.games
            .insert(GameSession::new_duel(game_id, &from, &to, self.config.session.grid))
            .await;
        info!("Game {} requested by {} for {}", game_id.short(), player.short(), target.short());

        self.send(&target, ServerMessage::MatchFound { game_id, from_player: from }).await;
        self.send(&player, ServerMessage::GameRequestSent { game_id, to_player: to }).await;
        Ok(())
    }

    async fn game_request_cancel(&self, player: PlayerId, target: PlayerId) -> Result<(), HandlerError> {
        let request = self.requests.cancel(&player, &target).await.ok_or_else(|| {
            HandlerError::NotFound(ErrorCode::PlayerNotFound, "No pending request to that player".into())
        })?;
        self.games.remove(&request.game_id).await;

        let info = self.player_info(&player).await?;
        let message = format!("{} cancelled the request", info.username);
        self.send(
            &target,
            ServerMessage::GameRequestCancel(Withdrawal {
                game_id: request.game_id,
                player: info,
                message,
            }),
        )
        .await;

        // Confirm to the canceller, naming the player the request was for.
        if let Ok(target_info) = self.player_info(&target).await {
            let message = format!("Request to {} cancelled", target_info.username);
            self.send(
                &player,
                ServerMessage::GameRequestCancel(Withdrawal {
                    game_id: request.game_id,
                    player: target_info,
                    message,
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn game_accept(self: &Arc<Self>, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let (request, orphans) = self.requests.claim(&game_id, &player).await.map_err(|e| match e {
            ClaimError::NoEdge => HandlerError::invalid_state("No pending request for this game"),
            ClaimError::NotTarget(_) => HandlerError::Authorization(
                ErrorCode::NotTarget,
                "Only the invited player can accept".into(),
            ),
        })?;

        let accepter = self.player_info(&player).await?;
        for orphan in orphans {
            let leaver = if orphan.requester == request.requester || orphan.target == request.requester {
                self.player_info(&request.requester).await?
            } else {
                accepter.clone()
            };
            let message = format!("{} is no longer available", leaver.username);
            self.withdraw(orphan, &leaver, message).await;
        }
        self.supersede(&[request.requester, player], &game_id).await;

        let data = game.read().await.snapshot();
        info!("Game {} accepted", game_id.short());
        let msg = ServerMessage::GameAccept { game_id, data };
        self.directory.deliver_all(&[request.requester, player], &msg).await;

        self.broadcast_games().await;
        self.broadcast_lobby().await;
        Ok(())
    }

    async fn game_reject(&self, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        self.game(&game_id).await?;
        let request = self
            .requests
            .for_game(&game_id)
            .await
            .ok_or_else(|| HandlerError::invalid_state("No pending request for this game"))?;
        if request.target != player {
            return Err(HandlerError::Authorization(
                ErrorCode::NotTarget,
                "Only the invited player can reject".into(),
            ));
        }
        self.requests
            .remove_game(&game_id)
            .await
            .ok_or_else(|| HandlerError::invalid_state("Request already answered"))?;
        self.games.remove(&game_id).await;

        let info = self.player_info(&player).await?;
        let message = format!("{} declined your request", info.username);
        self.send(
            &request.requester,
            ServerMessage::GameReject(Withdrawal {
                game_id,
                player: info,
                message,
            }),
        )
        .await;
        Ok(())
    }

    /// Delete the game of a dead edge and tell its other end.
    async fn withdraw(&self, edge: PendingRequest, leaver: &PlayerInfo, message: String) {
        self.games.remove(&edge.game_id).await;
        let counterpart = if edge.requester == leaver.id {
            edge.target
        } else {
            edge.requester
        };
        self.send(
            &counterpart,
            ServerMessage::GameRequestCancel(Withdrawal {
                game_id: edge.game_id,
                player: leaver.clone(),
                message,
            }),
        )
        .await;
    }

    /// Drop finished games of `players` in favour of a new match.
    async fn supersede(&self, players: &[PlayerId], keep: &GameId) {
        for player in players {
            for game in self.games.games_of(player).await {
                let (id, finished) = {
                    let g = game.read().await;
                    (g.id, g.status() == GameStatus::Finished)
                };
                if finished && id != *keep {
                    debug!("Game {} superseded", id.short());
                    self.games.remove(&id).await;
                }
            }
        }
    }

    // =========================================================================
    // GAMEPLAY
    // =========================================================================

    async fn player_ready(self: &Arc<Self>, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        if self.requests.for_game(&game_id).await.is_some() {
            return Err(HandlerError::invalid_state("Request has not been accepted"));
        }

        let (view, generation) = {
            let mut g = game.write().await;
            let all_ready = g.set_ready(&player)?;
            let generation = if all_ready {
                Some(g.start_countdown(self.config.session.countdown_from)?)
            } else {
                None
            };
            (GameView::of(&g), generation)
        };

        match generation {
            Some(generation) => {
                info!("Game {} all ready, counting down", game_id.short());
                tokio::spawn(game_loop::run_countdown(Arc::clone(self), game_id, generation));
                self.broadcast_games().await;
            }
            None => self.publish(&view, Phase::Update).await,
        }
        Ok(())
    }

    /// Stage a direction change for the next tick.
    pub async fn player_move(
        &self,
        player: PlayerId,
        game_id: GameId,
        direction: Direction,
    ) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let staged = game.write().await.stage_move(&player, direction)?;
        if !staged {
            debug!("Move {:?} from {} ignored", direction, player.short());
        }
        Ok(())
    }

    async fn join_spectator(&self, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let (added, data) = {
            let mut g = game.write().await;
            let added = g.add_spectator(player)?;
            (added, g.snapshot())
        };
        self.send(&player, ServerMessage::SpectatorUpdate { game_id, data }).await;

        if added {
            info!("Player {} spectating {}", player.short(), game_id.short());
            if self.lobby.remove(&player).await {
                self.broadcast_lobby().await;
            }
            self.broadcast_games().await;
        }
        Ok(())
    }

    async fn start_single_player(self: &Arc<Self>, player: PlayerId) -> Result<(), HandlerError> {
        for game in self.games.games_of(&player).await {
            if game.read().await.status() != GameStatus::Finished {
                return Err(HandlerError::invalid_state("Already in a game"));
            }
        }
        let info = self.player_info(&player).await?;
        for edge in self.requests.clear_touching(&[player]).await {
            self.withdraw(edge, &info, format!("{} started a solo game", info.username)).await;
        }

        let game_id = GameId::random();
        self.supersede(&[player], &game_id).await;
        let mut session = GameSession::new_solo(game_id, &info, self.config.session.grid);
        let generation = session.start_countdown(self.config.session.countdown_from)?;
        self.games.insert(session).await;
        info!("Solo game {} for {}", game_id.short(), player.short());

        tokio::spawn(game_loop::run_countdown(Arc::clone(self), game_id, generation));
        self.broadcast_games().await;
        self.broadcast_lobby().await;
        Ok(())
    }

    async fn get_game_state(&self, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let msg = {
            let g = game.read().await;
            if g.is_principal(&player) {
                ServerMessage::GameUpdate { data: g.snapshot() }
            } else if g.is_spectator(&player) {
                ServerMessage::SpectatorUpdate {
                    game_id,
                    data: g.snapshot(),
                }
            } else {
                return Err(HandlerError::not_a_player());
            }
        };
        self.send(&player, msg).await;
        Ok(())
    }

    async fn leave_game(&self, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let (principal, spectator) = {
            let g = game.read().await;
            (g.is_principal(&player), g.is_spectator(&player))
        };

        if principal {
            let info = self.player_info(&player).await?;
            self.depart(&info, &game).await;
        } else if spectator {
            game.write().await.remove_spectator(&player);
        } else {
            return Err(HandlerError::not_a_player());
        }

        self.enter_lobby(&player).await;
        self.broadcast_games().await;
        Ok(())
    }

    /// Take a principal out of one game.
    async fn depart(&self, player: &PlayerInfo, game: &SharedSession) {
        let (game_id, departure) = {
            let mut g = game.write().await;
            let opponent = g.opponent_of(&player.id).map(|s| PlayerInfo {
                id: s.player,
                username: s.username.clone(),
            });
            let departure = match g.status() {
                GameStatus::Playing => {
                    if let Err(e) = g.finish(None, Some(REASON_DISCONNECT)) {
                        warn!("Game {} could not finish: {}", g.id.short(), e);
                    }
                    Departure::Abandoned {
                        view: GameView::of(&g),
                        opponent,
                    }
                }
                GameStatus::Finished => Departure::Closed { opponent },
                _ => {
                    // Any countdown task sees the bump and exits.
                    g.generation += 1;
                    g.stop_ticker();
                    Departure::Cancelled { opponent }
                }
            };
            (g.id, departure)
        };
        self.games.remove(&game_id).await;
        let gone_message = format!("{} has left the game", player.username);

        match departure {
            Departure::Abandoned { view, opponent } => {
                info!("Game {} ended, {} left", game_id.short(), player.id.short());
                self.publish(&view, Phase::Over).await;
                if let Some(opponent) = opponent {
                    let msg = ServerMessage::PlayerDisconnected {
                        game_id,
                        player: player.username.clone(),
                        message: gone_message,
                    };
                    self.send(&opponent.id, msg).await;
                    if self.directory.is_live(&opponent.id).await {
                        self.lobby.add(opponent.id).await;
                    }
                }
            }
            Departure::Cancelled { opponent } => {
                info!("Game {} cancelled, {} left", game_id.short(), player.id.short());
                self.requests.remove_game(&game_id).await;
                if let Some(opponent) = opponent {
                    let msg = ServerMessage::GameRequestCancel(Withdrawal {
                        game_id,
                        player: player.clone(),
                        message: format!("{} left", player.username),
                    });
                    self.send(&opponent.id, msg).await;
                    if self.directory.is_live(&opponent.id).await {
                        self.lobby.add(opponent.id).await;
                    }
                }
            }
            Departure::Closed { opponent } => {
                if let Some(opponent) = opponent {
                    let msg = ServerMessage::PlayerDisconnected {
                        game_id,
                        player: player.username.clone(),
                        message: gone_message,
                    };
                    self.send(&opponent.id, msg).await;
                }
            }
        }
    }

    // =========================================================================
    // REMATCH
    // =========================================================================

    async fn rematch_request(self: &Arc<Self>, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        let opponent = self.rematch_opponent(&game, &player).await?;

        let both = game.write().await.vote_rematch(&player)?;
        let requester = self.player_info(&player).await?;
        info!("Rematch requested in {} by {}", game_id.short(), player.short());

        if both {
            return self.start_rematch(&game, player).await;
        }
        self.send(
            &opponent,
            ServerMessage::RematchRequest {
                game_id,
                requester_id: player,
                requester_name: requester.username,
            },
        )
        .await;
        Ok(())
    }

    async fn rematch_accept(self: &Arc<Self>, player: PlayerId, game_id: GameId) -> Result<(), HandlerError> {
        let game = self.game(&game_id).await?;
        self.rematch_opponent(&game, &player).await?;
        self.start_rematch(&game, player).await
    }

    /// Validate a rematch operation and return the opponent.
    ///
    /// An opponent without a live connection ends the game: it is deleted
    /// and the requester goes back to the lobby.
    async fn rematch_opponent(&self, game: &SharedSession, player: &PlayerId) -> Result<PlayerId, HandlerError> {
        let (game_id, opponent) = {
            let g = game.read().await;
            if !g.is_principal(player) {
                return Err(HandlerError::not_a_player());
            }
            if g.is_solo() || g.status() != GameStatus::Finished {
                return Err(HandlerError::invalid_state(format!(
                    "Cannot rematch a game in status {}",
                    g.status()
                )));
            }
            (g.id, g.opponent_of(player).map(|s| s.player))
        };
        let opponent = opponent.ok_or_else(HandlerError::not_a_player)?;

        if !self.directory.is_live(&opponent).await {
            info!("Rematch in {} impossible, opponent gone", game_id.short());
            self.games.remove(&game_id).await;
            self.enter_lobby(player).await;
            self.broadcast_games().await;
            return Err(HandlerError::Conflict(
                ErrorCode::OpponentDisconnected,
                "Opponent has disconnected".into(),
            ));
        }
        Ok(opponent)
    }

    async fn start_rematch(self: &Arc<Self>, game: &SharedSession, player: PlayerId) -> Result<(), HandlerError> {
        let (view, generation) = {
            let mut g = game.write().await;
            let generation = g.start_rematch(&player, self.config.session.rematch_countdown_from)?;
            (GameView::of(&g), generation)
        };
        let accepter = self.player_info(&player).await?;
        info!("Rematch in {} starting", view.game_id.short());

        let msg = ServerMessage::RematchAccept {
            game_id: view.game_id,
            accepted_by: accepter.username,
            accepted_by_id: player,
        };
        self.directory.deliver_all(&view.everyone(), &msg).await;

        self.leave_lobby_all(&view.principals).await;
        self.broadcast_games().await;
        tokio::spawn(game_loop::run_rematch_countdown(Arc::clone(self), view.game_id, generation));
        Ok(())
    }

    // =========================================================================
    // SIGNALING
    // =========================================================================

    async fn relay(&self, player: PlayerId, kind: SignalKind, relay: PeerRelay) -> Result<(), HandlerError> {
        let target = relay.to_player_id;
        if target == player {
            return Err(HandlerError::Conflict(
                ErrorCode::InvalidTarget,
                "Cannot signal yourself".into(),
            ));
        }
        if !self.directory.is_live(&target).await {
            return Err(HandlerError::player_not_found());
        }

        self.mailbox.store(kind, player, target, relay.payload.clone()).await;
        let signal = PeerSignal {
            from_player_id: player,
            payload: relay.payload,
        };
        let msg = match kind {
            SignalKind::Offer => ServerMessage::PeerOffer(signal),
            SignalKind::Answer => ServerMessage::PeerAnswer(signal),
            SignalKind::IceCandidate => ServerMessage::PeerIceCandidate(signal),
        };
        if !self.directory.deliver(&target, msg).await {
            debug!("Signal for {} not delivered", target.short());
        }
        Ok(())
    }

    // =========================================================================
    // HOUSEKEEPING
    // =========================================================================

    /// Delete finished games none of whose principals is still connected.
    pub async fn prune_finished(&self) -> usize {
        let mut pruned = 0;
        for game in self.games.all().await {
            let (id, principals) = {
                let g = game.read().await;
                if g.status() != GameStatus::Finished {
                    continue;
                }
                (g.id, g.principals())
            };
            let mut any_live = false;
            for p in &principals {
                any_live |= self.directory.is_live(p).await;
            }
            if !any_live {
                self.games.remove(&id).await;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned {} finished games", pruned);
        }
        pruned
    }

    // =========================================================================
    // FAN-OUT
    // =========================================================================

    /// Enqueue a message for one player.
    pub(crate) async fn send(&self, player: &PlayerId, msg: ServerMessage) {
        if !self.directory.deliver(player, msg).await {
            debug!("Dropped message for {}", player.short());
        }
    }

    /// Send a game view to its principals and spectators.
    pub(crate) async fn publish(&self, view: &GameView, phase: Phase) {
        let data = view.snapshot.clone();
        let to_principals = match phase {
            Phase::Update => ServerMessage::GameUpdate { data },
            Phase::Start => ServerMessage::GameStart { data },
            Phase::Over => ServerMessage::GameOver { data },
        };
        self.directory.deliver_all(&view.principals, &to_principals).await;

        if view.spectators.is_empty() {
            return;
        }
        let to_spectators = match phase {
            Phase::Over => ServerMessage::GameOver {
                data: view.snapshot.clone(),
            },
            _ => ServerMessage::SpectatorUpdate {
                game_id: view.game_id,
                data: view.snapshot.clone(),
            },
        };
        self.directory.deliver_all(&view.spectators, &to_spectators).await;
    }

    /// Send a rematch countdown step.
    pub(crate) async fn publish_rematch_countdown(&self, view: &GameView) {
        let msg = ServerMessage::RematchCountdown {
            game_id: view.game_id,
            countdown: view.snapshot.countdown,
        };
        self.directory.deliver_all(&view.everyone(), &msg).await;
    }

    /// A round started: principals leave the lobby.
    pub(crate) async fn round_started(&self, view: &GameView) {
        self.publish(view, Phase::Start).await;
        self.leave_lobby_all(&view.principals).await;
        self.broadcast_games().await;
    }

    /// A round ended: connected principals go back to the lobby.
    pub(crate) async fn round_finished(&self, view: &GameView) {
        self.publish(view, Phase::Over).await;
        for player in &view.principals {
            if self.directory.is_live(player).await {
                self.lobby.add(*player).await;
            }
        }
        self.broadcast_lobby().await;
        self.broadcast_games().await;
    }

    async fn enter_lobby(&self, player: &PlayerId) {
        if self.lobby.add(*player).await {
            self.broadcast_lobby().await;
        } else {
            let players = self.lobby_entries().await;
            self.send(player, ServerMessage::LobbyStatus { players }).await;
        }
    }

    async fn leave_lobby_all(&self, players: &[PlayerId]) {
        let mut changed = false;
        for player in players {
            changed |= self.lobby.remove(player).await;
        }
        if changed {
            self.broadcast_lobby().await;
        }
    }

    /// Lobby rows with ready/in-game flags from non-finished games.
    pub async fn lobby_entries(&self) -> Vec<LobbyEntry> {
        let members = self.lobby.members().await;

        let mut busy = std::collections::BTreeMap::new();
        for game in self.games.all().await {
            let g = game.read().await;
            if g.status() == GameStatus::Finished {
                continue;
            }
            for player in &members {
                if let Some(slot) = g.slot_of(player) {
                    busy.insert(*player, slot.ready);
                }
            }
        }

        let mut entries = Vec::with_capacity(members.len());
        for id in members {
            if let Some(record) = self.directory.get(&id).await {
                entries.push(LobbyEntry {
                    id,
                    username: record.username,
                    ready: busy.get(&id).copied().unwrap_or(false),
                    joined_at: record.joined_at,
                    in_game: busy.contains_key(&id),
                });
            }
        }
        entries
    }

    /// Listing of all non-finished games.
    pub async fn game_listings(&self) -> Vec<GameListing> {
        let mut listings = Vec::new();
        for game in self.games.all().await {
            let g = game.read().await;
            if g.status() != GameStatus::Finished {
                listings.push(g.listing());
            }
        }
        listings
    }

    /// Send the lobby to its members.
    pub(crate) async fn broadcast_lobby(&self) {
        let players = self.lobby_entries().await;
        let members: Vec<PlayerId> = players.iter().map(|e| e.id).collect();
        self.directory
            .deliver_all(&members, &ServerMessage::LobbyStatus { players })
            .await;
    }

    /// Send the game listing to every connected player.
    pub(crate) async fn broadcast_games(&self) {
        let games = self.game_listings().await;
        self.directory.broadcast(&ServerMessage::GamesList { games }).await;
    }

    async fn game(&self, game_id: &GameId) -> Result<SharedSession, HandlerError> {
        self.games.get(game_id).await.ok_or_else(HandlerError::game_not_found)
    }

    async fn player_info(&self, player: &PlayerId) -> Result<PlayerInfo, HandlerError> {
        self.directory.info(player).await.ok_or_else(HandlerError::player_not_found)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::outbound::OutboxReceiver;

    fn coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(CoordinatorConfig::default(), AuthConfig::default()))
    }

    async fn join(coord: &Arc<Coordinator>, name: &str) -> (PlayerId, OutboxReceiver) {
        let (outbox, rx) = Outbox::new(64);
        let id = coord
            .connect(Credentials::Username(name.into()), outbox)
            .await
            .unwrap();
        (id, rx)
    }

    fn drain(rx: &mut OutboxReceiver) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_handler_error_codes() {
        let err: HandlerError = SessionError::NotAPlayer.into();
        assert_eq!(err.code(), ErrorCode::NotAPlayer);
        assert!(!err.closes_connection());

        let auth = HandlerError::Auth(ErrorCode::InvalidToken, "bad".into());
        assert!(auth.closes_connection());
        assert!(HandlerError::Validation("x".into()).to_message().is_none());
    }

    #[tokio::test]
    async fn test_connect_by_username_joins_lobby() {
        let coord = coordinator();
        let (id, mut rx) = join(&coord, "alice").await;

        let msgs = drain(&mut rx);
        assert!(matches!(&msgs[0], ServerMessage::Connected { player, .. } if player.id == id));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::LobbyStatus { players } if players.len() == 1)));
        assert!(coord.lobby().contains(&id).await);
    }

    #[tokio::test]
    async fn test_username_taken() {
        let coord = coordinator();
        let _alice = join(&coord, "alice").await;

        let (outbox, _rx) = Outbox::new(8);
        let result = coord.connect(Credentials::Username(" ALICE ".into()), outbox).await;
        assert!(matches!(result, Err(HandlerError::Conflict(ErrorCode::UsernameExists, _))));
    }

    #[tokio::test]
    async fn test_empty_username_rejected() {
        let coord = coordinator();
        let (outbox, _rx) = Outbox::new(8);
        let result = coord.connect(Credentials::Username("   ".into()), outbox).await;
        assert!(matches!(result, Err(HandlerError::Auth(ErrorCode::InvalidMessage, _))));
        assert!(coord.directory().is_empty().await);
    }

    #[tokio::test]
    async fn test_request_self_and_unknown() {
        let coord = coordinator();
        let (a, _ra) = join(&coord, "a").await;

        let result = coord.dispatch(a, ClientMessage::GameRequest { target_id: a }).await;
        assert!(matches!(result, Err(HandlerError::Conflict(ErrorCode::InvalidTarget, _))));

        let result = coord
            .dispatch(a, ClientMessage::GameRequest { target_id: PlayerId::random() })
            .await;
        assert!(matches!(result, Err(HandlerError::NotFound(ErrorCode::PlayerNotFound, _))));
    }

    #[tokio::test]
    async fn test_invalid_frame_is_ignored() {
        let coord = coordinator();
        let (a, mut ra) = join(&coord, "a").await;
        drain(&mut ra);

        assert!(coord.handle_frame(a, "{\"type\":\"nonsense\"}\nnot json").await);
        assert!(drain(&mut ra).is_empty());
    }

    #[tokio::test]
    async fn test_get_game_state_requires_membership() {
        let coord = coordinator();
        let (a, _ra) = join(&coord, "a").await;
        let (b, _rb) = join(&coord, "b").await;
        let (c, _rc) = join(&coord, "c").await;

        coord.dispatch(a, ClientMessage::GameRequest { target_id: b }).await.unwrap();
        let game_id = coord.requests().cancel(&a, &b).await.map(|r| r.game_id);
        // Edge removed by hand; the game itself still exists.
        let game_id = game_id.unwrap();

        let result = coord.dispatch(c, ClientMessage::GetGameState { game_id }).await;
        assert!(matches!(result, Err(HandlerError::Authorization(ErrorCode::NotAPlayer, _))));
        assert!(coord.dispatch(a, ClientMessage::GetGameState { game_id }).await.is_ok());

        let result = coord
            .dispatch(a, ClientMessage::GetGameState { game_id: GameId::random() })
            .await;
        assert!(matches!(result, Err(HandlerError::NotFound(ErrorCode::GameNotFound, _))));
    }

    #[tokio::test]
    async fn test_peer_relay() {
        let coord = coordinator();
        let (a, _ra) = join(&coord, "a").await;
        let (b, mut rb) = join(&coord, "b").await;
        drain(&mut rb);

        let relay = PeerRelay {
            to_player_id: b,
            payload: serde_json::json!({"sdp": "v=0"}),
        };
        coord.dispatch(a, ClientMessage::PeerOffer(relay)).await.unwrap();

        let msgs = drain(&mut rb);
        assert!(matches!(
            &msgs[..],
            [ServerMessage::PeerOffer(signal)] if signal.from_player_id == a && signal.payload["sdp"] == "v=0"
        ));
        assert!(coord.mailbox().get(&a, &b).await.is_some());

        let relay = PeerRelay {
            to_player_id: PlayerId::random(),
            payload: serde_json::Value::Null,
        };
        let result = coord.dispatch(a, ClientMessage::PeerAnswer(relay)).await;
        assert!(matches!(result, Err(HandlerError::NotFound(ErrorCode::PlayerNotFound, _))));
    }

    #[tokio::test]
    async fn test_prune_finished_keeps_live() {
        let coord = coordinator();
        let (a, _ra) = join(&coord, "a").await;
        let info = coord.directory().info(&a).await.unwrap();

        let mut game = GameSession::new_solo(GameId::random(), &info, coord.config().session.grid);
        game.begin_round().unwrap();
        game.finish(None, None).unwrap();
        coord.games().insert(game).await;

        assert_eq!(coord.prune_finished().await, 0);
        coord.directory().take_link(&a).await.unwrap().close();
        assert_eq!(coord.prune_finished().await, 1);
    }
}
