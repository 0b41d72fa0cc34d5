//! Game Session Management
//!
//! One `GameSession` per match: principals, spectators, the status
//! machine, and the arena while a round is running. Sessions are stored
//! behind their own lock in the `GameTable`, so unrelated matches never
//! contend with each other.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

use crate::core::grid::{Direction, GridSize};
use crate::core::rng::DeterministicRng;
use crate::game::collision::RoundOutcome;
use crate::game::state::{ArenaState, GameId, GameStatus, PlayerId, Seat};
use crate::network::protocol::{Food, GameListing, GameSnapshot, PlayerInfo, PlayerStatus};

/// Reason recorded when a principal leaves a running round.
pub const REASON_DISCONNECT: &str = "disconnect";

/// Winner value for a drawn round.
pub const WINNER_TIE: &str = "tie";

/// Timing and board settings shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Board size.
    pub grid: GridSize,
    /// Simulation period.
    pub tick_interval: Duration,
    /// Time between countdown steps.
    pub countdown_step: Duration,
    /// First value of the pre-match countdown.
    pub countdown_from: u32,
    /// First value of the rematch countdown.
    pub rematch_countdown_from: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grid: GridSize::default(),
            tick_interval: Duration::from_millis(100),
            countdown_step: Duration::from_secs(1),
            countdown_from: 3,
            rematch_countdown_from: 5,
        }
    }
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Sender is not a principal.
    #[error("Not a player in this game")]
    NotAPlayer,

    /// Sender is already a principal.
    #[error("Already a player in this game")]
    AlreadyPlayer,

    /// Operation not allowed in the current status.
    #[error("Invalid state: {0}")]
    InvalidState(GameStatus),

    /// Status edge does not exist.
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: GameStatus,
        /// Requested status.
        to: GameStatus,
    },
}

/// A principal seat.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Occupant.
    pub player: PlayerId,
    /// Occupant's display name.
    pub username: String,
    /// Ready flag for the next start.
    pub ready: bool,
}

impl Slot {
    fn new(info: &PlayerInfo) -> Self {
        Self {
            player: info.id,
            username: info.username.clone(),
            ready: false,
        }
    }

    fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.player,
            username: self.username.clone(),
        }
    }

    fn seat(&self) -> Seat {
        Seat {
            id: self.player,
            username: self.username.clone(),
        }
    }
}

/// Stop handle of a running tick loop.
///
/// Stopping is idempotent: the first call fires the signal, later calls
/// find nothing to fire.
#[derive(Debug, Default)]
pub struct TickerHandle(Option<oneshot::Sender<()>>);

impl TickerHandle {
    /// Arm a new loop, returning the receiver it should watch.
    /// Any previous loop is stopped first.
    pub fn arm(&mut self) -> oneshot::Receiver<()> {
        self.stop();
        let (tx, rx) = oneshot::channel();
        self.0 = Some(tx);
        rx
    }

    /// Stop the loop. Returns true if a loop was signalled.
    pub fn stop(&mut self) -> bool {
        match self.0.take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// One match.
#[derive(Debug)]
pub struct GameSession {
    /// Game id.
    pub id: GameId,
    /// Slot A (the requester, or the solo player).
    pub slot_a: Slot,
    /// Slot B (the target); empty for solo games.
    pub slot_b: Option<Slot>,
    /// Spectators.
    pub spectators: BTreeSet<PlayerId>,
    /// Current countdown value, 0 outside countdowns.
    pub countdown: u32,
    /// Round counter; 0 before the first round.
    pub round: u32,
    /// Bumped whenever a countdown starts, so stale countdown tasks exit.
    pub generation: u64,
    status: GameStatus,
    arena: Option<ArenaState>,
    winner: Option<String>,
    reason: Option<String>,
    rematch_votes: BTreeSet<PlayerId>,
    ticker: TickerHandle,
    grid: GridSize,
}

impl GameSession {
    /// Two-player game created by a request, waiting for ready flags.
    pub fn new_duel(id: GameId, requester: &PlayerInfo, target: &PlayerInfo, grid: GridSize) -> Self {
        Self::build(id, Slot::new(requester), Some(Slot::new(target)), GameStatus::Waiting, grid)
    }

    /// Solo game. The only slot is ready and the countdown starts at once.
    pub fn new_solo(id: GameId, player: &PlayerInfo, grid: GridSize) -> Self {
        let mut slot = Slot::new(player);
        slot.ready = true;
        Self::build(id, slot, None, GameStatus::Countdown, grid)
    }

    fn build(id: GameId, slot_a: Slot, slot_b: Option<Slot>, status: GameStatus, grid: GridSize) -> Self {
        Self {
            id,
            slot_a,
            slot_b,
            spectators: BTreeSet::new(),
            countdown: 0,
            round: 0,
            generation: 0,
            status,
            arena: None,
            winner: None,
            reason: None,
            rematch_votes: BTreeSet::new(),
            ticker: TickerHandle::default(),
            grid,
        }
    }

    /// Current status.
    pub fn status(&self) -> GameStatus {
        self.status
    }

    /// Winner of the last round (player id or `"tie"`).
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Why the last round ended, when it was not a collision.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Whether this is a solo game.
    pub fn is_solo(&self) -> bool {
        self.slot_b.is_none()
    }

    /// Whether `player` occupies a slot.
    pub fn is_principal(&self, player: &PlayerId) -> bool {
        self.slot_a.player == *player
            || self.slot_b.as_ref().map(|s| s.player == *player).unwrap_or(false)
    }

    /// Whether `player` is watching.
    pub fn is_spectator(&self, player: &PlayerId) -> bool {
        self.spectators.contains(player)
    }

    /// The other principal, if any.
    pub fn opponent_of(&self, player: &PlayerId) -> Option<&Slot> {
        let b = self.slot_b.as_ref()?;
        if self.slot_a.player == *player {
            Some(b)
        } else if b.player == *player {
            Some(&self.slot_a)
        } else {
            None
        }
    }

    /// Slot of `player`.
    pub fn slot_of(&self, player: &PlayerId) -> Option<&Slot> {
        if self.slot_a.player == *player {
            return Some(&self.slot_a);
        }
        self.slot_b.as_ref().filter(|s| s.player == *player)
    }

    fn slot_of_mut(&mut self, player: &PlayerId) -> Option<&mut Slot> {
        if self.slot_a.player == *player {
            return Some(&mut self.slot_a);
        }
        self.slot_b.as_mut().filter(|s| s.player == *player)
    }

    /// Principal ids in slot order.
    pub fn principals(&self) -> Vec<PlayerId> {
        let mut ids = vec![self.slot_a.player];
        if let Some(b) = &self.slot_b {
            ids.push(b.player);
        }
        ids
    }

    /// Spectator ids.
    pub fn spectator_ids(&self) -> Vec<PlayerId> {
        self.spectators.iter().copied().collect()
    }

    /// Move along a status edge.
    pub fn transition(&mut self, next: GameStatus) -> Result<(), SessionError> {
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!("Game {} {} -> {}", self.id.short(), self.status, next);
        self.status = next;
        Ok(())
    }

    /// Set a principal's ready flag. Returns whether every slot is ready.
    pub fn set_ready(&mut self, player: &PlayerId) -> Result<bool, SessionError> {
        if self.status != GameStatus::Waiting {
            return Err(SessionError::InvalidState(self.status));
        }
        let slot = self.slot_of_mut(player).ok_or(SessionError::NotAPlayer)?;
        slot.ready = true;
        Ok(self.all_ready())
    }

    /// Whether every occupied slot is ready.
    pub fn all_ready(&self) -> bool {
        self.slot_a.ready && self.slot_b.as_ref().map(|s| s.ready).unwrap_or(true)
    }

    /// Enter the pre-match countdown. Bumps the generation.
    pub fn start_countdown(&mut self, from: u32) -> Result<u64, SessionError> {
        if self.status != GameStatus::Countdown {
            self.transition(GameStatus::Countdown)?;
        }
        self.countdown = from;
        self.generation += 1;
        Ok(self.generation)
    }

    /// Spawn a fresh arena and start playing.
    ///
    /// Scores, positions and food are reset; the food RNG is derived from
    /// the game id and the round counter.
    pub fn begin_round(&mut self) -> Result<(), SessionError> {
        self.transition(GameStatus::Playing)?;
        self.round += 1;
        let rng = DeterministicRng::for_round(self.id.as_bytes(), self.round);
        let arena = match &self.slot_b {
            Some(b) => ArenaState::duel(self.grid, rng, &self.slot_a.seat(), &b.seat()),
            None => ArenaState::solo(self.grid, rng, &self.slot_a.seat()),
        };
        self.arena = Some(arena);
        self.countdown = 0;
        self.winner = None;
        self.reason = None;
        Ok(())
    }

    /// Stage a direction for the next tick.
    ///
    /// Non-principals are refused. Outside `playing`, and on reversal, the
    /// move is silently dropped.
    pub fn stage_move(&mut self, player: &PlayerId, direction: Direction) -> Result<bool, SessionError> {
        if !self.is_principal(player) {
            return Err(SessionError::NotAPlayer);
        }
        if self.status != GameStatus::Playing {
            return Ok(false);
        }
        Ok(self
            .arena
            .as_mut()
            .and_then(|arena| arena.snake_mut(player))
            .map(|snake| snake.stage_direction(direction))
            .unwrap_or(false))
    }

    /// Arena of the current (or last) round.
    pub fn arena(&self) -> Option<&ArenaState> {
        self.arena.as_ref()
    }

    /// Mutable arena, only while playing.
    pub fn arena_mut(&mut self) -> Option<&mut ArenaState> {
        if self.status == GameStatus::Playing {
            self.arena.as_mut()
        } else {
            None
        }
    }

    /// Arm the tick loop stop signal.
    pub fn arm_ticker(&mut self) -> oneshot::Receiver<()> {
        self.ticker.arm()
    }

    /// End the round. Stops the tick loop and clears ready flags and votes.
    pub fn finish(&mut self, winner: Option<String>, reason: Option<&str>) -> Result<(), SessionError> {
        self.transition(GameStatus::Finished)?;
        self.ticker.stop();
        self.winner = winner;
        self.reason = reason.map(str::to_string);
        self.countdown = 0;
        self.slot_a.ready = false;
        if let Some(b) = self.slot_b.as_mut() {
            b.ready = false;
        }
        self.rematch_votes.clear();
        Ok(())
    }

    /// Apply a tick outcome. Returns true if the round ended.
    pub fn apply_outcome(&mut self, outcome: RoundOutcome) -> Result<bool, SessionError> {
        let winner = match outcome {
            RoundOutcome::Continue => return Ok(false),
            RoundOutcome::Winner(id) => Some(id.to_string()),
            RoundOutcome::Tie => Some(WINNER_TIE.to_string()),
            RoundOutcome::SoloLoss => None,
        };
        self.finish(winner, None)?;
        Ok(true)
    }

    /// Stop the tick loop without changing status (game being deleted).
    pub fn stop_ticker(&mut self) -> bool {
        self.ticker.stop()
    }

    /// Record a rematch vote. Returns whether the opponent already voted.
    pub fn vote_rematch(&mut self, player: &PlayerId) -> Result<bool, SessionError> {
        self.check_rematch(player)?;
        self.rematch_votes.insert(*player);
        Ok(self.opponent_voted(player))
    }

    /// Whether the opponent of `player` asked for a rematch.
    pub fn opponent_voted(&self, player: &PlayerId) -> bool {
        self.opponent_of(player)
            .map(|o| self.rematch_votes.contains(&o.player))
            .unwrap_or(false)
    }

    fn check_rematch(&self, player: &PlayerId) -> Result<(), SessionError> {
        if !self.is_principal(player) {
            return Err(SessionError::NotAPlayer);
        }
        if self.is_solo() || self.status != GameStatus::Finished {
            return Err(SessionError::InvalidState(self.status));
        }
        Ok(())
    }

    /// Enter the rematch countdown. Requires the opponent's vote.
    pub fn start_rematch(&mut self, player: &PlayerId, from: u32) -> Result<u64, SessionError> {
        self.check_rematch(player)?;
        if !self.opponent_voted(player) {
            return Err(SessionError::InvalidState(self.status));
        }
        self.transition(GameStatus::RematchCountdown)?;
        self.rematch_votes.clear();
        self.winner = None;
        self.reason = None;
        self.countdown = from;
        self.generation += 1;
        Ok(self.generation)
    }

    /// Add a spectator. Returns false if already watching.
    pub fn add_spectator(&mut self, player: PlayerId) -> Result<bool, SessionError> {
        if self.is_principal(&player) {
            return Err(SessionError::AlreadyPlayer);
        }
        Ok(self.spectators.insert(player))
    }

    /// Remove a spectator. Returns false if not watching.
    pub fn remove_spectator(&mut self, player: &PlayerId) -> bool {
        self.spectators.remove(player)
    }

    /// Full state as sent to clients.
    pub fn snapshot(&self) -> GameSnapshot {
        let (snakes, food) = match &self.arena {
            Some(arena) => (arena.snakes.clone(), arena.food),
            None => (Vec::new(), Default::default()),
        };
        let mut players = vec![status_of(&self.slot_a)];
        if let Some(b) = &self.slot_b {
            players.push(status_of(b));
        }

        GameSnapshot {
            id: self.id,
            snakes,
            food: Food { position: food },
            status: self.status,
            countdown: self.countdown,
            winner: self.winner.clone(),
            players,
            is_single_player: self.is_solo(),
            reason: self.reason.clone(),
        }
    }

    /// Row for `games_list`. Scores are only included while playing.
    pub fn listing(&self) -> GameListing {
        let scores = match (&self.arena, self.status) {
            (Some(arena), GameStatus::Playing) => Some(
                arena
                    .snakes
                    .iter()
                    .map(|s| (s.username.clone(), s.score))
                    .collect::<BTreeMap<_, _>>(),
            ),
            _ => None,
        };

        GameListing {
            id: self.id,
            player1: self.slot_a.info(),
            player2: self.slot_b.as_ref().map(Slot::info),
            status: self.status,
            spectators: self.spectators.len(),
            scores,
            is_single_player: self.is_solo(),
        }
    }
}

fn status_of(slot: &Slot) -> PlayerStatus {
    PlayerStatus {
        id: slot.player,
        username: slot.username.clone(),
        ready: slot.ready,
    }
}

/// Shared handle to one session.
pub type SharedSession = Arc<RwLock<GameSession>>;

/// All sessions, keyed by id.
///
/// The table lock only guards membership; each session has its own lock.
#[derive(Debug, Default)]
pub struct GameTable {
    games: RwLock<BTreeMap<GameId, SharedSession>>,
}

impl GameTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning its shared handle.
    pub async fn insert(&self, session: GameSession) -> SharedSession {
        let id = session.id;
        let shared = Arc::new(RwLock::new(session));
        self.games.write().await.insert(id, shared.clone());
        shared
    }

    /// Look up a session.
    pub async fn get(&self, id: &GameId) -> Option<SharedSession> {
        self.games.read().await.get(id).cloned()
    }

    /// Remove a session from the table.
    pub async fn remove(&self, id: &GameId) -> Option<SharedSession> {
        self.games.write().await.remove(id)
    }

    /// Every session, in id order.
    pub async fn all(&self) -> Vec<SharedSession> {
        self.games.read().await.values().cloned().collect()
    }

    /// Sessions where `player` is a principal.
    pub async fn games_of(&self, player: &PlayerId) -> Vec<SharedSession> {
        let mut found = Vec::new();
        for game in self.all().await {
            if game.read().await.is_principal(player) {
                found.push(game);
            }
        }
        found
    }

    /// Number of sessions.
    pub async fn len(&self) -> usize {
        self.games.read().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.games.read().await.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
