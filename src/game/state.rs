//! Game State Definitions
//!
//! Identifiers, snakes, the match status machine and the arena a round
//! is played on. Snakes are kept in slot order (A first) so every scan
//! over them is deterministic.

use std::collections::VecDeque;
use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::grid::{Cell, Direction, GridSize};
use crate::core::rng::DeterministicRng;

// =============================================================================
// IDENTIFIERS
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        ///
        /// Serialized on the wire as a hyphenated UUID string.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[derive(Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(pub [u8; 16]);

        impl $name {
            /// Create from raw bytes.
            pub const fn new(bytes: [u8; 16]) -> Self {
                Self(bytes)
            }

            /// Fresh random (v4) identifier.
            pub fn random() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            /// Create from UUID string.
            pub fn from_uuid_str(s: &str) -> Option<Self> {
                uuid::Uuid::parse_str(s)
                    .ok()
                    .map(|u| Self(*u.as_bytes()))
            }

            /// Convert to UUID string.
            pub fn to_uuid_string(&self) -> String {
                uuid::Uuid::from_bytes(self.0).to_string()
            }

            /// Get raw bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }

            /// Short hex prefix for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_uuid_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_uuid_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                Self::from_uuid_str(&s).ok_or_else(|| format!("invalid id: {}", s))
            }
        }
    };
}

uuid_id!(
    /// Unique player identifier.
    PlayerId
);

uuid_id!(
    /// Unique game identifier.
    GameId
);

// =============================================================================
// CONSTANTS
// =============================================================================

/// Initial snake length in cells.
pub const SNAKE_START_LENGTH: usize = 3;

/// Distance of the two-player spawns from the side edges.
pub const SPAWN_MARGIN: i32 = 5;

/// Colour of the snake in slot A.
pub const COLOR_SLOT_A: &str = "#FF0000";

/// Colour of the snake in slot B.
pub const COLOR_SLOT_B: &str = "#0000FF";

/// Colour of a solo snake.
pub const COLOR_SOLO: &str = "#4CAF50";

/// Random draws before falling back to a board scan when placing food.
pub const MAX_FOOD_ATTEMPTS: usize = 256;

// =============================================================================
// GAME STATUS
// =============================================================================

/// Lifecycle status of a game.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Created by a request, waiting for ready flags.
    Waiting,
    /// Counting down to the first round.
    Countdown,
    /// Tick loop running.
    Playing,
    /// Round over.
    Finished,
    /// Both principals agreed to a rematch, counting down.
    RematchCountdown,
}

impl GameStatus {
    /// Whether `next` is a documented edge out of this status.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (GameStatus::Waiting, GameStatus::Countdown)
                | (GameStatus::Countdown, GameStatus::Playing)
                | (GameStatus::Playing, GameStatus::Finished)
                | (GameStatus::Finished, GameStatus::RematchCountdown)
                | (GameStatus::RematchCountdown, GameStatus::Playing)
        )
    }

    /// Not yet started: a principal leaving cancels the game.
    pub fn is_pre_play(self) -> bool {
        matches!(
            self,
            GameStatus::Waiting | GameStatus::Countdown | GameStatus::RematchCountdown
        )
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GameStatus::Waiting => "waiting",
            GameStatus::Countdown => "countdown",
            GameStatus::Playing => "playing",
            GameStatus::Finished => "finished",
            GameStatus::RematchCountdown => "rematch_countdown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// SNAKE
// =============================================================================

/// One principal's snake.
///
/// `body[0]` is the head. The body is never empty.
#[derive(Clone, Debug, Serialize)]
pub struct Snake {
    /// Owning player.
    #[serde(rename = "id")]
    pub owner: PlayerId,
    /// Cells from head to tail.
    pub body: VecDeque<Cell>,
    /// Direction applied on the last tick.
    pub direction: Direction,
    /// Direction to apply on the next tick.
    #[serde(skip)]
    pub pending: Direction,
    /// Display colour.
    pub color: String,
    /// Food eaten this round.
    pub score: u32,
    /// Owner's display name.
    pub username: String,
}

impl Snake {
    /// Spawn a straight snake with its tail trailing behind `head`.
    pub fn spawn(
        owner: PlayerId,
        username: &str,
        color: &str,
        head: Cell,
        direction: Direction,
        grid: &GridSize,
    ) -> Self {
        let mut body = VecDeque::with_capacity(SNAKE_START_LENGTH);
        let mut cell = head;
        body.push_back(cell);
        for _ in 1..SNAKE_START_LENGTH {
            cell = grid.step(cell, direction.opposite());
            body.push_back(cell);
        }

        Self {
            owner,
            body,
            direction,
            pending: direction,
            color: color.to_string(),
            score: 0,
            username: username.to_string(),
        }
    }

    /// Head cell.
    #[inline]
    pub fn head(&self) -> Cell {
        // body is never empty
        self.body[0]
    }

    /// Stage a direction for the next tick.
    ///
    /// Returns false (and leaves the staged direction alone) when `dir`
    /// reverses the current direction.
    pub fn stage_direction(&mut self, dir: Direction) -> bool {
        if dir == self.direction.opposite() {
            return false;
        }
        self.pending = dir;
        true
    }

    /// Whether any cell of the snake is `cell`.
    pub fn occupies(&self, cell: Cell) -> bool {
        self.body.contains(&cell)
    }

    /// Whether a non-head cell of the snake is `cell`.
    pub fn body_hits(&self, cell: Cell) -> bool {
        self.body.iter().skip(1).any(|c| *c == cell)
    }
}

// =============================================================================
// PRINCIPAL SEAT
// =============================================================================

/// The parts of a principal the arena needs to spawn a snake.
#[derive(Clone, Debug)]
pub struct Seat {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
}

// =============================================================================
// ARENA
// =============================================================================

/// Board contents for one round.
#[derive(Clone, Debug)]
pub struct ArenaState {
    /// Board size.
    pub grid: GridSize,
    /// Snakes in slot order.
    pub snakes: Vec<Snake>,
    /// Current food cell.
    pub food: Cell,
    /// Food RNG for this round.
    pub rng: DeterministicRng,
}

impl ArenaState {
    /// Mirrored two-player spawn: A on the left facing right, B on the
    /// right facing left, both on the middle row.
    pub fn duel(grid: GridSize, rng: DeterministicRng, a: &Seat, b: &Seat) -> Self {
        let row = grid.height / 2;
        let snakes = vec![
            Snake::spawn(
                a.id,
                &a.username,
                COLOR_SLOT_A,
                Cell::new(SPAWN_MARGIN.min(grid.width - 1), row),
                Direction::Right,
                &grid,
            ),
            Snake::spawn(
                b.id,
                &b.username,
                COLOR_SLOT_B,
                Cell::new((grid.width - SPAWN_MARGIN).max(0), row),
                Direction::Left,
                &grid,
            ),
        ];
        Self::with_snakes(grid, rng, snakes)
    }

    /// Solo spawn in the centre of the board facing right.
    pub fn solo(grid: GridSize, rng: DeterministicRng, seat: &Seat) -> Self {
        let snakes = vec![Snake::spawn(
            seat.id,
            &seat.username,
            COLOR_SOLO,
            Cell::new(grid.width / 2, grid.height / 2),
            Direction::Right,
            &grid,
        )];
        Self::with_snakes(grid, rng, snakes)
    }

    fn with_snakes(grid: GridSize, mut rng: DeterministicRng, snakes: Vec<Snake>) -> Self {
        // Boards below the configured minimum are rejected before a game
        // is created, so a fresh spawn always leaves a free cell.
        let food = place_food(&mut rng, &grid, &snakes).unwrap_or_default();
        Self {
            grid,
            snakes,
            food,
            rng,
        }
    }

    /// Snake owned by `player`.
    pub fn snake_mut(&mut self, player: &PlayerId) -> Option<&mut Snake> {
        self.snakes.iter_mut().find(|s| s.owner == *player)
    }
}

/// Pick a food cell not covered by any snake.
///
/// Uniform random draws first, then the first free cell in row-major
/// order. `None` only when every cell is covered.
pub fn place_food(rng: &mut DeterministicRng, grid: &GridSize, snakes: &[Snake]) -> Option<Cell> {
    let covered = |cell: Cell| snakes.iter().any(|s| s.occupies(cell));

    for _ in 0..MAX_FOOD_ATTEMPTS {
        let cell = rng.random_cell(grid);
        if !covered(cell) {
            return Some(cell);
        }
    }

    grid.cells().find(|c| !covered(*c))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn seat(n: u8, name: &str) -> Seat {
        Seat {
            id: PlayerId::new([n; 16]),
            username: name.to_string(),
        }
    }

    #[test]
    fn test_player_id_roundtrip_string() {
        let id = PlayerId::random();
        let s = id.to_uuid_string();
        assert_eq!(PlayerId::from_uuid_str(&s), Some(id));
        assert_eq!(PlayerId::from_uuid_str("not-a-uuid"), None);
    }

    #[test]
    fn test_id_serializes_as_string() {
        let id = GameId::new([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_uuid_string()));
        let back: GameId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_status_edges() {
        use GameStatus::*;
        assert!(Waiting.can_transition_to(Countdown));
        assert!(Countdown.can_transition_to(Playing));
        assert!(Playing.can_transition_to(Finished));
        assert!(Finished.can_transition_to(RematchCountdown));
        assert!(RematchCountdown.can_transition_to(Playing));

        assert!(!Waiting.can_transition_to(Playing));
        assert!(!Finished.can_transition_to(Playing));
        assert!(!Playing.can_transition_to(Countdown));
        assert!(!Countdown.can_transition_to(Countdown));
    }

    #[test]
    fn test_duel_spawn_is_mirrored() {
        let grid = GridSize::default();
        let arena = ArenaState::duel(grid, DeterministicRng::new(1), &seat(1, "a"), &seat(2, "b"));

        let a = &arena.snakes[0];
        let b = &arena.snakes[1];
        assert_eq!(
            a.body.iter().copied().collect::<Vec<_>>(),
            vec![Cell::new(5, 15), Cell::new(4, 15), Cell::new(3, 15)]
        );
        assert_eq!(
            b.body.iter().copied().collect::<Vec<_>>(),
            vec![Cell::new(35, 15), Cell::new(36, 15), Cell::new(37, 15)]
        );
        assert_eq!(a.direction, Direction::Right);
        assert_eq!(b.direction, Direction::Left);
        assert_eq!(a.color, COLOR_SLOT_A);
        assert_eq!(b.color, COLOR_SLOT_B);
        assert!(!a.occupies(arena.food));
        assert!(!b.occupies(arena.food));
    }

    #[test]
    fn test_solo_spawn_centre() {
        let grid = GridSize::default();
        let arena = ArenaState::solo(grid, DeterministicRng::new(1), &seat(1, "a"));
        assert_eq!(arena.snakes.len(), 1);
        assert_eq!(arena.snakes[0].head(), Cell::new(20, 15));
        assert_eq!(arena.snakes[0].color, COLOR_SOLO);
    }

    #[test]
    fn test_reverse_not_staged() {
        let grid = GridSize::default();
        let mut snake = Snake::spawn(
            PlayerId::new([1; 16]), "a", COLOR_SOLO, Cell::new(5, 5), Direction::Right, &grid,
        );

        assert!(!snake.stage_direction(Direction::Left));
        assert_eq!(snake.pending, Direction::Right);

        assert!(snake.stage_direction(Direction::Up));
        assert_eq!(snake.pending, Direction::Up);
    }

    #[test]
    fn test_place_food_scans_when_crowded() {
        // 3x1 board with two covered cells leaves exactly one spot.
        let grid = GridSize::new(3, 1);
        let snake = Snake {
            owner: PlayerId::new([1; 16]),
            body: VecDeque::from(vec![Cell::new(0, 0), Cell::new(1, 0)]),
            direction: Direction::Left,
            pending: Direction::Left,
            color: COLOR_SOLO.into(),
            score: 0,
            username: "a".into(),
        };
        let mut rng = DeterministicRng::new(9);
        assert_eq!(place_food(&mut rng, &grid, &[snake.clone()]), Some(Cell::new(2, 0)));

        let mut full = snake;
        full.body.push_back(Cell::new(2, 0));
        assert_eq!(place_food(&mut rng, &grid, &[full]), None);
    }

    #[test]
    fn test_snake_serializes_without_pending() {
        let grid = GridSize::default();
        let snake = Snake::spawn(
            PlayerId::new([1; 16]), "alice", COLOR_SOLO, Cell::new(5, 5), Direction::Up, &grid,
        );
        let value = serde_json::to_value(&snake).unwrap();
        assert_eq!(value["direction"], "up");
        assert_eq!(value["username"], "alice");
        assert_eq!(value["body"][0]["x"], 5);
        assert!(value.get("pending").is_none());
    }
}
