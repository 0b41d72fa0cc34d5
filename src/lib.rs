//! # Snake Arena Server
//!
//! Authoritative server for real-time two-player snake matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    SNAKE ARENA SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Board primitives                          │
//! │  ├── grid.rs     - Cells, directions, wrap-around stepping   │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  game/           - Round rules (pure, deterministic)         │
//! │  ├── state.rs    - Ids, snakes, status machine, arena        │
//! │  ├── tick.rs     - One simulation step                       │
//! │  └── collision.rs- Round-ending rules                        │
//! │                                                              │
//! │  network/        - Async server                              │
//! │  ├── server.rs   - WebSocket accept loop and connections     │
//! │  ├── coordinator.rs - Client operations over shared state    │
//! │  ├── session.rs  - Per-match state machine                   │
//! │  ├── game_loop.rs- Countdowns and the tick loop              │
//! │  ├── directory.rs, lobby.rs, matchmaking.rs, signaling.rs    │
//! │  ├── outbound.rs - Bounded per-connection delivery           │
//! │  ├── auth.rs     - Token issue/validate                      │
//! │  └── protocol.rs - Message types                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! `core/` and `game/` never read the clock, and food placement draws from
//! a PRNG seeded by the game id and round number, so a round replays
//! identically from the same inputs.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::grid::{Cell, Direction, GridSize};
pub use core::rng::DeterministicRng;
pub use game::state::{GameId, GameStatus, PlayerId};
pub use network::{Coordinator, GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
