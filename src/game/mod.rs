//! Game Logic Module
//!
//! Pure round simulation. Nothing here is async or touches the clock;
//! the network layer owns timing and locking.
//!
//! ## Module Structure
//!
//! - `state`: identifiers, snakes, status machine, arena
//! - `tick`: one simulation step
//! - `collision`: round-ending rules

pub mod state;
pub mod tick;
pub mod collision;

// Re-export key types
pub use state::{ArenaState, GameId, GameStatus, PlayerId, Seat, Snake};
pub use tick::{tick, TickResult};
pub use collision::RoundOutcome;
