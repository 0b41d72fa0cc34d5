//! Core primitives.
//!
//! Board geometry and the seeded RNG used for food placement.
//! Nothing in here touches the clock or the network.

pub mod grid;
pub mod rng;

// Re-export core types
pub use grid::{Cell, Direction, GridSize, GRID_WIDTH, GRID_HEIGHT};
pub use rng::DeterministicRng;
