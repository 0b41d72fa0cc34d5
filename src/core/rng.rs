//! Deterministic Random Number Generator
//!
//! Uses Xorshift128+ algorithm for fast, deterministic food placement.
//! Given the same seed, produces identical sequence on all platforms.

use sha2::{Sha256, Digest};

use super::grid::{Cell, GridSize};

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// Each game round owns one instance, seeded from the game id and round
/// number, so a replayed round places food in the same cells.
///
/// # Example
///
/// ```
/// use snake_arena::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create RNG for one round of a game.
    pub fn for_round(game_id: &[u8; 16], round: u32) -> Self {
        Self::new(derive_game_seed(game_id, round))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Modulo bias is below 2^-32 for board-sized ranges
        (self.next_u64() % max as u64) as u32
    }

    /// Pick a uniformly random cell on the board.
    #[inline]
    pub fn random_cell(&mut self, grid: &GridSize) -> Cell {
        let x = self.next_int(grid.width as u32) as i32;
        let y = self.next_int(grid.height as u32) as i32;
        Cell::new(x, y)
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive the food seed for one round of a game.
///
/// Rematches bump `round`, so each round draws a fresh food sequence
/// while staying reproducible from the game id alone.
pub fn derive_game_seed(game_id: &[u8; 16], round: u32) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"SNAKE_ARENA_FOOD_V1");
    hasher.update(game_id);
    hasher.update(round.to_le_bytes());

    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// TESTS
// =============================================================================
