//! Collision Resolution
//!
//! Decides whether a round is over after all snakes have moved.
//! Rules are checked in a fixed priority so every board maps to exactly
//! one outcome:
//!
//! 1. Self-collision: the other principal wins.
//! 2. Head-to-head: higher score wins, equal scores tie.
//! 3. Head into the opponent's body: the body's owner wins.
//!
//! Solo boards only ever check rule 1, and a hit there is a loss with
//! no winner.

use crate::game::state::{PlayerId, Snake};

/// Result of resolving one board.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Nobody collided.
    Continue,
    /// A principal won.
    Winner(PlayerId),
    /// Two-player draw.
    Tie,
    /// The solo snake hit itself.
    SoloLoss,
}

/// Resolve collisions for the current snake positions.
///
/// `snakes` must be in slot order (A, then B).
pub fn resolve(snakes: &[Snake]) -> RoundOutcome {
    match snakes {
        [solo] => {
            if solo.body_hits(solo.head()) {
                RoundOutcome::SoloLoss
            } else {
                RoundOutcome::Continue
            }
        }
        [a, b] => resolve_duel(a, b),
        _ => RoundOutcome::Continue,
    }
}

fn resolve_duel(a: &Snake, b: &Snake) -> RoundOutcome {
    // Rule 1, A checked first
    if a.body_hits(a.head()) {
        return RoundOutcome::Winner(b.owner);
    }
    if b.body_hits(b.head()) {
        return RoundOutcome::Winner(a.owner);
    }

    // Rule 2
    if a.head() == b.head() {
        return match a.score.cmp(&b.score) {
            std::cmp::Ordering::Greater => RoundOutcome::Winner(a.owner),
            std::cmp::Ordering::Less => RoundOutcome::Winner(b.owner),
            std::cmp::Ordering::Equal => RoundOutcome::Tie,
        };
    }

    // Rule 3, A checked first
    if b.body_hits(a.head()) {
        return RoundOutcome::Winner(b.owner);
    }
    if a.body_hits(b.head()) {
        return RoundOutcome::Winner(a.owner);
    }

    RoundOutcome::Continue
}

// =============================================================================
// TESTS
// =============================================================================
