//! Authoritative Simulation Tick
//!
//! One fixed-period step of a round. Pure and deterministic given the
//! arena (including its RNG), so the async loop in `network::game_loop`
//! only decides when to call it.

use crate::game::collision::{resolve, RoundOutcome};
use crate::game::state::{place_food, ArenaState, PlayerId};

/// Result of a tick.
#[derive(Debug)]
pub struct TickResult {
    /// How the board resolved after moving.
    pub outcome: RoundOutcome,
    /// Players whose snake ate this tick, in slot order.
    pub ate: Vec<PlayerId>,
}

/// Run one simulation tick.
///
/// For each snake in slot order: promote the pending direction, step
/// the head with wrap-around, then either grow (food eaten, food moved)
/// or drop the tail. Collisions are resolved once all snakes have moved.
///
/// A board with no free cell left for food ends the round: a draw for
/// two players, a loss for a solo snake.
pub fn tick(arena: &mut ArenaState) -> TickResult {
    let mut ate = Vec::new();

    for snake in arena.snakes.iter_mut() {
        snake.direction = snake.pending;
    }

    for i in 0..arena.snakes.len() {
        let head = {
            let snake = &arena.snakes[i];
            arena.grid.step(snake.head(), snake.direction)
        };
        arena.snakes[i].body.push_front(head);

        if head == arena.food {
            arena.snakes[i].score += 1;
            ate.push(arena.snakes[i].owner);
            match place_food(&mut arena.rng, &arena.grid, &arena.snakes) {
                Some(cell) => arena.food = cell,
                None => {
                    let outcome = if arena.snakes.len() == 1 {
                        RoundOutcome::SoloLoss
                    } else {
                        RoundOutcome::Tie
                    };
                    return TickResult { outcome, ate };
                }
            }
        } else {
            arena.snakes[i].body.pop_back();
        }
    }

    TickResult {
        outcome: resolve(&arena.snakes),
        ate,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::grid::{Cell, Direction, GridSize};
    use crate::core::rng::DeterministicRng;
    use crate::game::state::Seat;

    fn seat(n: u8) -> Seat {
        Seat {
            id: PlayerId::new([n; 16]),
            username: format!("p{}", n),
        }
    }

    fn duel() -> ArenaState {
        ArenaState::duel(GridSize::default(), DeterministicRng::new(7), &seat(1), &seat(2))
    }

    #[test]
    fn test_tick_moves_and_keeps_length() {
        let mut arena = duel();
        arena.food = Cell::new(0, 0);

        let result = tick(&mut arena);

        assert_eq!(result.outcome, RoundOutcome::Continue);
        assert!(result.ate.is_empty());
        assert_eq!(arena.snakes[0].head(), Cell::new(6, 15));
        assert_eq!(arena.snakes[1].head(), Cell::new(34, 15));
        assert_eq!(arena.snakes[0].body.len(), 3);
        assert_eq!(arena.snakes[1].body.len(), 3);
    }

    #[test]
    fn test_tick_eats_and_grows() {
        let mut arena = duel();
        arena.food = Cell::new(6, 15);

        let result = tick(&mut arena);

        assert_eq!(result.ate.first(), Some(&arena.snakes[0].owner));
        assert_eq!(arena.snakes[0].score, 1);
        assert_eq!(arena.snakes[0].body.len(), 4);
        assert_ne!(arena.food, Cell::new(6, 15));
        for snake in &arena.snakes {
            assert!(!snake.occupies(arena.food));
        }
    }

    #[test]
    fn test_reversal_ignored_keeps_heading() {
        let mut arena = duel();
        arena.food = Cell::new(0, 0);
        let owner = arena.snakes[0].owner;

        let staged = arena.snake_mut(&owner).map(|s| s.stage_direction(Direction::Left));
        assert_eq!(staged, Some(false));

        tick(&mut arena);
        assert_eq!(arena.snakes[0].direction, Direction::Right);
        assert_eq!(arena.snakes[0].head(), Cell::new(6, 15));
    }

    #[test]
    fn test_pending_promoted_on_tick() {
        let mut arena = duel();
        arena.food = Cell::new(0, 0);
        let owner = arena.snakes[0].owner;
        if let Some(snake) = arena.snake_mut(&owner) {
            assert!(snake.stage_direction(Direction::Up));
        }

        tick(&mut arena);
        assert_eq!(arena.snakes[0].direction, Direction::Up);
        assert_eq!(arena.snakes[0].head(), Cell::new(5, 14));
    }

    #[test]
    fn test_head_on_with_scores() {
        let mut arena = duel();
        arena.food = Cell::new(0, 0);
        // Put the heads two cells apart so they meet on the next tick.
        arena.snakes[0].body = [Cell::new(19, 15), Cell::new(18, 15), Cell::new(17, 15)].into();
        arena.snakes[1].body = [Cell::new(21, 15), Cell::new(22, 15), Cell::new(23, 15)].into();
        arena.snakes[0].score = 5;
        arena.snakes[1].score = 3;

        let result = tick(&mut arena);
        assert_eq!(result.outcome, RoundOutcome::Winner(arena.snakes[0].owner));
    }

    #[test]
    fn test_wraps_through_edge() {
        let mut arena = ArenaState::solo(GridSize::default(), DeterministicRng::new(3), &seat(1));
        arena.food = Cell::new(0, 0);
        arena.snakes[0].body = [Cell::new(39, 4), Cell::new(38, 4), Cell::new(37, 4)].into();

        tick(&mut arena);
        assert_eq!(arena.snakes[0].head(), Cell::new(0, 4));
    }

    #[test]
    fn test_same_seed_same_food_sequence() {
        let mut a = duel();
        let mut b = duel();
        assert_eq!(a.food, b.food);

        for _ in 0..5 {
            let cell = a.snakes[0].body[0];
            let next = a.grid.step(cell, a.snakes[0].direction);
            a.food = next;
            b.food = next;
            tick(&mut a);
            tick(&mut b);
            assert_eq!(a.food, b.food);
        }
    }

    #[test]
    fn test_full_board_ends_solo_as_loss() {
        let mut arena = ArenaState::solo(GridSize::new(4, 1), DeterministicRng::new(5), &seat(1));
        arena.snakes[0].body = [Cell::new(2, 0), Cell::new(1, 0), Cell::new(0, 0)].into();
        arena.snakes[0].direction = Direction::Right;
        arena.snakes[0].pending = Direction::Right;
        arena.food = Cell::new(3, 0);

        let result = tick(&mut arena);
        assert_eq!(result.outcome, RoundOutcome::SoloLoss);
        assert_eq!(result.ate, vec![arena.snakes[0].owner]);
    }

    #[test]
    fn test_full_board_ends_duel_as_tie() {
        let mut arena = ArenaState::duel(GridSize::new(4, 1), DeterministicRng::new(5), &seat(1), &seat(2));
        arena.snakes[0].body = [Cell::new(1, 0), Cell::new(0, 0)].into();
        arena.snakes[0].direction = Direction::Right;
        arena.snakes[0].pending = Direction::Right;
        arena.snakes[1].body = [Cell::new(3, 0)].into();
        arena.food = Cell::new(2, 0);

        let result = tick(&mut arena);
        assert_eq!(result.outcome, RoundOutcome::Tie);
    }
}
