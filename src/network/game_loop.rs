//! Game Loop
//!
//! Timed tasks that drive a game: the pre-match countdown, the rematch
//! countdown, and the fixed-rate tick loop. Each task re-checks the game
//! under its lock on every step and exits quietly once the game moved on
//! (deleted, finished, or a newer countdown took over).

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{info, warn};

use crate::game::state::{GameId, GameStatus};
use crate::game::tick::tick;
use crate::network::coordinator::{Coordinator, GameView, Phase};
use crate::network::session::SharedSession;

/// Count down from the configured start, then start the round.
pub(crate) async fn run_countdown(coordinator: Arc<Coordinator>, game_id: GameId, generation: u64) {
    let from = coordinator.config().session.countdown_from;
    let step = coordinator.config().session.countdown_step;

    for remaining in (1..=from).rev() {
        let view = match countdown_step(&coordinator, &game_id, generation, GameStatus::Countdown, remaining).await {
            Some(view) => view,
            None => return,
        };
        coordinator.publish(&view, Phase::Update).await;
        sleep(step).await;
    }

    start_round(coordinator, game_id, generation).await;
}

/// Rematch countdown: one `rematch_countdown` event per step, then play.
pub(crate) async fn run_rematch_countdown(coordinator: Arc<Coordinator>, game_id: GameId, generation: u64) {
    let from = coordinator.config().session.rematch_countdown_from;
    let step = coordinator.config().session.countdown_step;

    for remaining in (1..=from).rev() {
        let view = match countdown_step(
            &coordinator,
            &game_id,
            generation,
            GameStatus::RematchCountdown,
            remaining,
        )
        .await
        {
            Some(view) => view,
            None => return,
        };
        coordinator.publish_rematch_countdown(&view).await;
        sleep(step).await;
    }

    start_round(coordinator, game_id, generation).await;
}

async fn countdown_step(
    coordinator: &Coordinator,
    game_id: &GameId,
    generation: u64,
    expected: GameStatus,
    remaining: u32,
) -> Option<GameView> {
    let game = coordinator.games().get(game_id).await?;
    let mut g = game.write().await;
    if g.generation != generation || g.status() != expected {
        return None;
    }
    g.countdown = remaining;
    Some(GameView::of(&g))
}

/// Spawn the arena, arm the ticker and announce the round.
async fn start_round(coordinator: Arc<Coordinator>, game_id: GameId, generation: u64) {
    let game = match coordinator.games().get(&game_id).await {
        Some(game) => game,
        None => return,
    };

    let (view, stop_rx, round) = {
        let mut g = game.write().await;
        if g.generation != generation || !g.status().is_pre_play() {
            return;
        }
        if let Err(e) = g.begin_round() {
            warn!("Game {} could not start: {}", game_id.short(), e);
            return;
        }
        let stop_rx = g.arm_ticker();
        (GameView::of(&g), stop_rx, g.round)
    };

    info!("Game {} round {} started", game_id.short(), round);
    coordinator.round_started(&view).await;
    tokio::spawn(run_ticks(coordinator, game, stop_rx));
}

/// Fixed-period simulation. Sole timed writer of the game while playing.
async fn run_ticks(coordinator: Arc<Coordinator>, game: SharedSession, mut stop_rx: oneshot::Receiver<()>) {
    let mut ticker = interval(coordinator.config().session.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut stop_rx => break,
        }

        let (view, finished) = {
            let mut g = game.write().await;
            let arena = match g.arena_mut() {
                Some(arena) => arena,
                None => break,
            };
            let result = tick(arena);

            #[cfg(feature = "debug-tracing")]
            tracing::trace!(
                "Game {} tick: outcome {:?}, ate {}",
                g.id.short(),
                result.outcome,
                result.ate.len()
            );

            match g.apply_outcome(result.outcome) {
                Ok(finished) => (GameView::of(&g), finished),
                Err(e) => {
                    warn!("Game {} tick rejected: {}", g.id.short(), e);
                    break;
                }
            }
        };

        if finished {
            info!(
                "Game {} finished, winner {}",
                view.game_id.short(),
                view.snapshot.winner.as_deref().unwrap_or("none")
            );
            coordinator.round_finished(&view).await;
            break;
        }
        coordinator.publish(&view, Phase::Update).await;
    }
}
