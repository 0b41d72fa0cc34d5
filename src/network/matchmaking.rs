//! Pending Match Requests
//!
//! Directed edges requester -> target, each tied to the waiting game it
//! created. An edge lives until the target answers, the requester
//! cancels, or either side goes away.

use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::game::state::{GameId, PlayerId};

/// One pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Who asked.
    pub requester: PlayerId,
    /// Who was asked.
    pub target: PlayerId,
    /// The waiting game created for it.
    pub game_id: GameId,
}

/// Edge is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateRequest(pub GameId);

/// Why an accept could not claim its edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimError {
    /// No pending edge for the game.
    NoEdge,
    /// Claimant is not the edge's target.
    NotTarget(PendingRequest),
}

/// All pending requests.
#[derive(Debug, Default)]
pub struct PendingRequests {
    edges: RwLock<BTreeMap<(PlayerId, PlayerId), GameId>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an edge, creating its game id only when the edge is new.
    ///
    /// The check and the insert happen under one lock, so two racing
    /// identical requests cannot both succeed.
    pub async fn open(
        &self,
        requester: PlayerId,
        target: PlayerId,
    ) -> Result<PendingRequest, DuplicateRequest> {
        let mut edges = self.edges.write().await;
        if let Some(existing) = edges.get(&(requester, target)) {
            return Err(DuplicateRequest(*existing));
        }
        let game_id = GameId::random();
        edges.insert((requester, target), game_id);
        Ok(PendingRequest {
            requester,
            target,
            game_id,
        })
    }

    /// Remove the edge requester -> target.
    pub async fn cancel(&self, requester: &PlayerId, target: &PlayerId) -> Option<PendingRequest> {
        let mut edges = self.edges.write().await;
        edges.remove(&(*requester, *target)).map(|game_id| PendingRequest {
            requester: *requester,
            target: *target,
            game_id,
        })
    }

    /// The edge for a game, if still pending.
    pub async fn for_game(&self, game_id: &GameId) -> Option<PendingRequest> {
        self.edges
            .read()
            .await
            .iter()
            .find(|(_, g)| *g == game_id)
            .map(|((requester, target), g)| PendingRequest {
                requester: *requester,
                target: *target,
                game_id: *g,
            })
    }

    /// Remove the edge for a game.
    pub async fn remove_game(&self, game_id: &GameId) -> Option<PendingRequest> {
        let mut edges = self.edges.write().await;
        let key = edges.iter().find(|(_, g)| *g == game_id).map(|(k, _)| *k)?;
        edges.remove(&key).map(|g| PendingRequest {
            requester: key.0,
            target: key.1,
            game_id: g,
        })
    }

    /// Accept the edge for `game_id` on behalf of `claimant`.
    ///
    /// On success the edge and every other edge touching either end are
    /// removed in one step; the other edges are returned so their games
    /// can be withdrawn.
    pub async fn claim(
        &self,
        game_id: &GameId,
        claimant: &PlayerId,
    ) -> Result<(PendingRequest, Vec<PendingRequest>), ClaimError> {
        let mut edges = self.edges.write().await;
        let (requester, target) = edges
            .iter()
            .find(|(_, g)| *g == game_id)
            .map(|(k, _)| *k)
            .ok_or(ClaimError::NoEdge)?;
        let accepted = PendingRequest {
            requester,
            target,
            game_id: *game_id,
        };
        if target != *claimant {
            return Err(ClaimError::NotTarget(accepted));
        }

        let mut orphans = Vec::new();
        edges.retain(|(r, t), g| {
            let touches = *r == requester || *t == requester || *r == target || *t == target;
            if touches && *g != *game_id {
                orphans.push(PendingRequest {
                    requester: *r,
                    target: *t,
                    game_id: *g,
                });
            }
            !touches
        });
        Ok((accepted, orphans))
    }

    /// Remove every edge touching any of `players`.
    pub async fn clear_touching(&self, players: &[PlayerId]) -> Vec<PendingRequest> {
        let mut edges = self.edges.write().await;
        let keys: Vec<(PlayerId, PlayerId)> = edges
            .keys()
            .filter(|(r, t)| players.contains(r) || players.contains(t))
            .copied()
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                edges.remove(&key).map(|game_id| PendingRequest {
                    requester: key.0,
                    target: key.1,
                    game_id,
                })
            })
            .collect()
    }

    /// Number of pending edges.
    pub async fn len(&self) -> usize {
        self.edges.read().await.len()
    }

    /// Whether nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.edges.read().await.is_empty()
    }
}
