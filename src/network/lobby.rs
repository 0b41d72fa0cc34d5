//! Lobby
//!
//! Idle players, first come first served. Add and remove are idempotent
//! and report whether membership actually changed, so callers only
//! broadcast on real changes.

use tokio::sync::RwLock;

use crate::game::state::PlayerId;

/// Ordered set of idle players.
#[derive(Debug, Default)]
pub struct Lobby {
    members: RwLock<Vec<PlayerId>>,
}

impl Lobby {
    /// Create an empty lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player at the back. Returns false if already present.
    pub async fn add(&self, id: PlayerId) -> bool {
        let mut members = self.members.write().await;
        if members.contains(&id) {
            return false;
        }
        members.push(id);
        true
    }

    /// Remove a player. Returns false if absent.
    pub async fn remove(&self, id: &PlayerId) -> bool {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|m| m != id);
        members.len() != before
    }

    /// Whether the player is in the lobby.
    pub async fn contains(&self, id: &PlayerId) -> bool {
        self.members.read().await.contains(id)
    }

    /// Members in join order.
    pub async fn members(&self) -> Vec<PlayerId> {
        self.members.read().await.clone()
    }

    /// Number of members.
    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    /// Whether the lobby is empty.
    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}
