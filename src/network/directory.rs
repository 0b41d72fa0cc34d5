//! Player Directory
//!
//! Owns every player record for the lifetime of the player, whether or
//! not a socket is currently attached. Games and the lobby only hold ids
//! and resolve them here when they need a name or a delivery handle.

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::game::state::PlayerId;
use crate::network::outbound::{ConnectionId, Outbox};
use crate::network::protocol::{PlayerInfo, ServerMessage};

/// One player record.
#[derive(Debug, Clone)]
pub struct Player {
    /// Player id.
    pub id: PlayerId,
    /// Display name.
    pub username: String,
    /// When the record was created.
    pub joined_at: DateTime<Utc>,
    /// Live connection, if any.
    link: Option<Outbox>,
    /// Bumped on every attach and detach.
    epoch: u64,
}

impl Player {
    /// Fresh record with no connection attached.
    pub fn new(id: PlayerId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            joined_at: Utc::now(),
            link: None,
            epoch: 0,
        }
    }

    /// Public view.
    pub fn info(&self) -> PlayerInfo {
        PlayerInfo {
            id: self.id,
            username: self.username.clone(),
        }
    }

    /// Whether a connection is attached and still open.
    pub fn is_live(&self) -> bool {
        self.link.as_ref().map(|o| !o.is_closed()).unwrap_or(false)
    }
}

/// All known players, keyed by id.
#[derive(Debug, Default)]
pub struct Directory {
    players: RwLock<BTreeMap<PlayerId, Player>>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Public view of a player.
    pub async fn info(&self, id: &PlayerId) -> Option<PlayerInfo> {
        self.players.read().await.get(id).map(Player::info)
    }

    /// Copy of a player record.
    pub async fn get(&self, id: &PlayerId) -> Option<Player> {
        self.players.read().await.get(id).cloned()
    }

    /// Whether the player exists.
    pub async fn contains(&self, id: &PlayerId) -> bool {
        self.players.read().await.contains_key(id)
    }

    /// Whether the player has an open connection.
    pub async fn is_live(&self, id: &PlayerId) -> bool {
        self.players.read().await.get(id).map(Player::is_live).unwrap_or(false)
    }

    /// Register a first-time player and attach its connection, unless a
    /// live player already holds the name (case-insensitive). Check and
    /// insert share one lock.
    ///
    /// `greet` builds the first message of the connection; it is queued
    /// before the connection becomes reachable by any broadcast.
    pub async fn claim_username<F>(&self, mut player: Player, outbox: Outbox, greet: F) -> Result<(), Outbox>
    where
        F: FnOnce(PlayerInfo) -> ServerMessage,
    {
        let mut players = self.players.write().await;
        let wanted = player.username.to_lowercase();
        let taken = players
            .values()
            .any(|p| p.is_live() && p.username.to_lowercase() == wanted);
        if taken || players.contains_key(&player.id) {
            return Err(outbox);
        }
        let _ = outbox.push(greet(player.info()));
        player.link = Some(outbox);
        player.epoch += 1;
        players.insert(player.id, player);
        Ok(())
    }

    /// Detach the current connection ahead of a rebind, returning it so
    /// the caller can close it. The record itself stays.
    pub async fn take_link(&self, id: &PlayerId) -> Option<Outbox> {
        let mut players = self.players.write().await;
        let player = players.get_mut(id)?;
        let old = player.link.take();
        if old.is_some() {
            player.epoch += 1;
        }
        old
    }

    /// Attach a connection, registering `player` first if its record is
    /// gone. Any connection still attached is returned so the caller can
    /// close it; at most one stays live.
    ///
    /// `greet` receives the stored record's public view and builds the
    /// first message of the connection, queued before it becomes reachable.
    pub async fn attach<F>(&self, player: Player, outbox: Outbox, greet: F) -> Option<Outbox>
    where
        F: FnOnce(PlayerInfo) -> ServerMessage,
    {
        let mut players = self.players.write().await;
        let record = players.entry(player.id).or_insert(player);
        let _ = outbox.push(greet(record.info()));
        record.epoch += 1;
        record.link.replace(outbox)
    }

    /// A connection went away. Detaches it only if it is still the one
    /// attached, and returns the new epoch in that case.
    pub async fn connection_lost(&self, id: &PlayerId, conn: ConnectionId) -> Option<u64> {
        let mut players = self.players.write().await;
        let player = players.get_mut(id)?;
        match &player.link {
            Some(link) if link.id() == conn => {
                player.link = None;
                player.epoch += 1;
                Some(player.epoch)
            }
            _ => {
                debug!("Stale connection {} lost for {}", conn, id.short());
                None
            }
        }
    }

    /// Remove the record if nothing re-attached since `epoch`.
    pub async fn remove_if_detached(&self, id: &PlayerId, epoch: u64) -> Option<Player> {
        let mut players = self.players.write().await;
        let still_gone = players
            .get(id)
            .map(|p| p.link.is_none() && p.epoch == epoch)
            .unwrap_or(false);
        if still_gone {
            players.remove(id)
        } else {
            None
        }
    }

    /// Remove the record unconditionally.
    pub async fn remove(&self, id: &PlayerId) -> Option<Player> {
        self.players.write().await.remove(id)
    }

    /// Enqueue a message for one player. Returns false if it could not be
    /// queued (offline, closed, or overflowed).
    pub async fn deliver(&self, id: &PlayerId, msg: ServerMessage) -> bool {
        let link = {
            let players = self.players.read().await;
            players.get(id).and_then(|p| p.link.clone())
        };
        let outbox = match link {
            Some(o) => o,
            None => return false,
        };
        outbox.push(msg).is_ok()
    }

    /// Enqueue the same message for several players.
    pub async fn deliver_all(&self, ids: &[PlayerId], msg: &ServerMessage) {
        let outboxes: Vec<Outbox> = {
            let players = self.players.read().await;
            ids.iter()
                .filter_map(|id| players.get(id).and_then(|p| p.link.clone()))
                .collect()
        };
        for outbox in outboxes {
            let _ = outbox.push(msg.clone());
        }
    }

    /// Enqueue a message for every live player.
    pub async fn broadcast(&self, msg: &ServerMessage) {
        let outboxes: Vec<Outbox> = {
            let players = self.players.read().await;
            players.values().filter_map(|p| p.link.clone()).collect()
        };
        for outbox in outboxes {
            let _ = outbox.push(msg.clone());
        }
    }

    /// Number of records.
    pub async fn len(&self) -> usize {
        self.players.read().await.len()
    }

    /// Whether there are no records.
    pub async fn is_empty(&self) -> bool {
        self.players.read().await.is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================
