//! Peer Signaling
//!
//! Mailbox relay for bootstrapping the optional low-latency peer
//! transport. Offers, answers and ICE candidates are stored per
//! (from, to) pair and forwarded verbatim; their contents are never
//! inspected.

use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::game::state::PlayerId;

/// Candidates kept per pair; older ones are dropped first.
pub const MAX_CANDIDATES: usize = 64;

/// Kind of signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Session offer.
    Offer,
    /// Session answer.
    Answer,
    /// ICE candidate.
    IceCandidate,
}

/// Stored signaling state for one direction of one pair.
#[derive(Debug, Clone, Default)]
pub struct MailboxEntry {
    /// Latest offer.
    pub offer: Option<serde_json::Value>,
    /// Latest answer.
    pub answer: Option<serde_json::Value>,
    /// Candidates in arrival order.
    pub candidates: Vec<serde_json::Value>,
}

/// Signaling mailboxes keyed by (from, to).
#[derive(Debug, Default)]
pub struct SignalMailbox {
    entries: RwLock<BTreeMap<(PlayerId, PlayerId), MailboxEntry>>,
}

impl SignalMailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload from `from` for `to`.
    pub async fn store(
        &self,
        kind: SignalKind,
        from: PlayerId,
        to: PlayerId,
        payload: serde_json::Value,
    ) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry((from, to)).or_default();
        match kind {
            SignalKind::Offer => {
                // A new offer restarts negotiation.
                entry.offer = Some(payload);
                entry.answer = None;
                entry.candidates.clear();
            }
            SignalKind::Answer => entry.answer = Some(payload),
            SignalKind::IceCandidate => {
                if entry.candidates.len() >= MAX_CANDIDATES {
                    entry.candidates.remove(0);
                }
                entry.candidates.push(payload);
            }
        }
    }

    /// Stored state for a pair.
    pub async fn get(&self, from: &PlayerId, to: &PlayerId) -> Option<MailboxEntry> {
        self.entries.read().await.get(&(*from, *to)).cloned()
    }

    /// Drop every entry involving `player`.
    pub async fn purge(&self, player: &PlayerId) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(from, to), _| from != player && to != player);
        before - entries.len()
    }

    /// Number of stored pairs.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
