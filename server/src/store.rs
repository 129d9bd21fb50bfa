//! Authoritative player state with exactly-once move application.
//!
//! The store keeps two maps keyed by player id: the current position of every
//! registered player and the highest move sequence number accepted for that
//! id. Both maps sit behind one lock and every operation takes it exactly
//! once, so a reader can never see a position without the sequence number
//! that produced it.
//!
//! `processed` only ever grows. Unregistering a player drops its position but
//! keeps its sequence number, so a retransmitted move that arrives after the
//! player left is still recognised as stale.

use log::info;
use shared::{GameSnapshot, PlayerState};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Result of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// False when the id was already registered.
    pub created: bool,
    /// Highest sequence number accepted so far for this id (0 if none).
    pub last_seq: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    players: HashMap<String, PlayerState>,
    processed: HashMap<String, u64>,
}

/// The single source of truth for player positions.
#[derive(Debug, Default)]
pub struct AuthoritativeStore {
    inner: Mutex<StoreInner>,
}

fn require_id(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidArgument("empty player id"));
    }
    Ok(())
}

impl AuthoritativeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `id` at the origin unless it is already present.
    ///
    /// Registering twice is not an error and never moves an existing player.
    pub async fn register_player(&self, id: &str) -> Result<Registration, StoreError> {
        require_id(id)?;

        let mut inner = self.inner.lock().await;
        let created = !inner.players.contains_key(id);
        if created {
            inner.players.insert(id.to_string(), PlayerState::new(id));
        }
        let last_seq = inner.processed.get(id).copied().unwrap_or(0);
        drop(inner);

        info!("[RPC] RegisterPlayer: {}", id);
        Ok(Registration { created, last_seq })
    }

    /// Applies a move if `seq` is newer than anything accepted for `id`.
    ///
    /// Returns `Ok(false)` for a duplicate or stale sequence number; the store
    /// is left untouched in that case.
    pub async fn update_player_state(
        &self,
        id: &str,
        row: i32,
        col: i32,
        seq: u64,
    ) -> Result<bool, StoreError> {
        require_id(id)?;

        let mut inner = self.inner.lock().await;
        let last = inner.processed.get(id).copied().unwrap_or(0);
        if seq <= last {
            return Ok(false);
        }

        inner
            .players
            .insert(id.to_string(), PlayerState::at(id, row, col));
        inner.processed.insert(id.to_string(), seq);
        drop(inner);

        info!(
            "[RPC] UpdatePlayerState: {} -> ({},{}) seq={}",
            id, row, col, seq
        );
        Ok(true)
    }

    /// Removes the player's position. Unknown ids are fine.
    pub async fn unregister_player(&self, id: &str) {
        let removed = self.inner.lock().await.players.remove(id).is_some();
        if removed {
            info!("Player {} removed", id);
        }
    }

    /// Copies the current positions. The copy is built while the lock is held.
    pub async fn get_game_state(&self) -> GameSnapshot {
        let inner = self.inner.lock().await;
        GameSnapshot::new(inner.players.clone())
    }
}
