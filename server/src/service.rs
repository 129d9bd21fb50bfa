//! RPC handlers: maps request packets onto store operations.

use crate::client_manager::ClientManager;
use crate::store::{AuthoritativeStore, StoreError};
use log::{debug, info, warn};
use shared::{ErrorCode, Packet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Answers the four remote procedures for every connection.
///
/// Cheap to clone; each in-flight call gets its own handle.
#[derive(Clone)]
pub struct SyncService {
    store: Arc<AuthoritativeStore>,
    clients: Arc<Mutex<ClientManager>>,
}

impl SyncService {
    pub fn new(store: Arc<AuthoritativeStore>, clients: Arc<Mutex<ClientManager>>) -> Self {
        Self { store, clients }
    }

    pub fn store(&self) -> &Arc<AuthoritativeStore> {
        &self.store
    }

    /// Handles one request from connection `client_id` and builds its reply.
    ///
    /// Calls that change who owns a player lock the client registry before
    /// the store, the same order [`SyncService::disconnect`] uses, so a
    /// registration and an eviction of the same id never interleave.
    pub async fn handle(&self, client_id: u32, packet: Packet) -> Packet {
        if !packet.is_request() {
            warn!(
                "Connection {} sent {} as a request",
                client_id,
                packet.name()
            );
            return Packet::Error {
                code: ErrorCode::UnexpectedPacket,
                message: format!("{} is not a request", packet.name()),
            };
        }

        match packet {
            Packet::RegisterPlayer { player_id } => {
                let mut clients = self.clients.lock().await;
                match self.store.register_player(&player_id).await {
                    Ok(registration) => {
                        clients.note_registered(client_id, &player_id);
                        if !registration.created {
                            debug!("Player {} registered again", player_id);
                        }
                        Packet::RegisterReply {
                            ok: true,
                            last_seq: registration.last_seq,
                        }
                    }
                    Err(e) => rejected("RegisterPlayer", e),
                }
            }

            Packet::UpdatePlayerState {
                player_id,
                row,
                col,
                seq_num,
            } => match self
                .store
                .update_player_state(&player_id, row, col, seq_num)
                .await
            {
                Ok(applied) => Packet::MoveReply { applied },
                Err(e) => rejected("UpdatePlayerState", e),
            },

            Packet::UnregisterPlayer { player_id } => {
                let mut clients = self.clients.lock().await;
                self.store.unregister_player(&player_id).await;
                clients.note_unregistered(&player_id);
                Packet::UnregisterReply
            }

            Packet::GetGameState => Packet::GameState {
                players: self.store.get_game_state().await.players,
            },

            other => Packet::Error {
                code: ErrorCode::UnexpectedPacket,
                message: format!("{} is not a request", other.name()),
            },
        }
    }

    /// Forgets connection `client_id` and evicts the players only it claimed.
    ///
    /// The registry stays locked until every eviction has reached the store.
    pub async fn disconnect(&self, client_id: u32) -> Vec<String> {
        let mut clients = self.clients.lock().await;
        let orphaned = clients.remove_client(&client_id);
        for player_id in &orphaned {
            info!(
                "Evicting {} after connection {} dropped without unregistering",
                player_id, client_id
            );
            self.store.unregister_player(player_id).await;
        }
        orphaned
    }
}

fn rejected(procedure: &str, error: StoreError) -> Packet {
    warn!("[RPC] {} rejected: {}", procedure, error);
    match error {
        StoreError::InvalidArgument(_) => Packet::Error {
            code: ErrorCode::InvalidArgument,
            message: error.to_string(),
        },
    }
}
