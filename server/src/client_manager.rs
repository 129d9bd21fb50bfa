//! Connection bookkeeping for the RPC server
//!
//! Every accepted TCP connection becomes a [`Client`] entry that remembers
//! which player ids were registered through it. When a connection goes away
//! without unregistering its players, the manager reports which of those ids
//! are no longer claimed by any other open connection so the server can evict
//! them instead of leaving ghost players in every snapshot.
//!
//! The manager knows nothing about positions; game state lives only in
//! [`crate::store::AuthoritativeStore`].

use log::info;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// One open connection.
#[derive(Debug)]
pub struct Client {
    /// Server-assigned connection id
    pub id: u32,
    /// Peer address, for logs
    pub addr: SocketAddr,
    pub connected_at: Instant,
    /// Player ids registered over this connection and not yet unregistered
    pub players: HashSet<String>,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            connected_at: Instant::now(),
            players: HashSet::new(),
        }
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Tracks open connections and the players each one owns.
pub struct ClientManager {
    clients: HashMap<u32, Client>,
    next_client_id: u32,
    max_clients: usize,
}

impl ClientManager {
    /// Connection ids start at 1 and are never reused.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Admits a new connection, or returns `None` when the server is full.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Connection {} opened from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    /// Drops a connection and returns the players it orphaned.
    ///
    /// A player also registered through another open connection is not
    /// orphaned and is left out of the result.
    pub fn remove_client(&mut self, client_id: &u32) -> Vec<String> {
        let Some(client) = self.clients.remove(client_id) else {
            return Vec::new();
        };

        info!(
            "Connection {} from {} closed after {:.1}s",
            client.id,
            client.addr,
            client.connected_for().as_secs_f32()
        );

        let mut orphaned: Vec<String> = client
            .players
            .into_iter()
            .filter(|player| !self.is_claimed(player))
            .collect();
        orphaned.sort();
        orphaned
    }

    /// Records that `player_id` was registered over `client_id`.
    pub fn note_registered(&mut self, client_id: u32, player_id: &str) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.players.insert(player_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Forgets `player_id` on every connection; the player has left the game.
    pub fn note_unregistered(&mut self, player_id: &str) {
        for client in self.clients.values_mut() {
            client.players.remove(player_id);
        }
    }

    pub fn is_claimed(&self, player_id: &str) -> bool {
        self.clients
            .values()
            .any(|client| client.players.contains(player_id))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
