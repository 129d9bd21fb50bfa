//! Wire contract shared by the grid server and its clients.
//!
//! Everything that crosses the connection lives here: the player and
//! snapshot shapes, the [`Packet`] enum carrying every request and reply,
//! the [`Envelope`] that pairs a packet with its call id, and the
//! length-prefixed [`framing`] codec.

pub mod framing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Port the server listens on when none is given.
pub const DEFAULT_PORT: u16 = 1234;

/// Position of one player on the grid.
///
/// `row`/`col` carry no range invariant; the server stores whatever it is sent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PlayerState {
    pub id: String,
    pub row: i32,
    pub col: i32,
}

impl PlayerState {
    /// A freshly registered player, placed at the origin.
    pub fn new(id: impl Into<String>) -> Self {
        Self::at(id, 0, 0)
    }

    pub fn at(id: impl Into<String>, row: i32, col: i32) -> Self {
        Self {
            id: id.into(),
            row,
            col,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.row, self.col)
    }
}

/// Point-in-time copy of every player the server knows about.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct GameSnapshot {
    pub players: HashMap<String, PlayerState>,
}

impl GameSnapshot {
    pub fn new(players: HashMap<String, PlayerState>) -> Self {
        Self { players }
    }

    pub fn get(&self, id: &str) -> Option<&PlayerState> {
        self.players.get(id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}

/// Why the server refused a call.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed arguments, e.g. an empty player id.
    InvalidArgument,
    /// The packet is not a request the server answers.
    UnexpectedPacket,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "invalid argument"),
            ErrorCode::UnexpectedPacket => write!(f, "unexpected packet"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    // Requests (client -> server)
    RegisterPlayer {
        player_id: String,
    },
    UpdatePlayerState {
        player_id: String,
        row: i32,
        col: i32,
        seq_num: u64,
    },
    UnregisterPlayer {
        player_id: String,
    },
    GetGameState,

    // Replies (server -> client)
    RegisterReply {
        ok: bool,
        /// Highest sequence number the server has accepted for this id.
        last_seq: u64,
    },
    MoveReply {
        applied: bool,
    },
    UnregisterReply,
    GameState {
        players: HashMap<String, PlayerState>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl Packet {
    /// Procedure name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::RegisterPlayer { .. } => "RegisterPlayer",
            Packet::UpdatePlayerState { .. } => "UpdatePlayerState",
            Packet::UnregisterPlayer { .. } => "UnregisterPlayer",
            Packet::GetGameState => "GetGameState",
            Packet::RegisterReply { .. } => "RegisterReply",
            Packet::MoveReply { .. } => "MoveReply",
            Packet::UnregisterReply => "UnregisterReply",
            Packet::GameState { .. } => "GameState",
            Packet::Error { .. } => "Error",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Packet::RegisterPlayer { .. }
                | Packet::UpdatePlayerState { .. }
                | Packet::UnregisterPlayer { .. }
                | Packet::GetGameState
        )
    }
}

/// A packet tagged with the id of the call it belongs to.
///
/// Replies echo the request's `call_id`, which lets one connection carry
/// several calls at once.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub call_id: u64,
    pub packet: Packet,
}

impl Envelope {
    pub fn new(call_id: u64, packet: Packet) -> Self {
        Self { call_id, packet }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
