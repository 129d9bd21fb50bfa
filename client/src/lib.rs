//! # Grid Sync Client Library
//!
//! Client side of the grid synchronization protocol. The server owns every
//! player position; this crate keeps a local player in step with it and keeps
//! a read-only view of everybody else.
//!
//! ## Architecture Overview
//!
//! ### Exactly-Once Moves
//! Every move carries a per-player sequence number assigned before the first
//! send. Retransmissions reuse the number, so the server applies each move at
//! most once no matter how many copies arrive. Numbers continue from the
//! server's last accepted value after re-registration.
//!
//! ### Polling
//! A background task fetches a full snapshot at a fixed interval and replaces
//! the local view wholesale. Repeated failures back off linearly and finally
//! stop the task; the session is then flagged desynchronized and the view
//! freezes while moves keep working.
//!
//! ### Connection Resilience
//! Connecting uses exponential backoff with jitter. Registration retries on the
//! same connection first, then on fresh connections, before giving up.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Backoff, retry and polling tunables with their defaults.
//!
//! ### Network Module (`network`)
//! The [`network::Transport`] seam and the TCP [`network::RpcClient`] that
//! multiplexes overlapping calls on one connection.
//!
//! ### Session Module (`session`)
//! Registration, numbered moves, polling and the cached snapshot.
//!
//! ### Connection Module (`connection`)
//! Connection state machine from first dial to an active session.
//!
//! ### Input Module (`input`)
//! Stdin commands for the headless binary.

pub mod config;
pub mod connection;
pub mod input;
pub mod network;
pub mod session;
