//! # Grid Server Library
//!
//! Authoritative server for the shared grid. It holds the only real copy of
//! every player's position and answers four remote procedures over TCP:
//! registration, move submission, unregistration and snapshot retrieval.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! Clients never own positions. They send moves and read back snapshots; the
//! server accepts any coordinate it is sent (there are no game rules here)
//! but decides *whether* a move is applied.
//!
//! ### Exactly-Once Moves
//! Each move carries a per-player sequence number. A move is applied only if
//! its sequence number is strictly greater than the last one accepted for
//! that player, so retransmissions and stale retries are absorbed without
//! side effects and an older position can never overwrite a newer one.
//!
//! ### Ghost Eviction
//! Players registered over a connection that closes without unregistering
//! them are removed once no other open connection claims them.
//!
//! ## Module Organization
//!
//! ### Store Module (`store`)
//! The authoritative store: positions plus last-applied sequence numbers,
//! both behind one lock.
//!
//! ### Service Module (`service`)
//! Maps request packets onto store operations and builds replies.
//!
//! ### Client Manager Module (`client_manager`)
//! Open connections and the players each one registered.
//!
//! ### Network Module (`network`)
//! Accept loop, per-connection reader and writer tasks, one task per call.
//!
//! ## Concurrency
//!
//! Calls run concurrently, one task each, and serialize only on the store's
//! lock. The lock is held for a single operation and never across calls.
//! Moves from one player are ordered by sequence number; moves from different
//! players have no relative ordering.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("0.0.0.0:1234", 64).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;
pub mod service;
pub mod store;
