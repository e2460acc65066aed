//! # Planning Poker Server Library
//!
//! The authoritative session engine for real-time planning poker. All state
//! lives in process memory for the lifetime of the connection set; clients
//! connect over WebSocket, exchange JSON envelopes, and are kept in sync via
//! full session snapshots.
//!
//! ## Module Organization
//!
//! ### Codes Module (`codes`)
//! Identifier and join-code generation: uuid-backed session/participant ids
//! and six-character join codes drawn from a confusable-free alphabet.
//!
//! ### Registry Module (`registry`)
//! The authoritative store. Owns every session, the join-code index, and the
//! bidirectional mapping between live connections and the participant they
//! act as. All mutations (join, leave with host transfer, vote with
//! auto-reveal, story queue management) go through it, and each one is
//! atomic with respect to the session it targets.
//!
//! ### Voting Module (`voting`)
//! Pure aggregation over a session's votes: average and median across the
//! numeric subset, mode across all raw values, and consensus detection.
//!
//! ### Network Module (`network`)
//! The WebSocket edge: accept loop, one reader and one writer task per
//! connection, envelope decoding, dispatch to the registry, and best-effort
//! broadcast of snapshots to every connection bound to a session.
//!
//! ## Concurrency Model
//!
//! The registry sits behind a single `tokio::sync::RwLock`. Every operation
//! that reads-then-writes a session (authorization check plus mutation, vote
//! plus auto-reveal, leave plus host transfer) holds the write guard for the
//! whole step, so concurrent connections can never interleave inside one
//! session operation. Broadcasts go through per-connection unbounded queues;
//! a slow or dead peer never stalls delivery to the rest.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080", false).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod codes;
pub mod network;
pub mod registry;
pub mod voting;
