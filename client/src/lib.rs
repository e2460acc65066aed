//! # Planning Poker Client Library
//!
//! Connection supervision and event delivery for planning poker clients.
//!
//! The [`network`] module owns the WebSocket connection: connecting,
//! heartbeating, exponential-backoff reconnects and outbound sends. Incoming
//! server messages are decoded and handed to the [`events`] bus, where the
//! application registers per-message-type handlers with `on`/`once`
//! semantics. The terminal client in the binary is one such application.

pub mod events;
pub mod network;
