//! Shared types for the planning poker workspace.
//!
//! Both the server and the client depend on this crate for the session data
//! model ([`model`]) and the wire protocol ([`protocol`]). The JSON produced
//! by these types is the contract between the two sides, so every field name
//! and message tag is pinned here and covered by serialization tests.

pub mod model;
pub mod protocol;

pub use model::*;
pub use protocol::*;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time as unix epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}
