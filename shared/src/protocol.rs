//! Wire protocol: message enums and the `{type, payload, timestamp}` envelope.
//!
//! Messages are adjacently tagged so that the JSON matches the envelope the
//! web clients speak, e.g.
//!
//! ```json
//! { "type": "vote:select",
//!   "payload": { "sessionId": "…", "value": "5" },
//!   "timestamp": 1700000000000 }
//! ```

use crate::model::{Participant, Session};
use crate::now_millis;
use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "session:create", rename_all = "camelCase")]
    SessionCreate {
        session_name: String,
        participant_name: String,
    },
    #[serde(rename = "session:join", rename_all = "camelCase")]
    SessionJoin {
        join_code: String,
        participant_name: String,
        as_observer: bool,
    },
    #[serde(rename = "session:leave", rename_all = "camelCase")]
    SessionLeave { session_id: String },
    #[serde(rename = "vote:select", rename_all = "camelCase")]
    VoteSelect { session_id: String, value: String },
    #[serde(rename = "vote:reveal", rename_all = "camelCase")]
    VoteReveal { session_id: String },
    #[serde(rename = "vote:reset", rename_all = "camelCase")]
    VoteReset { session_id: String },
    #[serde(rename = "voting:start", rename_all = "camelCase")]
    VotingStart {
        session_id: String,
        story: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "story:add", rename_all = "camelCase")]
    StoryAdd {
        session_id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "story:remove", rename_all = "camelCase")]
    StoryRemove {
        session_id: String,
        story_id: String,
    },
    #[serde(rename = "story:update", rename_all = "camelCase")]
    StoryUpdate {
        session_id: String,
        story_id: String,
        title: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename = "story:next", rename_all = "camelCase")]
    StoryNext { session_id: String },
    #[serde(rename = "ping")]
    Ping {},
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "session:created", rename_all = "camelCase")]
    SessionCreated {
        session: Session,
        join_code: String,
        participant: Participant,
    },
    #[serde(rename = "session:joined", rename_all = "camelCase")]
    SessionJoined {
        session: Session,
        join_code: String,
        participant: Participant,
    },
    #[serde(rename = "session:updated", rename_all = "camelCase")]
    SessionUpdated { session: Session },
    #[serde(rename = "session:left", rename_all = "camelCase")]
    SessionLeft { success: bool },
    #[serde(rename = "session:error", rename_all = "camelCase")]
    SessionError { message: String, code: ErrorCode },
    #[serde(rename = "participant:joined", rename_all = "camelCase")]
    ParticipantJoined {
        participant: Participant,
        session_id: String,
    },
    #[serde(rename = "participant:left", rename_all = "camelCase")]
    ParticipantLeft {
        participant_id: String,
        session_id: String,
    },
    #[serde(rename = "participant:voted", rename_all = "camelCase")]
    ParticipantVoted {
        participant_id: String,
        session_id: String,
        /// Omitted while cards are hidden so peers only learn *that* someone
        /// voted, not what.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong {},
}

impl ServerMessage {
    /// Subscription key for the client event bus.
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            ServerMessage::SessionCreated { .. } => ServerMessageKind::SessionCreated,
            ServerMessage::SessionJoined { .. } => ServerMessageKind::SessionJoined,
            ServerMessage::SessionUpdated { .. } => ServerMessageKind::SessionUpdated,
            ServerMessage::SessionLeft { .. } => ServerMessageKind::SessionLeft,
            ServerMessage::SessionError { .. } => ServerMessageKind::SessionError,
            ServerMessage::ParticipantJoined { .. } => ServerMessageKind::ParticipantJoined,
            ServerMessage::ParticipantLeft { .. } => ServerMessageKind::ParticipantLeft,
            ServerMessage::ParticipantVoted { .. } => ServerMessageKind::ParticipantVoted,
            ServerMessage::Pong {} => ServerMessageKind::Pong,
        }
    }
}

/// Discriminant-only view of [`ServerMessage`], usable as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerMessageKind {
    SessionCreated,
    SessionJoined,
    SessionUpdated,
    SessionLeft,
    SessionError,
    ParticipantJoined,
    ParticipantLeft,
    ParticipantVoted,
    Pong,
}

/// Error codes surfaced in `session:error` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    NotAuthorized,
    VoteFailed,
    InvalidMessage,
}

/// Client→server envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(flatten)]
    pub message: ClientMessage,
    pub timestamp: u64,
}

impl ClientEnvelope {
    pub fn new(message: ClientMessage) -> Self {
        Self {
            message,
            timestamp: now_millis(),
        }
    }
}

/// Server→client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: u64,
}

impl ServerEnvelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: now_millis(),
        }
    }
}
