//! Authoritative session store and connection mediator.
//!
//! The registry owns every active session, the join-code index, and the
//! bidirectional mapping between live connections and the participant they
//! act as. The network layer wraps it in a single `RwLock` and holds the
//! write guard across each operation, so an authorization check and the
//! mutation it guards can never be interleaved by another connection.
//!
//! Sessions are created by their first participant (who becomes host) and
//! destroyed the moment the last participant leaves. Host-only operations
//! resolve the caller's binding, then compare the bound participant against
//! the session's `host_id`.

use crate::codes;
use crate::voting;
use log::info;
use shared::{
    normalize_join_code, now_millis, Participant, Session, SessionStatus, Story,
};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Opaque handle for a live transport connection.
pub type ConnectionId = u64;

/// Which session and participant a connection acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub session_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Connection is not part of any session.")]
    NotBound,
    #[error("Session not found. Please check the join code.")]
    SessionNotFound,
    #[error("Only the host can perform this action.")]
    NotAuthorized,
    #[error("Vote could not be saved.")]
    VoteRejected,
    #[error("No more stories available.")]
    NoMoreStories,
}

impl RegistryError {
    /// Protocol error code carried in `session:error` replies.
    pub fn code(&self) -> shared::ErrorCode {
        match self {
            RegistryError::SessionNotFound => shared::ErrorCode::SessionNotFound,
            RegistryError::VoteRejected => shared::ErrorCode::VoteFailed,
            RegistryError::NotBound
            | RegistryError::NotAuthorized
            | RegistryError::NoMoreStories => shared::ErrorCode::NotAuthorized,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Session membership returned by create/join: the snapshot, the code that
/// resolves to it, and the participant acting for this connection.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session: Session,
    pub join_code: String,
    pub participant: Participant,
}

/// Result of a leave: `session` is `None` when the session was destroyed,
/// so callers skip broadcasting to it.
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub session: Option<Session>,
    pub session_id: String,
    pub participant_id: String,
}

#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub session: Session,
    pub participant_id: String,
}

/// All sessions, keyed every way the dispatcher needs them.
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    /// join code -> session id
    join_codes: HashMap<String, String>,
    /// session id -> join code, for cleanup on destroy
    session_codes: HashMap<String, String>,
    bindings: HashMap<ConnectionId, Binding>,
    /// session id -> connections currently bound to it
    connections: HashMap<String, HashSet<ConnectionId>>,
    /// Applied to new sessions at creation time.
    auto_reveal: bool,
}

impl SessionRegistry {
    pub fn new(auto_reveal: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            join_codes: HashMap::new(),
            session_codes: HashMap::new(),
            bindings: HashMap::new(),
            connections: HashMap::new(),
            auto_reveal,
        }
    }

    /// Allocates a session with the requesting participant as host and binds
    /// the connection to it. Never fails under valid input.
    pub fn create_session(
        &mut self,
        conn: ConnectionId,
        session_name: &str,
        participant_name: &str,
    ) -> SessionEntry {
        let now = now_millis();
        let host = Participant::new(codes::new_participant_id(), participant_name, false, now);
        let session_id = codes::new_session_id();
        let join_code = self.allocate_join_code();

        let session = Session::new(
            session_id.clone(),
            session_name,
            host.clone(),
            self.auto_reveal,
            now,
        );
        self.join_codes.insert(join_code.clone(), session_id.clone());
        self.session_codes.insert(session_id.clone(), join_code.clone());
        self.sessions.insert(session_id.clone(), session.clone());
        self.bind(conn, &session_id, &host.id);

        info!(
            "Session {} ({}) created by {}",
            session_id, join_code, host.name
        );
        SessionEntry {
            session,
            join_code,
            participant: host,
        }
    }

    /// Adds a participant to the session owning `join_code` and binds the
    /// connection. The code is normalized before lookup.
    pub fn join_session(
        &mut self,
        conn: ConnectionId,
        join_code: &str,
        participant_name: &str,
        as_observer: bool,
    ) -> Result<SessionEntry> {
        let code = normalize_join_code(join_code);
        let session_id = self
            .join_codes
            .get(&code)
            .cloned()
            .ok_or(RegistryError::SessionNotFound)?;

        let now = now_millis();
        let participant = Participant::new(
            codes::new_participant_id(),
            participant_name,
            as_observer,
            now,
        );
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or(RegistryError::SessionNotFound)?;
        session.participants.push(participant.clone());
        session.updated_at = now;
        let snapshot = session.clone();

        self.bind(conn, &session_id, &participant.id);
        info!(
            "Participant {} joined session {} as {}",
            participant.name,
            session_id,
            if as_observer { "observer" } else { "voter" }
        );
        Ok(SessionEntry {
            session: snapshot,
            join_code: code,
            participant,
        })
    }

    /// Removes the participant bound to this connection. Transfers host
    /// authority to the longest-joined remaining participant, or destroys
    /// the session when nobody is left.
    pub fn leave_session(&mut self, conn: ConnectionId) -> Result<LeaveOutcome> {
        let binding = self
            .bindings
            .get(&conn)
            .cloned()
            .ok_or(RegistryError::NotBound)?;
        self.unbind(conn);

        let emptied = match self.sessions.get_mut(&binding.session_id) {
            Some(session) => {
                session.participants.retain(|p| p.id != binding.participant_id);
                session.participants.is_empty()
            }
            None => {
                return Ok(LeaveOutcome {
                    session: None,
                    session_id: binding.session_id,
                    participant_id: binding.participant_id,
                })
            }
        };

        if emptied {
            self.destroy_session(&binding.session_id);
            return Ok(LeaveOutcome {
                session: None,
                session_id: binding.session_id,
                participant_id: binding.participant_id,
            });
        }

        let session = self
            .sessions
            .get_mut(&binding.session_id)
            .ok_or(RegistryError::SessionNotFound)?;
        if session.host_id == binding.participant_id {
            // Earliest joined_at wins; strict comparison keeps join order on ties.
            let mut new_host: Option<(u64, String)> = None;
            for p in &session.participants {
                if new_host.as_ref().map_or(true, |(t, _)| p.joined_at < *t) {
                    new_host = Some((p.joined_at, p.id.clone()));
                }
            }
            if let Some((_, id)) = new_host {
                info!(
                    "Host of session {} transferred to {}",
                    binding.session_id, id
                );
                session.host_id = id;
            }
        }
        session.updated_at = now_millis();

        Ok(LeaveOutcome {
            session: Some(session.clone()),
            session_id: binding.session_id,
            participant_id: binding.participant_id,
        })
    }

    /// Records a vote for the bound participant. Rejected for observers,
    /// unbound connections, and sessions without an open round. When the
    /// session auto-reveals and this was the last missing vote, the reveal
    /// happens inside the same update.
    pub fn select_vote(&mut self, conn: ConnectionId, value: &str) -> Result<VoteOutcome> {
        let binding = self
            .bindings
            .get(&conn)
            .cloned()
            .ok_or(RegistryError::VoteRejected)?;
        let session = self
            .sessions
            .get_mut(&binding.session_id)
            .ok_or(RegistryError::VoteRejected)?;
        if !matches!(
            session.status,
            SessionStatus::Voting | SessionStatus::Revealed
        ) {
            return Err(RegistryError::VoteRejected);
        }
        let participant = session
            .participant_mut(&binding.participant_id)
            .ok_or(RegistryError::VoteRejected)?;
        if !participant.select_card(value) {
            return Err(RegistryError::VoteRejected);
        }

        if session.auto_reveal && !session.cards_revealed && session.all_voters_voted() {
            session.status = SessionStatus::Revealed;
            session.cards_revealed = true;
        }
        session.updated_at = now_millis();

        Ok(VoteOutcome {
            session: session.clone(),
            participant_id: binding.participant_id,
        })
    }

    /// Host only: exposes all votes.
    pub fn reveal_cards(&mut self, conn: ConnectionId) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        session.cards_revealed = true;
        session.status = SessionStatus::Revealed;
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: clears every vote and returns to the waiting state.
    pub fn reset_voting(&mut self, conn: ConnectionId) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        session.clear_votes();
        session.cards_revealed = false;
        session.status = SessionStatus::Waiting;
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: opens a round for a free-form story title.
    pub fn start_voting(
        &mut self,
        conn: ConnectionId,
        story: &str,
        description: Option<String>,
    ) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        session.clear_votes();
        session.current_story = Some(story.trim().to_string());
        session.current_story_description = description;
        session.status = SessionStatus::Voting;
        session.cards_revealed = false;
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: appends a story to the queue.
    pub fn add_story(
        &mut self,
        conn: ConnectionId,
        title: &str,
        description: Option<String>,
    ) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        session
            .story_queue
            .push(Story::new(codes::new_story_id(), title, description));
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: removes a story from the queue. Unknown ids are a no-op.
    pub fn remove_story(&mut self, conn: ConnectionId, story_id: &str) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        session.story_queue.retain(|s| s.id != story_id);
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: edits a queued story in place. Unknown ids are a no-op.
    pub fn update_story(
        &mut self,
        conn: ConnectionId,
        story_id: &str,
        title: &str,
        description: Option<String>,
    ) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        if let Some(story) = session.story_queue.iter_mut().find(|s| s.id == story_id) {
            story.title = title.trim().to_string();
            story.description = description;
        }
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Host only: advances to the next queued story and opens a round for
    /// it. A revealed previous story gets stamped with the round's mode as
    /// its estimate. Fails when the queue is exhausted.
    pub fn next_story(&mut self, conn: ConnectionId) -> Result<Session> {
        let session = self.host_session_mut(conn)?;
        let next_index = session.current_story_index.map_or(0, |i| i + 1);
        if next_index >= session.story_queue.len() {
            return Err(RegistryError::NoMoreStories);
        }

        if let Some(prev) = session.current_story_index {
            if session.cards_revealed {
                let result = voting::aggregate(session);
                let story = &mut session.story_queue[prev];
                story.estimated = true;
                story.estimated_value = result.mode;
            }
        }

        let (title, description) = {
            let story = &session.story_queue[next_index];
            (story.title.clone(), story.description.clone())
        };
        session.current_story_index = Some(next_index);
        session.current_story = Some(title);
        session.current_story_description = description;
        session.clear_votes();
        session.status = SessionStatus::Voting;
        session.cards_revealed = false;
        session.updated_at = now_millis();
        Ok(session.clone())
    }

    /// Connections currently bound to a session, for broadcasting.
    pub fn session_connections(&self, session_id: &str) -> Vec<ConnectionId> {
        self.connections
            .get(session_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn session_id_for(&self, conn: ConnectionId) -> Option<String> {
        self.bindings.get(&conn).map(|b| b.session_id.clone())
    }

    pub fn binding_for(&self, conn: ConnectionId) -> Option<&Binding> {
        self.bindings.get(&conn)
    }

    pub fn session(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Resolves a (possibly unnormalized) join code to a session id.
    pub fn session_id_by_code(&self, join_code: &str) -> Option<String> {
        self.join_codes.get(&normalize_join_code(join_code)).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn allocate_join_code(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let code = codes::generate_join_code(&mut rng);
            if !self.join_codes.contains_key(&code) {
                return code;
            }
        }
    }

    /// Resolves the caller to its session and verifies host authority.
    fn host_session_mut(&mut self, conn: ConnectionId) -> Result<&mut Session> {
        let binding = self
            .bindings
            .get(&conn)
            .cloned()
            .ok_or(RegistryError::NotBound)?;
        let session = self
            .sessions
            .get_mut(&binding.session_id)
            .ok_or(RegistryError::SessionNotFound)?;
        if session.host_id != binding.participant_id {
            return Err(RegistryError::NotAuthorized);
        }
        Ok(session)
    }

    /// A connection is bound to at most one session; binding again replaces
    /// the previous binding.
    fn bind(&mut self, conn: ConnectionId, session_id: &str, participant_id: &str) {
        self.unbind(conn);
        self.bindings.insert(
            conn,
            Binding {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        );
        self.connections
            .entry(session_id.to_string())
            .or_default()
            .insert(conn);
    }

    fn unbind(&mut self, conn: ConnectionId) {
        if let Some(binding) = self.bindings.remove(&conn) {
            let now_empty = match self.connections.get_mut(&binding.session_id) {
                Some(set) => {
                    set.remove(&conn);
                    set.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.connections.remove(&binding.session_id);
            }
        }
    }

    fn destroy_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
        self.connections.remove(session_id);
        if let Some(code) = self.session_codes.remove(session_id) {
            self.join_codes.remove(&code);
        }
        info!("Session {} destroyed (no participants left)", session_id);
    }
}
