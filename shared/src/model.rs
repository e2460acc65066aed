//! Session data model: participants, stories, sessions, voting results.
//!
//! These types serialize to the camelCase JSON shapes the clients consume,
//! so `session:updated` snapshots can be fed straight to subscribers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Standard deck: Fibonacci-ish values plus "unsure" and "coffee break".
pub const CARD_VALUES: [&str; 14] = [
    "0", "0.5", "1", "2", "3", "5", "8", "13", "21", "34", "55", "89", "?", "☕",
];

/// Join codes avoid visually confusable glyphs (no 0/O, no 1/I).
pub const JOIN_CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of a session join code.
pub const JOIN_CODE_LENGTH: usize = 6;

/// Normalizes user-typed join codes: uppercase, foreign characters stripped.
pub fn normalize_join_code(input: &str) -> String {
    input
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| JOIN_CODE_ALPHABET.contains(*c))
        .collect()
}

/// A named actor inside a session, either a voter or an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Chosen card value, `None` until the participant votes.
    pub selected_value: Option<String>,
    pub is_observer: bool,
    /// Join time as epoch milliseconds; drives host-transfer ordering.
    pub joined_at: u64,
}

impl Participant {
    pub fn new(id: String, name: &str, is_observer: bool, joined_at: u64) -> Self {
        Self {
            id,
            name: name.trim().to_string(),
            selected_value: None,
            is_observer,
            joined_at,
        }
    }

    /// Records a vote. Observers cannot vote; returns false for them.
    pub fn select_card(&mut self, value: &str) -> bool {
        if self.is_observer {
            return false;
        }
        self.selected_value = Some(value.to_string());
        true
    }

    pub fn reset_selection(&mut self) {
        self.selected_value = None;
    }

    pub fn has_voted(&self) -> bool {
        self.selected_value.is_some()
    }

    /// Flips between voter and observer. Becoming an observer always clears
    /// the current selection, observers never hold a vote.
    pub fn toggle_observer(&mut self) {
        self.is_observer = !self.is_observer;
        if self.is_observer {
            self.reset_selection();
        }
    }
}

/// A unit of work queued for estimation. Managed by the host only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub estimated: bool,
    pub estimated_value: Option<String>,
}

impl Story {
    pub fn new(id: String, title: &str, description: Option<String>) -> Self {
        Self {
            id,
            title: title.trim().to_string(),
            description,
            estimated: false,
            estimated_value: None,
        }
    }
}

/// Lifecycle state of a voting round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Waiting,
    Voting,
    Revealed,
    Completed,
}

/// A single planning poker room. The server owns the authoritative copy;
/// clients only ever see full snapshots of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    /// Title of the story currently being estimated, if any.
    pub current_story: Option<String>,
    pub current_story_description: Option<String>,
    /// Position in `story_queue` of the current story, if it came from there.
    pub current_story_index: Option<usize>,
    pub story_queue: Vec<Story>,
    /// Participants in join order. The order is part of the contract: it
    /// drives display, host transfer and mode tie-breaking.
    pub participants: Vec<Participant>,
    pub status: SessionStatus,
    pub cards_revealed: bool,
    pub host_id: String,
    /// Reveal automatically once every voter has cast a card.
    pub auto_reveal: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    pub fn new(id: String, name: &str, host: Participant, auto_reveal: bool, now: u64) -> Self {
        Self {
            id,
            name: name.trim().to_string(),
            current_story: None,
            current_story_description: None,
            current_story_index: None,
            story_queue: Vec::new(),
            host_id: host.id.clone(),
            participants: vec![host],
            status: SessionStatus::Waiting,
            cards_revealed: false,
            auto_reveal,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn participant(&self, id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    /// Non-observer participants, in join order.
    pub fn voters(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| !p.is_observer)
    }

    /// True when there is at least one voter and all of them have voted.
    pub fn all_voters_voted(&self) -> bool {
        let mut any = false;
        for voter in self.voters() {
            if !voter.has_voted() {
                return false;
            }
            any = true;
        }
        any
    }

    pub fn clear_votes(&mut self) {
        for participant in &mut self.participants {
            participant.reset_selection();
        }
    }
}

/// Aggregated outcome of one voting round. Computed on demand, never stored
/// on the session itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotingResult {
    pub story: Option<String>,
    /// Raw vote per participant id.
    pub votes: HashMap<String, String>,
    /// Mean of the numerically parseable votes.
    pub average: Option<f64>,
    /// Median of the numerically parseable votes.
    pub median: Option<f64>,
    /// Most frequent raw value, ties broken by participant join order.
    pub mode: Option<String>,
    pub has_consensus: bool,
    pub timestamp: u64,
}
