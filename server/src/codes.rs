//! Identifier and join-code generation.

use rand::Rng;
use shared::{JOIN_CODE_ALPHABET, JOIN_CODE_LENGTH};
use uuid::Uuid;

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_participant_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn new_story_id() -> String {
    Uuid::new_v4().to_string()
}

/// Draws a join code from the confusable-free alphabet. Uniqueness among
/// active sessions is the registry's job, which retries on collision.
pub fn generate_join_code<R: Rng>(rng: &mut R) -> String {
    let alphabet: Vec<char> = JOIN_CODE_ALPHABET.chars().collect();
    (0..JOIN_CODE_LENGTH)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
        .collect()
}
