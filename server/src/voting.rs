//! Vote aggregation for a revealed round.

use shared::{now_millis, Session, VotingResult};
use std::collections::HashMap;

/// Summarizes the current round of a session. Observers are skipped; votes
/// that parse as numbers feed the average and median, while the mode runs
/// over all raw values (so "?" or "☕" can win it). Consensus means every
/// voter cast the same value, with at least one voter present.
pub fn aggregate(session: &Session) -> VotingResult {
    // (participant id, value) in join order, so the mode tie-break is stable
    let cast: Vec<(String, String)> = session
        .voters()
        .filter_map(|p| {
            p.selected_value
                .as_ref()
                .map(|v| (p.id.clone(), v.clone()))
        })
        .collect();

    let numeric: Vec<f64> = cast
        .iter()
        .filter_map(|(_, v)| v.parse::<f64>().ok())
        .collect();

    let average = if numeric.is_empty() {
        None
    } else {
        Some(numeric.iter().sum::<f64>() / numeric.len() as f64)
    };
    let median = median_of(&numeric);
    let mode = mode_of(&cast);

    let voter_count = session.voters().count();
    let has_consensus = voter_count > 0
        && cast.len() == voter_count
        && cast.windows(2).all(|w| w[0].1 == w[1].1);

    VotingResult {
        story: session.current_story.clone(),
        votes: cast.into_iter().collect::<HashMap<_, _>>(),
        average,
        median,
        mode,
        has_consensus,
        timestamp: now_millis(),
    }
}

fn median_of(numeric: &[f64]) -> Option<f64> {
    if numeric.is_empty() {
        return None;
    }
    let mut sorted = numeric.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Most frequent raw value. Ties keep the value that reached the count first
/// in join order, which is why counts are compared strictly.
fn mode_of(cast: &[(String, String)]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for (_, value) in cast {
        match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, n)) => *n += 1,
            None => counts.push((value, 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (value, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((value, n));
        }
    }
    best.map(|(value, _)| value.to_string())
}
