//! Leader election and gating: pure logic, no I/O
//!
//! Kept free of adapters and storage so every rule the cycle applies is
//! unit-testable: per-client delta gates, the inter-client gate, leader
//! election with its tie-breaks, and the anti-regression guard.

use crate::clients::{ClientName, ClientState, Position};

/// Per-client minimum-change thresholds
#[derive(Debug, Clone)]
pub struct DeltaPolicy {
    /// ABS contributes only on a timestamp move of at least this many seconds
    pub abs_seconds: f64,
    /// KoSync needs both a percentage move...
    pub kosync_percent: f64,
    /// ...and a character move of at least this many words
    pub kosync_words: u64,
    /// Everyone else: percentage move (fraction, 0.005 = 0.5%)
    pub default_percent: f64,
    /// Leader must differ from some follower's cached position by this much
    pub between_clients: f64,
    /// Backwards moves beyond this fraction are refused
    pub regression_tolerance: f64,
}

impl Default for DeltaPolicy {
    fn default() -> Self {
        DeltaPolicy {
            abs_seconds: 60.0,
            kosync_percent: 0.01,
            kosync_words: 400,
            default_percent: 0.005,
            between_clients: 0.005,
            regression_tolerance: 0.005,
        }
    }
}

/// Average word length used to convert a word gate into characters
const CHARS_PER_WORD: f64 = 5.0;

/// One client's view going into election
#[derive(Debug, Clone)]
pub struct Candidate {
    pub client: ClientName,
    pub state: ClientState,
    /// Normalized 0.0–1.0 position
    pub normalized: f64,
    /// Cached normalized position from the progress store
    pub previous: Option<f64>,
    /// Cached audio timestamp from the progress store
    pub previous_ts: Option<f64>,
    pub can_lead: bool,
}

impl Candidate {
    /// Does this client's change exceed its own delta gate?
    pub fn delta_exceeded(&self, policy: &DeltaPolicy, text_len: Option<usize>) -> bool {
        match self.client {
            ClientName::Abs => {
                let Position::Audio { seconds, .. } = &self.state.position else {
                    return false;
                };
                let prev = self.previous_ts.unwrap_or(0.0);
                (seconds - prev).abs() >= policy.abs_seconds
            }
            ClientName::KoReaderSync => {
                let prev = self.previous.unwrap_or(0.0);
                let delta_pct = (self.normalized - prev).abs();
                if delta_pct < policy.kosync_percent {
                    return false;
                }
                match text_len {
                    Some(len) => {
                        let delta_chars = delta_pct * len as f64;
                        delta_chars >= policy.kosync_words as f64 * CHARS_PER_WORD
                    }
                    // Without a parsed ebook the percentage gate stands alone
                    None => true,
                }
            }
            _ => {
                let prev = self.previous.unwrap_or(0.0);
                (self.normalized - prev).abs() >= policy.default_percent
            }
        }
    }
}

/// Pick the leader among contributing candidates.
///
/// Latest `last_updated` wins; ties break to the higher normalized
/// position, then to client-name order.
pub fn elect_leader(contributors: &[Candidate]) -> Option<&Candidate> {
    contributors
        .iter()
        .filter(|c| c.can_lead)
        .max_by(|a, b| {
            a.state
                .last_updated
                .partial_cmp(&b.state.last_updated)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    a.normalized
                        .partial_cmp(&b.normalized)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                // Reversed so the earlier client in declaration order
                // compares greater and wins the final tie
                .then_with(|| b.client.cmp(&a.client))
        })
}

/// Inter-client gate: proceed only when the leader actually disagrees
/// with at least one follower's cached position
pub fn crosses_client_gate(
    leader_pct: f64,
    follower_cached: &[f64],
    threshold: f64,
) -> bool {
    if follower_cached.is_empty() {
        return true;
    }
    follower_cached
        .iter()
        .any(|cached| (leader_pct - cached).abs() >= threshold)
}

/// Anti-regression: a leader moving everyone backwards is refused unless
/// it is the same source as the previous leader or the user forced it
pub fn regression_allowed(
    leader_pct: f64,
    max_cached: f64,
    tolerance: f64,
    same_source_as_previous: bool,
    force: bool,
) -> bool {
    if force || same_source_as_previous {
        return true;
    }
    leader_pct >= max_cached - tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_candidate(seconds: f64, prev_ts: Option<f64>, last_updated: f64) -> Candidate {
        Candidate {
            client: ClientName::Abs,
            state: ClientState {
                last_updated,
                position: Position::Audio {
                    seconds,
                    duration: Some(3600.0),
                },
            },
            normalized: seconds / 3600.0,
            previous: prev_ts.map(|t| t / 3600.0),
            previous_ts: prev_ts,
            can_lead: true,
        }
    }

    fn text_candidate(client: ClientName, pct: f64, prev: Option<f64>, last_updated: f64) -> Candidate {
        Candidate {
            client,
            state: ClientState {
                last_updated,
                position: Position::Text {
                    percentage: pct,
                    xpath: None,
                    css_selector: None,
                    fragment: None,
                    cfi: None,
                },
            },
            normalized: pct,
            previous: prev,
            previous_ts: None,
            can_lead: true,
        }
    }

    #[test]
    fn abs_gate_is_seconds_based() {
        let policy = DeltaPolicy::default();
        assert!(!audio_candidate(1030.0, Some(1000.0), 0.0).delta_exceeded(&policy, None));
        assert!(audio_candidate(1090.0, Some(1000.0), 0.0).delta_exceeded(&policy, None));
    }

    #[test]
    fn kosync_gate_needs_percent_and_characters() {
        let policy = DeltaPolicy::default();
        let candidate = text_candidate(ClientName::KoReaderSync, 0.52, Some(0.50), 0.0);
        // 2% of a 50k-char book = 1000 chars < 2000-char word gate
        assert!(!candidate.delta_exceeded(&policy, Some(50_000)));
        // Same percentages on a 200k-char book = 4000 chars
        assert!(candidate.delta_exceeded(&policy, Some(200_000)));
        // Below the percentage gate regardless of size
        let small = text_candidate(ClientName::KoReaderSync, 0.505, Some(0.50), 0.0);
        assert!(!small.delta_exceeded(&policy, Some(200_000)));
    }

    #[test]
    fn default_gate_is_half_percent() {
        let policy = DeltaPolicy::default();
        assert!(!text_candidate(ClientName::Storyteller, 0.503, Some(0.50), 0.0)
            .delta_exceeded(&policy, None));
        assert!(text_candidate(ClientName::Storyteller, 0.51, Some(0.50), 0.0)
            .delta_exceeded(&policy, None));
    }

    #[test]
    fn latest_update_wins() {
        let candidates = vec![
            text_candidate(ClientName::Storyteller, 0.8, None, 100.0),
            text_candidate(ClientName::KoReaderSync, 0.3, None, 200.0),
        ];
        let leader = elect_leader(&candidates).unwrap();
        assert_eq!(leader.client, ClientName::KoReaderSync);
    }

    #[test]
    fn tie_breaks_to_higher_percentage() {
        let candidates = vec![
            text_candidate(ClientName::Storyteller, 0.4, None, 100.0),
            text_candidate(ClientName::KoReaderSync, 0.6, None, 100.0),
        ];
        let leader = elect_leader(&candidates).unwrap();
        assert_eq!(leader.client, ClientName::KoReaderSync);
    }

    #[test]
    fn full_tie_breaks_to_client_order() {
        let candidates = vec![
            text_candidate(ClientName::Booklore, 0.5, None, 100.0),
            text_candidate(ClientName::KoReaderSync, 0.5, None, 100.0),
        ];
        let leader = elect_leader(&candidates).unwrap();
        assert_eq!(leader.client, ClientName::KoReaderSync);
    }

    #[test]
    fn non_leaders_never_elected() {
        let mut tracker = text_candidate(ClientName::Hardcover, 0.9, None, 999.0);
        tracker.can_lead = false;
        let candidates = vec![
            tracker,
            text_candidate(ClientName::KoReaderSync, 0.3, None, 10.0),
        ];
        let leader = elect_leader(&candidates).unwrap();
        assert_eq!(leader.client, ClientName::KoReaderSync);
    }

    #[test]
    fn inter_client_gate_requires_disagreement() {
        assert!(!crosses_client_gate(0.500, &[0.501, 0.499], 0.005));
        assert!(crosses_client_gate(0.52, &[0.501, 0.499], 0.005));
        assert!(crosses_client_gate(0.5, &[], 0.005));
    }

    #[test]
    fn regression_refused_from_new_source() {
        assert!(!regression_allowed(0.0, 0.9, 0.005, false, false));
        assert!(regression_allowed(0.0, 0.9, 0.005, false, true)); // forced
        assert!(regression_allowed(0.0, 0.9, 0.005, true, false)); // same source
        assert!(regression_allowed(0.898, 0.9, 0.005, false, false)); // within tolerance
    }
}
