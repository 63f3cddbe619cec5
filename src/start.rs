//! Round start handshake.
//!
//! START broadcasts the grid tagged with a fresh message id. The countdown
//! begins once every connected player has acknowledged that id, or when the
//! fallback timer fires, whichever happens first.

use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// False for an id that does not belong to the current sequence.
    pub valid: bool,
    pub all_ready: bool,
}

#[derive(Debug)]
struct StartSequence {
    message_id: String,
    expected: HashSet<String>,
    acked: HashSet<String>,
    countdown_started: bool,
}

impl StartSequence {
    fn all_ready(&self) -> bool {
        self.expected.iter().all(|u| self.acked.contains(u))
    }
}

#[derive(Debug, Default)]
pub struct StartCoordinator {
    sequence: Option<StartSequence>,
}

impl StartCoordinator {
    /// Starts a new sequence, superseding any previous one.
    pub fn initialize_sequence(&mut self, usernames: impl IntoIterator<Item = String>) -> String {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.sequence = Some(StartSequence {
            message_id: message_id.clone(),
            expected: usernames.into_iter().collect(),
            acked: HashSet::new(),
            countdown_started: false,
        });
        message_id
    }

    pub fn record_acknowledgment(&mut self, username: &str, message_id: &str) -> AckOutcome {
        let Some(seq) = self
            .sequence
            .as_mut()
            .filter(|s| s.message_id == message_id)
        else {
            return AckOutcome {
                valid: false,
                all_ready: false,
            };
        };
        seq.acked.insert(username.to_string());
        AckOutcome {
            valid: true,
            all_ready: seq.all_ready(),
        }
    }

    /// Stops waiting for `username`. Returns true if everyone left has acknowledged.
    pub fn forget(&mut self, username: &str) -> bool {
        match self.sequence.as_mut() {
            Some(seq) if !seq.countdown_started => {
                seq.expected.remove(username);
                seq.all_ready()
            }
            _ => false,
        }
    }

    /// Marks the countdown as started. Only the first call for the current id wins.
    pub fn begin(&mut self, message_id: &str) -> bool {
        match self.sequence.as_mut() {
            Some(seq) if seq.message_id == message_id && !seq.countdown_started => {
                seq.countdown_started = true;
                true
            }
            _ => false,
        }
    }

    pub fn current_id(&self) -> Option<&str> {
        self.sequence.as_ref().map(|s| s.message_id.as_str())
    }

    pub fn pending(&self) -> usize {
        self.sequence
            .as_ref()
            .map(|s| s.expected.difference(&s.acked).count())
            .unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.sequence = None;
    }
}
