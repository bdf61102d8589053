use crate::knock_sequence::{KnockSequence, ProtectedEndpoint};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

/// Outcome of a single knock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The knock did not match the expected port, progress starts over
    Reset,
    /// The knock matched, `progress` ports of the sequence have been knocked so far
    Advanced { progress: usize },
    /// The last port of the sequence was knocked, access has to be granted
    Completed,
    /// The host already completed the sequence, nothing changes
    AlreadyGranted,
}

/// Per-host progress through the knock sequence.
///
/// Every transition is a read-modify-write of one map entry under a single lock, so knocks of the
/// same host are linearized. The critical section is O(1), which makes a single lock sufficient
/// for the rate at which firewall log events arrive.
pub struct SequenceTracker {
    sequence: KnockSequence,
    protected: ProtectedEndpoint,
    progress: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl SequenceTracker {
    pub fn new(sequence: KnockSequence, protected: ProtectedEndpoint) -> Self {
        Self {
            sequence,
            protected,
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn protected(&self) -> ProtectedEndpoint {
        self.protected
    }

    pub fn sequence_len(&self) -> usize {
        self.sequence.len()
    }

    pub fn on_knock(&self, source: Ipv4Addr, port: u16) -> Transition {
        let mut progress = self.lock();
        let index = progress.entry(source).or_insert(0);

        match self.sequence.expected_at(*index) {
            None => Transition::AlreadyGranted,
            Some(expected) if expected == port => {
                *index += 1;
                if *index == self.sequence.len() {
                    Transition::Completed
                } else {
                    Transition::Advanced { progress: *index }
                }
            }
            Some(_) => {
                // Even a knock on the first port of the sequence does not count as a new start
                *index = 0;
                Transition::Reset
            }
        }
    }

    /// Marks `source` as granted without knocking, e.g. for pre-trusted addresses
    pub fn mark_granted(&self, source: Ipv4Addr) {
        self.lock().insert(source, self.sequence.len());
    }

    /// Forgets any progress of `source`, so that it has to knock the whole sequence again
    pub fn revoke(&self, source: Ipv4Addr) {
        self.lock().insert(source, 0);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, usize>> {
        // The map is only ever updated by single assignments, a panic cannot leave it inconsistent
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
