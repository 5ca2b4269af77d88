//! Candidate filtering and ordering

use crate::transport::IceCandidate;

/// Relay only UDP over IPv4 candidates.
///
/// Plain substring matching on the candidate text: anything mentioning
/// `udp6`, `tcptls` or an upper-case `UDP` is dropped, and what remains must
/// mention `udp`.
pub fn should_relay_candidate(candidate: &str) -> bool {
    !candidate.contains("udp6")
        && !candidate.contains("tcptls")
        && !candidate.contains("UDP")
        && candidate.contains("udp")
}

/// Remote candidates held back until the remote description is applied
#[derive(Debug, Default)]
pub struct PendingCandidates {
    remote_description_set: bool,
    queued: Vec<IceCandidate>,
}

impl PendingCandidates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the candidate if it may be applied now, otherwise queues it
    pub fn admit(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.remote_description_set {
            Some(candidate)
        } else {
            self.queued.push(candidate);
            None
        }
    }

    /// Mark the remote description as applied and hand back the queue in
    /// arrival order
    pub fn release(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.queued)
    }

    pub fn is_ready(&self) -> bool {
        self.remote_description_set
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Forget everything; the next session starts without a remote description
    pub fn reset(&mut self) {
        self.remote_description_set = false;
        self.queued.clear();
    }
}
