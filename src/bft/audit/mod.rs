//! Passive safety-violation monitor.
//!
//! Watches the audit message stream for conflicting commits at the same
//! sequence, and conflicting primaries claimed within the same view. It
//! never retries or recovers: each key is write-once, matching the
//! external, read-only nature of the observer described by the spec.

use std::collections::HashMap;

use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{SeqNo, View};

/// Correlates commit-notifications and leader-claims across replicas to
/// surface safety violations.
pub struct AuditObserver {
    mem_size: usize,
    commits: HashMap<SeqNo, Digest>,
    leaders: HashMap<View, uuid::Uuid>,
    errors: Vec<String>,
}

impl AuditObserver {
    /// Creates a new observer, bounding the number of errors it retains to
    /// `mem_size`.
    pub fn new(mem_size: usize) -> Self {
        Self {
            mem_size,
            commits: HashMap::new(),
            leaders: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Records a commit attestation for `seq`. Appends an error if a
    /// different hash was previously recorded for the same sequence.
    pub fn commit_notification(&mut self, seq: SeqNo, hash: Digest) {
        match self.commits.get(&seq) {
            Some(previous) if *previous != hash => {
                self.push_error(format!(
                    "conflicting commit at sequence {:?}: {:?} vs {:?}",
                    seq, previous, hash
                ));
            }
            Some(_) => {}
            None => {
                self.commits.insert(seq, hash);
            }
        }
    }

    /// Records a leader-election attestation for `view`. Appends an error
    /// if a different uuid was previously recorded for the same view.
    pub fn leader_status(&mut self, view: View, uuid: uuid::Uuid) {
        match self.leaders.get(&view) {
            Some(previous) if *previous != uuid => {
                self.push_error(format!(
                    "conflicting primary at view {:?}: {} vs {}",
                    view, previous, uuid
                ));
            }
            Some(_) => {}
            None => {
                self.leaders.insert(view, uuid);
            }
        }
    }

    fn push_error(&mut self, message: String) {
        tracing::error!(%message, "audit observer detected a safety violation");
        self.errors.push(message);
        if self.errors.len() > self.mem_size {
            self.errors.remove(0);
        }
    }

    /// The safety-violation errors recorded so far.
    pub fn error_strings(&self) -> &[String] {
        &self.errors
    }

    /// Number of safety violations recorded so far.
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreeing_commits_raise_no_error() {
        let mut audit = AuditObserver::new(100);
        let hash = Digest::from_data(b"op");
        audit.commit_notification(SeqNo::from(5), hash);
        audit.commit_notification(SeqNo::from(5), hash);
        assert_eq!(audit.error_count(), 0);
    }

    #[test]
    fn conflicting_commits_at_same_sequence_raise_one_error() {
        let mut audit = AuditObserver::new(100);
        audit.commit_notification(SeqNo::from(5), Digest::from_data(b"H1"));
        audit.commit_notification(SeqNo::from(5), Digest::from_data(b"H2"));
        assert_eq!(audit.error_count(), 1);
        assert!(audit.error_strings()[0].contains("sequence"));
    }

    #[test]
    fn conflicting_leaders_within_a_view_raise_an_error() {
        let mut audit = AuditObserver::new(100);
        let u1 = uuid::Uuid::new_v4();
        let u2 = uuid::Uuid::new_v4();
        audit.leader_status(View::from(3), u1);
        audit.leader_status(View::from(3), u2);
        assert_eq!(audit.error_count(), 1);
    }

    #[test]
    fn error_buffer_is_fifo_bounded() {
        let mut audit = AuditObserver::new(2);
        for i in 0..5u8 {
            audit.commit_notification(SeqNo::from(i as u32), Digest::from_data(&[i]));
            audit.commit_notification(SeqNo::from(i as u32), Digest::from_data(&[i, i]));
        }
        assert_eq!(audit.error_count(), 2);
    }
}
