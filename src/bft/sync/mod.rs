//! The View-Change Machine: drives view-change and new-view messages when
//! the failure detector or a quorum of peers believes the primary has
//! stalled.
//!
//! Module name chosen to match the teacher's own forward-referenced (but
//! unretrieved) `crate::bft::sync::Synchronizer` import.

use std::collections::HashMap;

use crate::bft::communication::message::{NewViewMessage, ViewChangeMessage};
use crate::bft::communication::NodeId;
use crate::bft::core::server::ViewParams;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{SeqNo, View};

/// Accumulates view-change votes per target view, and builds/verifies
/// new-view announcements.
pub struct ViewChangeMachine {
    votes: HashMap<View, HashMap<NodeId, ViewChangeMessage>>,
}

impl ViewChangeMachine {
    /// Creates an empty view-change machine.
    pub fn new() -> Self {
        Self {
            votes: HashMap::new(),
        }
    }

    /// Builds this replica's own view-change vote targeting `new_view`,
    /// carrying its latest stable checkpoint and prepared-proofs for every
    /// sequence still prepared locally beyond it.
    pub fn build_view_change(
        new_view: View,
        last_stable_checkpoint: SeqNo,
        prepared: Vec<(SeqNo, Digest)>,
    ) -> ViewChangeMessage {
        ViewChangeMessage::new(new_view, last_stable_checkpoint, prepared)
    }

    /// Records an inbound view-change vote. Returns `true` once `2f+1`
    /// distinct votes have been collected for `vote`'s target view.
    pub fn record_view_change(
        &mut self,
        from: NodeId,
        vote: ViewChangeMessage,
        quorum: ViewParams,
    ) -> bool {
        let new_view = vote.new_view();
        let entry = self.votes.entry(new_view).or_insert_with(HashMap::new);
        entry.insert(from, vote);
        entry.len() >= quorum.quorum()
    }

    /// Number of distinct view-change votes collected so far for `view`.
    pub fn vote_count(&self, view: View) -> usize {
        self.votes.get(&view).map_or(0, |v| v.len())
    }

    /// Once `2f+1` votes for `new_view` are collected, builds the new-view
    /// envelope: the vote quorum, plus a re-issued pre-prepare for every
    /// sequence in `(min_stable_in_v, max_prepared_in_v]`, carrying either
    /// a prepared-proof's hash or a no-op.
    pub fn build_new_view(&self, new_view: View, quorum: ViewParams) -> Option<NewViewMessage> {
        let votes_map = self.votes.get(&new_view)?;
        if votes_map.len() < quorum.quorum() {
            return None;
        }
        let votes: Vec<ViewChangeMessage> = votes_map.values().cloned().collect();

        let min_stable = votes
            .iter()
            .map(|v| v.last_stable_checkpoint())
            .min()
            .unwrap();
        let max_prepared = votes
            .iter()
            .flat_map(|v| v.prepared().iter().map(|(s, _)| *s))
            .max()
            .unwrap_or(min_stable);

        let mut reissued = Vec::new();
        let mut s = min_stable.next();
        while s <= max_prepared {
            let hash = votes
                .iter()
                .flat_map(|v| v.prepared().iter())
                .find(|(seq, _)| *seq == s)
                .map(|(_, h)| *h)
                .unwrap_or_else(Digest::no_op);
            reissued.push((s, hash));
            s = s.next();
        }

        Some(NewViewMessage::new(new_view, votes, reissued))
    }

    /// Verifies an inbound new-view announcement: its vote set meets quorum
    /// and every vote actually targets the announced view.
    pub fn verify_new_view(new_view: &NewViewMessage, quorum: ViewParams) -> bool {
        new_view.votes().len() >= quorum.quorum()
            && new_view
                .votes()
                .iter()
                .all(|v| v.new_view() == new_view.view())
    }

    /// Drops accumulated votes for views `<= view`, once `view` has been
    /// adopted as current.
    pub fn discard_votes_until(&mut self, view: View) {
        self.votes.retain(|v, _| *v > view);
    }
}

impl Default for ViewChangeMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quorum() -> ViewParams {
        ViewParams::new(4, 1).unwrap()
    }

    #[test]
    fn quorum_of_votes_allows_new_view_construction() {
        let mut machine = ViewChangeMachine::new();
        let target = View::from(1);
        let vote = ViewChangeMachine::build_view_change(target, SeqNo::ZERO, vec![]);

        assert!(!machine.record_view_change(NodeId::from(1), vote.clone(), quorum()));
        assert!(!machine.record_view_change(NodeId::from(2), vote.clone(), quorum()));
        assert!(machine.record_view_change(NodeId::from(3), vote, quorum()));

        let new_view = machine.build_new_view(target, quorum()).unwrap();
        assert!(ViewChangeMachine::verify_new_view(&new_view, quorum()));
        assert_eq!(new_view.votes().len(), 3);
    }

    #[test]
    fn reissues_prepared_proofs_where_they_exist_and_noop_in_the_gap() {
        let mut machine = ViewChangeMachine::new();
        let target = View::from(1);
        let hash_at_2 = Digest::from_data(b"op-at-2");
        let hash_at_4 = Digest::from_data(b"op-at-4");

        let votes = [
            ViewChangeMachine::build_view_change(
                target,
                SeqNo::from(1),
                vec![(SeqNo::from(2), hash_at_2)],
            ),
            ViewChangeMachine::build_view_change(
                target,
                SeqNo::from(1),
                vec![(SeqNo::from(4), hash_at_4)],
            ),
            ViewChangeMachine::build_view_change(target, SeqNo::from(1), vec![]),
        ];
        for (i, vote) in votes.into_iter().enumerate() {
            machine.record_view_change(NodeId::from(i as u32), vote, quorum());
        }

        let new_view = machine.build_new_view(target, quorum()).unwrap();
        assert_eq!(
            new_view.reissued(),
            &[
                (SeqNo::from(2), hash_at_2),
                (SeqNo::from(3), Digest::no_op()),
                (SeqNo::from(4), hash_at_4),
            ]
        );
    }

    #[test]
    fn below_quorum_votes_do_not_build_a_new_view() {
        let mut machine = ViewChangeMachine::new();
        let target = View::from(1);
        let vote = ViewChangeMachine::build_view_change(target, SeqNo::ZERO, vec![]);
        machine.record_view_change(NodeId::from(1), vote, quorum());
        assert!(machine.build_new_view(target, quorum()).is_none());
    }
}
