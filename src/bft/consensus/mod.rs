//! The Operation Store: one record per `(view, sequence, request_hash)`,
//! accumulating pre-prepare/prepare/commit evidence as the three-phase
//! protocol advances it.

use std::collections::HashMap;

use crate::bft::communication::message::RequestMessage;
use crate::bft::communication::NodeId;
use crate::bft::config_store::ReconfigRequest;
use crate::bft::core::server::ViewParams;
use crate::bft::crypto::hash::Digest;
use crate::bft::ordering::{SeqNo, View};

/// The three-phase stage an [`Operation`] has reached.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    Prepare,
    Commit,
    Execute,
}

/// A single `(view, sequence, request_hash)` record, accumulating
/// pre-prepare/prepare/commit evidence.
///
/// Stage advances monotonically and each transition (`prepared`,
/// `committed`) happens at most once, regardless of how many times
/// duplicate evidence is recorded afterwards.
pub struct Operation<O> {
    view: View,
    seq: SeqNo,
    request_hash: Digest,
    quorum: ViewParams,
    stage: Stage,
    preprepare_seen: bool,
    prepared: bool,
    committed: bool,
    request: Option<RequestMessage<O>>,
    reconfig: Option<ReconfigRequest>,
    session: Option<NodeId>,
    prepares_by_uuid: std::collections::HashSet<NodeId>,
    commits_by_uuid: std::collections::HashSet<NodeId>,
}

impl<O> Operation<O> {
    fn new(view: View, seq: SeqNo, request_hash: Digest, quorum: ViewParams) -> Self {
        Self {
            view,
            seq,
            request_hash,
            quorum,
            stage: Stage::Prepare,
            preprepare_seen: false,
            prepared: false,
            committed: false,
            request: None,
            reconfig: None,
            session: None,
            prepares_by_uuid: std::collections::HashSet::new(),
            commits_by_uuid: std::collections::HashSet::new(),
        }
    }

    /// The view this operation was proposed under.
    pub fn view(&self) -> View {
        self.view
    }

    /// The sequence number assigned to this operation.
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    /// The content hash of the underlying request.
    pub fn request_hash(&self) -> &Digest {
        &self.request_hash
    }

    /// The current stage of this operation.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether a pre-prepare has been recorded for this key.
    pub fn is_preprepared(&self) -> bool {
        self.preprepare_seen
    }

    /// Whether this operation has reached the *prepared* state:
    /// `preprepare_seen ∧ |prepares_seen| ≥ 2f`.
    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Whether this operation has reached the *committed* state:
    /// `prepared ∧ |commits_seen| ≥ 2f+1`.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The request envelope, once learned via a pre-prepare.
    pub fn request(&self) -> Option<&RequestMessage<O>> {
        self.request.as_ref()
    }

    /// The client session this operation's reply should be routed to, if
    /// any is still held (sessions do not survive a restart).
    pub fn session(&self) -> Option<NodeId> {
        self.session
    }

    /// Records the pre-prepare for this operation. Returns `false` if a
    /// pre-prepare was already recorded (idempotent).
    pub fn record_preprepare(
        &mut self,
        request: RequestMessage<O>,
        session: Option<NodeId>,
    ) -> bool {
        if self.preprepare_seen {
            return false;
        }
        self.preprepare_seen = true;
        self.request = Some(request);
        self.session = session;
        true
    }

    /// Records a reconfiguration pre-prepare for this operation. Returns
    /// `false` if a pre-prepare was already recorded (idempotent).
    pub fn record_reconfig_preprepare(&mut self, reconfig: ReconfigRequest) -> bool {
        if self.preprepare_seen {
            return false;
        }
        self.preprepare_seen = true;
        self.reconfig = Some(reconfig);
        true
    }

    /// The reconfiguration request, once learned via a pre-prepare.
    pub fn reconfig(&self) -> Option<&ReconfigRequest> {
        self.reconfig.as_ref()
    }

    /// Records a prepare vote from `from`. Returns `true` the moment this
    /// vote causes the operation to transition into the prepared state.
    pub fn record_prepare(&mut self, from: NodeId) -> bool {
        self.prepares_by_uuid.insert(from);
        if !self.prepared
            && self.preprepare_seen
            && self.prepares_by_uuid.len() >= self.quorum.prepare_quorum()
        {
            self.prepared = true;
            self.stage = Stage::Commit;
            return true;
        }
        false
    }

    /// Records a commit vote from `from`. Returns `true` the moment this
    /// vote causes the operation to transition into the committed state.
    pub fn record_commit(&mut self, from: NodeId) -> bool {
        self.commits_by_uuid.insert(from);
        if !self.committed && self.prepared && self.commits_by_uuid.len() >= self.quorum.quorum() {
            self.committed = true;
            self.stage = Stage::Execute;
            return true;
        }
        false
    }
}

/// Find-or-construct map of [`Operation`]s, keyed by `(view, sequence,
/// request_hash)`.
///
/// `find_or_construct` always returns the same instance for a given key for
/// as long as it lives in the store -- this is essential because client
/// session handles are held in-memory on the operation itself.
pub struct OperationStore<O> {
    operations: HashMap<(View, SeqNo, Digest), Operation<O>>,
}

impl<O> OperationStore<O> {
    /// Creates an empty operation store.
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Number of live operation records.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns `true` if the store holds no operations.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Finds the operation for `(view, seq, hash)`, constructing and
    /// inserting one if it doesn't exist yet.
    pub fn find_or_construct(
        &mut self,
        view: View,
        seq: SeqNo,
        hash: Digest,
        quorum: ViewParams,
    ) -> &mut Operation<O> {
        self.operations
            .entry((view, seq, hash))
            .or_insert_with(|| Operation::new(view, seq, hash, quorum))
    }

    /// Looks up the operation for `(view, seq, hash)`, if one exists.
    pub fn get(&self, view: View, seq: SeqNo, hash: &Digest) -> Option<&Operation<O>> {
        self.operations.get(&(view, seq, *hash))
    }

    /// Returns the hash of the pre-prepare already accepted for `(view,
    /// seq)`, if any -- used to detect a conflicting pre-prepare carrying a
    /// different hash for the same slot.
    pub fn preprepared_hash_at(&self, view: View, seq: SeqNo) -> Option<Digest> {
        self.operations
            .iter()
            .find(|((v, s, _), op)| *v == view && *s == seq && op.is_preprepared())
            .map(|((_, _, hash), _)| *hash)
    }

    /// Removes every operation whose sequence is `<= seq` -- called once a
    /// checkpoint at `seq` stabilizes.
    pub fn delete_operations_until(&mut self, seq: SeqNo) {
        self.operations.retain(|(_, s, _), _| *s > seq);
    }
}

impl<O: Clone> OperationStore<O> {
    /// Finds a previously pre-prepared request matching `(seq, hash)` under
    /// any view -- used to recover the original request content when
    /// re-processing a pre-prepare re-issued by a new-view announcement.
    pub fn find_request_by_hash(&self, seq: SeqNo, hash: &Digest) -> Option<RequestMessage<O>> {
        self.operations
            .values()
            .find(|op| op.seq == seq && op.request_hash == *hash && op.preprepare_seen)
            .and_then(|op| op.request.clone())
    }

    /// Collects `(seq, hash)` prepared-proofs for every operation prepared
    /// above `since` -- the evidence a view-change vote carries to justify
    /// re-issuing those sequences under the new view.
    pub fn prepared_proofs_since(&self, since: SeqNo) -> Vec<(SeqNo, Digest)> {
        self.operations
            .values()
            .filter(|op| op.seq > since && op.is_prepared())
            .map(|op| (op.seq, op.request_hash))
            .collect()
    }
}

impl<O> Default for OperationStore<O> {
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
    fn find_or_construct_returns_same_instance() {
        let mut store: OperationStore<u32> = OperationStore::new();
        let hash = Digest::from_data(b"op");
        store
            .find_or_construct(View::ZERO, SeqNo::from(1), hash, quorum())
            .record_preprepare(RequestMessage::new(7), Some(NodeId::from(2)));
        let op = store.find_or_construct(View::ZERO, SeqNo::from(1), hash, quorum());
        assert_eq!(*op.request().unwrap().operation(), 7);
    }

    #[test]
    fn prepares_then_commits_advance_stage_once() {
        let mut store: OperationStore<u32> = OperationStore::new();
        let hash = Digest::from_data(b"op");
        let op = store.find_or_construct(View::ZERO, SeqNo::from(1), hash, quorum());
        op.record_preprepare(RequestMessage::new(7), None);

        assert!(!op.record_prepare(NodeId::from(0)));
        assert!(op.record_prepare(NodeId::from(1)));
        // prepare_quorum() == 2, so a third vote shouldn't re-trigger
        assert!(!op.record_prepare(NodeId::from(2)));
        assert!(op.is_prepared());

        assert!(!op.record_commit(NodeId::from(0)));
        assert!(!op.record_commit(NodeId::from(1)));
        assert!(op.record_commit(NodeId::from(2)));
        assert!(op.is_committed());
        assert_eq!(op.stage(), Stage::Execute);
    }

    #[test]
    fn duplicate_votes_from_same_sender_do_not_count_twice() {
        let mut store: OperationStore<u32> = OperationStore::new();
        let hash = Digest::from_data(b"op");
        let op = store.find_or_construct(View::ZERO, SeqNo::from(1), hash, quorum());
        op.record_preprepare(RequestMessage::new(7), None);
        op.record_prepare(NodeId::from(0));
        op.record_prepare(NodeId::from(0));
        op.record_prepare(NodeId::from(0));
        assert!(!op.is_prepared());
    }

    #[test]
    fn delete_operations_until_prunes_lower_sequences() {
        let mut store: OperationStore<u32> = OperationStore::new();
        store.find_or_construct(View::ZERO, SeqNo::from(1), Digest::initial(), quorum());
        store.find_or_construct(View::ZERO, SeqNo::from(2), Digest::initial(), quorum());
        store.find_or_construct(View::ZERO, SeqNo::from(3), Digest::initial(), quorum());
        store.delete_operations_until(SeqNo::from(2));
        assert_eq!(store.len(), 1);
        assert!(store
            .get(View::ZERO, SeqNo::from(3), &Digest::initial())
            .is_some());
    }
}
