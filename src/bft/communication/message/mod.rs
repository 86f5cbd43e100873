//! This module contains types associated with messages traded
//! between the system processes.

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::bft::crypto::hash::Digest;
use crate::bft::crypto::signature::Signature;
use crate::bft::communication::NodeId;
use crate::bft::config_store::{Configuration, ReconfigRequest};
use crate::bft::core::server::ViewInfo;
use crate::bft::ordering::SeqNo;

/// A header that travels alongside every envelope on the wire. Unlike the
/// original fixed-size, transmute-based header, this one is serialized with
/// the rest of the envelope -- there is no hand-rolled wire layout to get
/// wrong, and the signature can vary in length across signature schemes.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Header {
    version: u32,
    from: NodeId,
    to: NodeId,
}

impl Header {
    /// The current version of the wire protocol.
    pub const CURRENT_VERSION: u32 = 1;

    /// Builds a new header.
    pub fn new(from: NodeId, to: NodeId) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            from,
            to,
        }
    }

    /// Protocol version this header was stamped with.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Originating replica.
    pub fn from(&self) -> NodeId {
        self.from
    }

    /// Destination replica.
    pub fn to(&self) -> NodeId {
        self.to
    }
}

/// A signed, content-addressed unit of wire traffic.
///
/// Mirrors the `Envelope` of the spec's wire protocol: a `Header`, a
/// signature over `(header, payload)`, and a tagged payload.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct Envelope<O> {
    header: Header,
    signature: Signature,
    digest: Digest,
    payload: SystemMessage<O>,
}

impl<O> Envelope<O> {
    /// Builds an envelope out of its already-computed parts: a signature
    /// over `digest`, itself the hash of `payload`'s canonical encoding.
    pub fn new(header: Header, digest: Digest, signature: Signature, payload: SystemMessage<O>) -> Self {
        Self {
            header,
            signature,
            digest,
            payload,
        }
    }

    /// Returns the header of this envelope.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the content digest covering the payload.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Returns the signature stamped over `(header, digest)`.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Returns a reference to the tagged payload.
    pub fn payload(&self) -> &SystemMessage<O> {
        &self.payload
    }

    /// Consumes the envelope, yielding its parts.
    pub fn into_inner(self) -> (Header, SystemMessage<O>) {
        (self.header, self.payload)
    }
}

/// A `SystemMessage` corresponds to a message regarding one of the SMR
/// sub-protocols; the variant set mirrors the spec's `PayloadTag`s.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum SystemMessage<O> {
    /// A client operation request.
    Request(RequestMessage<O>),
    /// `PRE-PREPARE` / `PREPARE` / `COMMIT`.
    Consensus(ConsensusMessage<O>),
    /// Checkpoint attestation gossip.
    Checkpoint(CheckpointMessage),
    /// Request for a peer's current stable/local checkpoint pair.
    CheckpointRequest(SeqNo),
    /// Reply to a [`SystemMessage::CheckpointRequest`], carrying a
    /// serialized service state snapshot for the requested sequence.
    CheckpointResponse(SeqNo, Vec<u8>),
    /// A view-change vote.
    ViewChange(ViewChangeMessage),
    /// A new-view announcement from the newly elected primary.
    NewView(NewViewMessage),
    /// Request to join the replica group with a given configuration.
    Join(Configuration),
    /// Notification that a replica is leaving the group.
    Leave(NodeId),
    /// Opaque bytes destined for the replicated service (a committed
    /// operation's serialized payload, or a direct passthrough read).
    Database(Vec<u8>),
    /// Audit observer gossip: a commit or leader-election attestation.
    Audit(AuditMessage),
    /// Status probe.
    StatusRequest,
    /// Status probe reply.
    StatusResponse(StatusMessage),
}

/// Represents a request from a client.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct RequestMessage<O> {
    operation: O,
}

impl<O> RequestMessage<O> {
    /// Creates a new `RequestMessage`.
    pub fn new(operation: O) -> Self {
        Self { operation }
    }

    /// Returns a reference to the operation of type `O`.
    pub fn operation(&self) -> &O {
        &self.operation
    }

    /// Consumes the message, returning the inner operation.
    pub fn into_inner(self) -> O {
        self.operation
    }
}

/// Represents a message from the consensus sub-protocol.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ConsensusMessage<O> {
    seq: SeqNo,
    view: ViewInfo,
    kind: ConsensusMessageKind<O>,
}

/// Represents one of the three PBFT consensus phases.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum ConsensusMessageKind<O> {
    /// Pre-prepare a batch of requests.
    PrePrepare(Vec<RequestMessage<O>>),
    /// Pre-prepare a reconfiguration request (join/leave). Shares the same
    /// sequence-number space, and the same `Prepare`/`Commit` phases, as an
    /// ordinary request pre-prepare.
    ReconfigPrePrepare(ReconfigRequest),
    /// Prepare a request batch identified by its digest.
    Prepare(Digest),
    /// Commit a request batch identified by its digest.
    Commit(Digest),
}

impl<O> ConsensusMessage<O> {
    /// Creates a new `ConsensusMessage`.
    pub fn new(seq: SeqNo, view: ViewInfo, kind: ConsensusMessageKind<O>) -> Self {
        Self { seq, view, kind }
    }

    /// Returns the sequence number of this consensus message.
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    /// Returns the view under which this message was produced.
    pub fn view(&self) -> ViewInfo {
        self.view
    }

    /// Returns a reference to the consensus message kind.
    pub fn kind(&self) -> &ConsensusMessageKind<O> {
        &self.kind
    }
}

/// A checkpoint attestation: "I have locally checkpointed at `seq` with
/// application state hash `digest`".
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct CheckpointMessage {
    seq: SeqNo,
    digest: Digest,
}

impl CheckpointMessage {
    /// Builds a new checkpoint attestation.
    pub fn new(seq: SeqNo, digest: Digest) -> Self {
        Self { seq, digest }
    }

    /// Sequence number of the last executed request before the checkpoint.
    pub fn sequence_number(&self) -> SeqNo {
        self.seq
    }

    /// Hash of the checkpointed application state.
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// A view-change vote, carrying prepared-certificate evidence for requests
/// the voting replica has already prepared under the old view.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct ViewChangeMessage {
    new_view: crate::bft::ordering::View,
    last_stable_checkpoint: SeqNo,
    prepared: Vec<(SeqNo, Digest)>,
}

impl ViewChangeMessage {
    /// Builds a new view-change vote.
    pub fn new(
        new_view: crate::bft::ordering::View,
        last_stable_checkpoint: SeqNo,
        prepared: Vec<(SeqNo, Digest)>,
    ) -> Self {
        Self {
            new_view,
            last_stable_checkpoint,
            prepared,
        }
    }

    /// The view this vote is trying to install.
    pub fn new_view(&self) -> crate::bft::ordering::View {
        self.new_view
    }

    /// The last stable checkpoint this replica is aware of.
    pub fn last_stable_checkpoint(&self) -> SeqNo {
        self.last_stable_checkpoint
    }

    /// Evidence of requests prepared under the old view.
    pub fn prepared(&self) -> &[(SeqNo, Digest)] {
        &self.prepared
    }
}

/// A new-view announcement, carrying the quorum of view-change votes that
/// justify it plus the pre-prepares re-issued under the new view.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct NewViewMessage {
    view: crate::bft::ordering::View,
    votes: Vec<ViewChangeMessage>,
    reissued: Vec<(SeqNo, Digest)>,
}

impl NewViewMessage {
    /// Builds a new new-view announcement.
    pub fn new(
        view: crate::bft::ordering::View,
        votes: Vec<ViewChangeMessage>,
        reissued: Vec<(SeqNo, Digest)>,
    ) -> Self {
        Self {
            view,
            votes,
            reissued,
        }
    }

    /// The view being installed.
    pub fn view(&self) -> crate::bft::ordering::View {
        self.view
    }

    /// The view-change votes justifying this new view.
    pub fn votes(&self) -> &[ViewChangeMessage] {
        &self.votes
    }

    /// The pre-prepares re-issued under the new view, one per sequence in
    /// `(min_stable, max_prepared]` across `votes`: either a sequence's
    /// prepared-proof hash, or a no-op.
    pub fn reissued(&self) -> &[(SeqNo, Digest)] {
        &self.reissued
    }
}

/// Audit observer gossip.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub enum AuditMessage {
    /// A commit attestation for a given sequence number.
    Commit(SeqNo, Digest),
    /// A leader-election attestation for a given view.
    Leader(crate::bft::ordering::View, uuid::Uuid),
}

/// Reply to a status probe.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[derive(Clone)]
pub struct StatusMessage {
    pub view: crate::bft::ordering::View,
    pub next_sequence: SeqNo,
    pub low_water_mark: SeqNo,
    pub is_primary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_serde() {
        let header = Header::new(NodeId::from(0), NodeId::from(3));
        let bytes = bincode::serialize(&header).unwrap();
        let decoded: Header = bincode::deserialize(&bytes).unwrap();
        assert_eq!(header, decoded);
    }
}
