//! Communication primitives: node identities and the `Transport`
//! abstraction the replication core sends and receives signed envelopes
//! through.
//!
//! The spec treats transport as an external collaborator ("delivers/
//! accepts signed envelopes to/from peers and clients") rather than part
//! of the core; this module defines only the interface the core needs,
//! plus two implementations: an in-memory loopback network (the test
//! double every other core module is exercised against) and a minimal
//! tokio TCP transport for running a real swarm.

pub mod message;
pub mod net;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use message::Envelope;

/// A `NodeId` represents the id of a process in the BFT system.
///
/// Unlike a peer's stable `uuid` (tracked by [`crate::bft::config_store`]),
/// a `NodeId` is a per-configuration ordinal: replicas are numbered
/// `0..n` by their uuid-sorted position in the *current* configuration,
/// which is what view-based primary election (`view mod n`) indexes into.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub fn targets<I>(into_iterator: I) -> impl Iterator<Item = Self>
    where
        I: IntoIterator<Item = u32>,
    {
        into_iterator.into_iter().map(Self)
    }
}

impl From<u32> for NodeId {
    #[inline]
    fn from(id: u32) -> NodeId {
        NodeId(id)
    }
}

impl From<NodeId> for usize {
    #[inline]
    fn from(id: NodeId) -> usize {
        id.0 as usize
    }
}

impl From<NodeId> for u32 {
    #[inline]
    fn from(id: NodeId) -> u32 {
        id.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Delivers and accepts signed envelopes to and from peers.
///
/// Implementations never block the caller: `send`/`broadcast` post the
/// actual I/O as a task on the async runtime and return immediately,
/// matching the spec's "handlers never await mid-update" rule.
pub trait Transport<O>: Send + Sync {
    /// This transport's own id.
    fn id(&self) -> NodeId;

    /// Sends `envelope` to a single peer.
    fn send(&self, to: NodeId, envelope: Envelope<O>);

    /// Sends `envelope` to every id yielded by `targets`.
    fn broadcast(&self, targets: Box<dyn Iterator<Item = NodeId> + Send>, envelope: Envelope<O>)
    where
        O: Clone,
    {
        for to in targets {
            self.send(to, envelope.clone());
        }
    }
}
