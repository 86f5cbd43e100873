//! An in-memory `Transport`, wiring every replica's outbox directly to its
//! peers' inboxes. This is the test double the rest of the core is
//! exercised against; it is also what `sug0-bafomet`'s own test suite
//! would reach for (its `Node<O>` is the real thing, but nothing in the
//! retrieved pack stood in for it in tests).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bft::communication::message::Envelope;
use crate::bft::communication::{NodeId, Transport};

/// A single replica's end of the loopback network: its `Transport` handle,
/// plus the receiving half it should poll for inbound envelopes.
///
/// Unlike an earlier version of this transport, envelopes are forwarded
/// whole rather than unwrapped at the send site: a receiving replica needs
/// the signature and digest fields to verify what it's about to act on.
pub struct LoopbackTransport<O> {
    id: NodeId,
    peers: Arc<HashMap<NodeId, mpsc::UnboundedSender<Envelope<O>>>>,
}

impl<O> Clone for LoopbackTransport<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            peers: Arc::clone(&self.peers),
        }
    }
}

impl<O: Send + 'static> Transport<O> for LoopbackTransport<O> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: NodeId, envelope: Envelope<O>) {
        if let Some(tx) = self.peers.get(&to) {
            // best-effort: a dropped receiver just means the peer "crashed"
            let _ = tx.send(envelope);
        }
    }
}

/// Builds a fully-connected in-memory network for the given replica ids,
/// returning each replica's `Transport` handle alongside the receiving end
/// of its inbound channel.
pub fn loopback_network<O: Send + 'static>(
    ids: &[NodeId],
) -> HashMap<NodeId, (LoopbackTransport<O>, mpsc::UnboundedReceiver<Envelope<O>>)> {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for &id in ids {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.insert(id, tx);
        receivers.insert(id, rx);
    }
    let senders = Arc::new(senders);

    ids.iter()
        .map(|&id| {
            let transport = LoopbackTransport {
                id,
                peers: Arc::clone(&senders),
            };
            let rx = receivers.remove(&id).unwrap();
            (id, (transport, rx))
        })
        .collect()
}
