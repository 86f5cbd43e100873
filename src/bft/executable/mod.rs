//! The service state machine: applies committed operations in sequence
//! order, off the async runtime's event loop.

use std::sync::mpsc;
use std::thread;

use tokio::sync::mpsc as tokio_mpsc;

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::Digest;
use crate::bft::error::*;
use crate::bft::ordering::SeqNo;

/// A user-defined replicated service.
///
/// Application logic lives behind this trait; the replica engine only ever
/// calls it with committed operations, strictly in ascending sequence order.
pub trait Service: Send {
    /// The operation type replicated by consensus.
    type Operation: Send + 'static;
    /// The reply produced by executing an operation.
    type Reply: Send + 'static;

    /// Applies `operation`, committed at `seq`, producing a reply.
    fn execute(&mut self, seq: SeqNo, operation: Self::Operation) -> Self::Reply;

    /// Hashes the service's state as of having executed up to and
    /// including `seq`.
    fn state_hash(&self, seq: SeqNo) -> Digest;

    /// Installs a service state snapshot received via state transfer,
    /// superseding everything executed before `seq`.
    fn set_service_state(&mut self, seq: SeqNo, bytes: Vec<u8>) -> Result<()>;

    /// Serializes the service state as of `seq`, to answer a peer's
    /// state-transfer request.
    fn service_state(&self, seq: SeqNo) -> Vec<u8>;

    /// Tells the service it may consolidate (e.g. compact) its own log up
    /// to and including `seq`, called once the matching checkpoint
    /// stabilizes.
    fn consolidate(&mut self, seq: SeqNo);
}

/// One item of completed work handed back from the executor thread.
pub enum Executed<P> {
    /// `(to, request_hash, seq, reply)` -- the reply to a single executed
    /// operation, addressed to whichever replica is holding the client
    /// session.
    Reply(NodeId, Digest, SeqNo, P),
    /// The service's state hash as of `seq`, requested for a local
    /// checkpoint.
    StateHash(SeqNo, Digest),
    /// A serialized service state snapshot, requested by `to` for
    /// state-transfer.
    ServiceState(NodeId, SeqNo, Vec<u8>),
}

enum ExecutionRequest<O> {
    Execute(NodeId, Digest, SeqNo, O),
    StateHash(SeqNo),
    SetServiceState(SeqNo, Vec<u8>),
    ServiceState(NodeId, SeqNo),
    Consolidate(SeqNo),
}

/// A handle to the background service executor thread.
pub struct ExecutorHandle<S: Service> {
    e_tx: mpsc::Sender<ExecutionRequest<S::Operation>>,
}

impl<S: Service> Clone for ExecutorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            e_tx: self.e_tx.clone(),
        }
    }
}

impl<S: Service> ExecutorHandle<S> {
    /// Queues `operation`, committed at `seq`, for execution. `to` is the
    /// session this operation's reply should be routed back to.
    pub fn queue_execute(&self, to: NodeId, hash: Digest, seq: SeqNo, operation: S::Operation) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::Execute(to, hash, seq, operation))
            .simple(ErrorKind::Executable)
    }

    /// Requests the service's state hash as of `seq`, for a local
    /// checkpoint.
    pub fn queue_state_hash(&self, seq: SeqNo) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::StateHash(seq))
            .simple(ErrorKind::Executable)
    }

    /// Installs a service state snapshot from state transfer.
    pub fn queue_set_service_state(&self, seq: SeqNo, bytes: Vec<u8>) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::SetServiceState(seq, bytes))
            .simple(ErrorKind::Executable)
    }

    /// Requests a serialized service state snapshot as of `seq`, to answer
    /// `to`'s state-transfer request.
    pub fn queue_service_state(&self, to: NodeId, seq: SeqNo) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::ServiceState(to, seq))
            .simple(ErrorKind::Executable)
    }

    /// Tells the service to consolidate its log up to `seq`.
    pub fn queue_consolidate(&self, seq: SeqNo) -> Result<()> {
        self.e_tx
            .send(ExecutionRequest::Consolidate(seq))
            .simple(ErrorKind::Executable)
    }
}

/// Spawns `service` onto a dedicated executor thread, so that potentially
/// slow application logic never blocks the async runtime's event loop.
///
/// Returns a handle to queue work, plus the receiving end of the channel
/// completed work is reported back on.
pub fn spawn<S>(mut service: S) -> (ExecutorHandle<S>, tokio_mpsc::UnboundedReceiver<Executed<S::Reply>>)
where
    S: Service + 'static,
{
    let (e_tx, e_rx) = mpsc::channel::<ExecutionRequest<S::Operation>>();
    let (done_tx, done_rx) = tokio_mpsc::unbounded_channel();

    thread::spawn(move || {
        while let Ok(req) = e_rx.recv() {
            match req {
                ExecutionRequest::Execute(to, hash, seq, operation) => {
                    let reply = service.execute(seq, operation);
                    let _ = done_tx.send(Executed::Reply(to, hash, seq, reply));
                }
                ExecutionRequest::StateHash(seq) => {
                    let hash = service.state_hash(seq);
                    let _ = done_tx.send(Executed::StateHash(seq, hash));
                }
                ExecutionRequest::SetServiceState(seq, bytes) => {
                    if let Err(e) = service.set_service_state(seq, bytes) {
                        tracing::warn!(?e, ?seq, "failed to install service state snapshot");
                    }
                }
                ExecutionRequest::ServiceState(to, seq) => {
                    let bytes = service.service_state(seq);
                    let _ = done_tx.send(Executed::ServiceState(to, seq, bytes));
                }
                ExecutionRequest::Consolidate(seq) => {
                    service.consolidate(seq);
                }
            }
        }
    });

    (ExecutorHandle { e_tx }, done_rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u64);

    impl Service for Counter {
        type Operation = u64;
        type Reply = u64;

        fn execute(&mut self, _seq: SeqNo, operation: u64) -> u64 {
            self.0 += operation;
            self.0
        }

        fn state_hash(&self, _seq: SeqNo) -> Digest {
            Digest::from_data(&self.0.to_le_bytes())
        }

        fn set_service_state(&mut self, _seq: SeqNo, bytes: Vec<u8>) -> Result<()> {
            self.0 = u64::from_le_bytes(bytes.try_into().simple(ErrorKind::Executable)?);
            Ok(())
        }

        fn service_state(&self, _seq: SeqNo) -> Vec<u8> {
            self.0.to_le_bytes().to_vec()
        }

        fn consolidate(&mut self, _seq: SeqNo) {}
    }

    #[test]
    fn executes_in_background_and_reports_reply() {
        let (handle, mut done_rx) = spawn(Counter(0));
        handle
            .queue_execute(NodeId::from(0), Digest::initial(), SeqNo::from(1), 7)
            .unwrap();

        let executed = done_rx.blocking_recv().unwrap();
        match executed {
            Executed::Reply(to, _, seq, reply) => {
                assert_eq!(to, NodeId::from(0));
                assert_eq!(seq, SeqNo::from(1));
                assert_eq!(reply, 7);
            }
            _ => panic!("expected a Reply"),
        }
    }
}
