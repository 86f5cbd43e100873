//! Detects a stalled primary by watching whether outstanding requests are
//! executed before a timeout elapses.
//!
//! Grounded directly on `original_source/pbft/pbft_failure_detector.cpp`:
//! requests are tracked in the order they were first seen, and a single
//! timer watches the oldest unexecuted one. If it fires, the oldest
//! outstanding request is dropped and, if others remain, a shorter
//! "cascade" timer (`fd_fail_timeout`) is armed immediately, so a second
//! stalled request is reported quickly rather than waiting out the full
//! primary timeout again.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::bft::crypto::hash::Digest;

struct Inner {
    ordered_requests: VecDeque<Digest>,
    outstanding_requests: HashSet<Digest>,
    completed_requests: HashSet<Digest>,
    completed_queue: VecDeque<Digest>,
}

/// Watches outstanding client requests and reports a suspected primary
/// failure through an unbounded channel.
pub struct FailureDetector {
    inner: Arc<Mutex<Inner>>,
    fd_oper_timeout: Duration,
    fd_fail_timeout: Duration,
    max_completed_requests_memory: usize,
    generation: Arc<AtomicU64>,
    failure_tx: mpsc::UnboundedSender<()>,
}

impl FailureDetector {
    /// Builds a new failure detector, returning it alongside the receiving
    /// half of its failure notification channel.
    pub fn new(
        fd_oper_timeout: Duration,
        fd_fail_timeout: Duration,
        max_completed_requests_memory: usize,
    ) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let detector = Self {
            inner: Arc::new(Mutex::new(Inner {
                ordered_requests: VecDeque::new(),
                outstanding_requests: HashSet::new(),
                completed_requests: HashSet::new(),
                completed_queue: VecDeque::new(),
            })),
            fd_oper_timeout,
            fd_fail_timeout,
            max_completed_requests_memory,
            generation: Arc::new(AtomicU64::new(0)),
            failure_tx,
        };
        (detector, failure_rx)
    }

    /// Records that a new client request has entered the system.
    pub fn request_seen(&self, hash: Digest) {
        let mut inner = self.inner.lock();
        if !inner.outstanding_requests.contains(&hash) && !inner.completed_requests.contains(&hash)
        {
            tracing::debug!(?hash, "failure detector recording new request");
            inner.ordered_requests.push_back(hash);
            inner.outstanding_requests.insert(hash);
            if inner.ordered_requests.len() == 1 {
                drop(inner);
                self.start_timer(self.fd_oper_timeout);
            }
        }
    }

    /// Records that a request has been executed.
    pub fn request_executed(&self, hash: Digest) {
        let mut inner = self.inner.lock();
        inner.outstanding_requests.remove(&hash);
        Self::add_completed(&mut inner, hash, self.max_completed_requests_memory);
    }

    fn add_completed(inner: &mut Inner, hash: Digest, max: usize) {
        inner.completed_requests.insert(hash);
        inner.completed_queue.push_back(hash);
        if inner.completed_requests.len() > max {
            if let Some(oldest) = inner.completed_queue.pop_front() {
                inner.completed_requests.remove(&oldest);
            }
        }
    }

    fn start_timer(&self, after: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let my_generation = self.generation.clone();
        let fd_fail_timeout = self.fd_fail_timeout;
        let failure_tx = self.failure_tx.clone();
        crate::bft::async_runtime::spawn(async move {
            tokio::time::sleep(after).await;
            if my_generation.load(Ordering::SeqCst) != generation {
                // timer was superseded by a newer one; this firing is stale
                return;
            }
            Self::handle_timeout(inner, my_generation, generation, fd_fail_timeout, failure_tx);
        });
    }

    fn handle_timeout(
        inner: Arc<Mutex<Inner>>,
        generation_cell: Arc<AtomicU64>,
        my_generation: u64,
        fd_fail_timeout: Duration,
        failure_tx: mpsc::UnboundedSender<()>,
    ) {
        let mut guard = inner.lock();
        let front = match guard.ordered_requests.front().copied() {
            Some(front) => front,
            None => return,
        };

        if !guard.completed_requests.contains(&front) {
            tracing::error!(?front, "failure detector detected unexecuted request");
            guard.ordered_requests.pop_front();
            let has_more = !guard.ordered_requests.is_empty();
            drop(guard);

            let _ = failure_tx.send(());

            if has_more {
                tracing::debug!("handle_failure starting secondary failure timer");
                let next_generation = generation_cell.fetch_add(1, Ordering::SeqCst) + 1;
                let inner = inner.clone();
                let generation_cell2 = generation_cell.clone();
                let failure_tx = failure_tx.clone();
                crate::bft::async_runtime::spawn(async move {
                    tokio::time::sleep(fd_fail_timeout).await;
                    if generation_cell2.load(Ordering::SeqCst) != next_generation {
                        return;
                    }
                    Self::handle_timeout(
                        inner,
                        generation_cell2,
                        next_generation,
                        fd_fail_timeout,
                        failure_tx,
                    );
                });
            }
            return;
        }

        while let Some(front) = guard.ordered_requests.front().copied() {
            if guard.completed_requests.contains(&front) {
                guard.ordered_requests.pop_front();
            } else {
                break;
            }
        }

        if !guard.ordered_requests.is_empty() {
            tracing::debug!("handle_timeout starting timer");
            let _ = my_generation; // silence unused warning on some paths
            drop(guard);
            let next_generation = generation_cell.fetch_add(1, Ordering::SeqCst) + 1;
            let inner2 = inner.clone();
            let generation_cell2 = generation_cell.clone();
            let failure_tx2 = failure_tx.clone();
            crate::bft::async_runtime::spawn(async move {
                tokio::time::sleep(fd_fail_timeout).await;
                if generation_cell2.load(Ordering::SeqCst) != next_generation {
                    return;
                }
                Self::handle_timeout(
                    inner2,
                    generation_cell2,
                    next_generation,
                    fd_fail_timeout,
                    failure_tx2,
                );
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unexecuted_request_triggers_failure() {
        let (fd, mut rx) = FailureDetector::new(
            Duration::from_millis(20),
            Duration::from_millis(20),
            10,
        );
        fd.request_seen(Digest::from_data(b"req-1"));
        rx.recv().await.expect("expected a failure notification");
    }

    #[tokio::test]
    async fn executed_request_does_not_trigger_failure() {
        let (fd, mut rx) = FailureDetector::new(
            Duration::from_millis(20),
            Duration::from_millis(20),
            10,
        );
        let hash = Digest::from_data(b"req-1");
        fd.request_seen(hash);
        fd.request_executed(hash);
        let outcome = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(outcome.is_err(), "no failure should have been reported");
    }

    #[tokio::test]
    async fn completed_set_is_fifo_bounded() {
        let (fd, _rx) = FailureDetector::new(Duration::from_secs(5), Duration::from_secs(1), 2);
        for i in 0..5u8 {
            let hash = Digest::from_data(&[i]);
            fd.request_seen(hash);
            fd.request_executed(hash);
        }
        let inner = fd.inner.lock();
        assert_eq!(inner.completed_requests.len(), 2);
    }
}
