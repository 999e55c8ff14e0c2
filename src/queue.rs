//! Rate-limited remote interaction scheduling.
//!
//! [`CallQueue`] serializes calls per `(peer, thread)` key, coalescing
//! duplicates and enforcing a minimum gap between executions of the same
//! key. [`ThreadPacker`] groups "exchange edges with peer P about thread T"
//! signals into bounded batches.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::thread::ThreadId;

type Call = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;
type Key = (PeerId, ThreadId);

/// What to do when a call arrives while one is already pending for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Keep the pending call, discard the new one (idempotent results).
    Drop,
    /// Replace the pending call with the new one (latest arguments win).
    Replace,
}

#[derive(Default)]
struct Pending {
    order: VecDeque<Key>,
    calls: HashMap<Key, Call>,
    last_run: HashMap<Key, Instant>,
}

/// Per-(peer, thread) serializing call queue.
///
/// Guarantees at most one pending call per key, FIFO fairness across
/// distinct keys, a minimum `gap` between executions of the same key and a
/// polling period of `poll_interval`. Cancelling the token drains the queue
/// without executing anything still pending.
pub struct CallQueue {
    policy: DuplicatePolicy,
    pending: Arc<Mutex<Pending>>,
}

impl std::fmt::Debug for CallQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallQueue")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CallQueue {
    /// Spawns the queue's polling task.
    pub fn new(
        cancel: CancellationToken,
        policy: DuplicatePolicy,
        poll_interval: Duration,
        gap: Duration,
    ) -> Self {
        let pending = Arc::new(Mutex::new(Pending::default()));
        let worker = pending.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                for call in drain_due(&worker, gap) {
                    tokio::spawn(async move {
                        if let Err(err) = call().await {
                            warn!("queued call failed: {err:#}");
                        }
                    });
                }
            }
            debug!("call queue drained");
        });
        CallQueue { policy, pending }
    }

    /// Enqueues `call` for the key; returns false when an already pending
    /// call absorbed it (per the queue's [`DuplicatePolicy`]).
    pub fn call<F, Fut>(&self, peer: PeerId, thread: ThreadId, call: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let key = (peer, thread);
        let call: Call = Box::new(move || call().boxed());
        let mut pending = self.pending.lock();
        if pending.calls.contains_key(&key) {
            match self.policy {
                DuplicatePolicy::Drop => return false,
                DuplicatePolicy::Replace => {
                    pending.calls.insert(key, call);
                    return false;
                }
            }
        }
        pending.order.push_back(key);
        pending.calls.insert(key, call);
        true
    }
}

/// Pops every call whose key has been idle for at least `gap`, preserving
/// FIFO order for the rest.
fn drain_due(pending: &Mutex<Pending>, gap: Duration) -> Vec<Call> {
    let now = Instant::now();
    let mut pending = pending.lock();
    let mut due = Vec::new();
    let mut keep = VecDeque::new();
    while let Some(key) = pending.order.pop_front() {
        let ready = pending
            .last_run
            .get(&key)
            .map_or(true, |last| now.duration_since(*last) >= gap);
        if ready {
            if let Some(call) = pending.calls.remove(&key) {
                pending.last_run.insert(key, now);
                due.push(call);
            }
        } else {
            keep.push_back(key);
        }
    }
    pending.order = keep;
    due
}

/// One batched edge-exchange assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPack {
    /// Peer to exchange with.
    pub peer: PeerId,
    /// Threads to include, at most the packer's bound.
    pub threads: Vec<ThreadId>,
}

/// Coalesces `(peer, thread)` signals into bounded [`ThreadPack`]s.
///
/// Signals buffer per peer for up to the compression timeout and flush
/// early when the bound is hit. Cancelling the token closes the output
/// channel.
#[derive(Debug, Clone)]
pub struct ThreadPacker {
    add_tx: mpsc::UnboundedSender<(PeerId, ThreadId)>,
}

impl ThreadPacker {
    /// Spawns the packing task and returns the handle plus the pack stream.
    pub fn new(
        cancel: CancellationToken,
        max_threads: usize,
        timeout: Duration,
    ) -> (Self, flume::Receiver<ThreadPack>) {
        let (add_tx, mut add_rx) = mpsc::unbounded_channel::<(PeerId, ThreadId)>();
        let (out_tx, out_rx) = flume::unbounded();
        tokio::spawn(async move {
            let mut buffers: HashMap<PeerId, (Vec<ThreadId>, Instant)> = HashMap::new();
            loop {
                let deadline = buffers
                    .values()
                    .map(|(_, d)| *d)
                    .min()
                    .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = add_rx.recv() => {
                        let Some((peer, thread)) = item else { break };
                        let (threads, _) = buffers
                            .entry(peer)
                            .or_insert_with(|| (Vec::new(), Instant::now() + timeout));
                        if !threads.contains(&thread) {
                            threads.push(thread);
                        }
                        if threads.len() >= max_threads {
                            if let Some((threads, _)) = buffers.remove(&peer) {
                                if out_tx.send_async(ThreadPack { peer, threads }).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    _ = tokio::time::sleep_until(deadline), if !buffers.is_empty() => {
                        let now = Instant::now();
                        let expired: Vec<_> = buffers
                            .iter()
                            .filter(|(_, (_, d))| *d <= now)
                            .map(|(p, _)| *p)
                            .collect();
                        for peer in expired {
                            if let Some((threads, _)) = buffers.remove(&peer) {
                                if out_tx.send_async(ThreadPack { peer, threads }).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
            // dropping out_tx closes the pack stream
        });
        (ThreadPacker { add_tx }, out_rx)
    }

    /// Signals that `thread` should be exchanged with `peer`.
    pub fn add(&self, peer: PeerId, thread: ThreadId) {
        let _ = self.add_tx.send((peer, thread));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    #[tokio::test]
    async fn duplicate_drop_and_replace() {
        let cancel = CancellationToken::new();
        let drop_q = CallQueue::new(
            cancel.clone(),
            DuplicatePolicy::Drop,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );
        let replace_q = CallQueue::new(
            cancel.clone(),
            DuplicatePolicy::Replace,
            Duration::from_millis(10),
            Duration::from_millis(10),
        );

        let (p, t) = (peer(), ThreadId::new_random());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        for q in [&drop_q, &replace_q] {
            let f = first.clone();
            assert!(q.call(p, t, move || async move {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
            let s = second.clone();
            assert!(!q.call(p, t, move || async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        // drop queue kept the first call, replace queue the second
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn same_key_respects_gap() {
        let cancel = CancellationToken::new();
        let q = CallQueue::new(
            cancel.clone(),
            DuplicatePolicy::Drop,
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        let (p, t) = (peer(), ThreadId::new_random());
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        q.call(p, t, move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        q.call(p, t, move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1, "gap not yet elapsed");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancellation_drains_without_executing() {
        let cancel = CancellationToken::new();
        let q = CallQueue::new(
            cancel.clone(),
            DuplicatePolicy::Drop,
            Duration::from_millis(50),
            Duration::ZERO,
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        q.call(peer(), ThreadId::new_random(), move || async move {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn packer_flushes_on_bound() {
        let cancel = CancellationToken::new();
        let (packer, rx) = ThreadPacker::new(cancel.clone(), 3, Duration::from_secs(10));
        let p = peer();
        for _ in 0..2 {
            // duplicates are coalesced
            let t = ThreadId::new_random();
            packer.add(p, t);
            packer.add(p, t);
        }
        let t3 = ThreadId::new_random();
        packer.add(p, t3);

        let pack = rx.recv_async().await.unwrap();
        assert_eq!(pack.peer, p);
        assert_eq!(pack.threads.len(), 3);
        cancel.cancel();
    }

    #[tokio::test]
    async fn packer_flushes_on_deadline_and_closes() {
        let cancel = CancellationToken::new();
        let (packer, rx) = ThreadPacker::new(cancel.clone(), 10, Duration::from_millis(50));
        let p = peer();
        packer.add(p, ThreadId::new_random());

        let pack = rx.recv_async().await.unwrap();
        assert_eq!(pack.threads.len(), 1);

        cancel.cancel();
        assert!(rx.recv_async().await.is_err(), "output closes on cancel");
    }
}
