//! In-process fan-out of freshly processed records.

use std::time::Duration;

use libp2p::PeerId;
use parking_lot::RwLock;

use crate::codec::Record;
use crate::error::{Error, Result};
use crate::thread::ThreadId;

/// A record together with the thread and log it belongs to.
///
/// This is the unit delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    /// The record itself.
    pub record: Record,
    /// Thread the record belongs to.
    pub thread_id: ThreadId,
    /// Authoring log.
    pub log_id: PeerId,
}

/// Multi-producer multi-consumer broadcast with bounded listener buffers.
///
/// Publication happens inside the per-thread semaphore, so listeners see
/// records of one log in chain order. A listener that does not drain its
/// buffer within the notify timeout fails the publishing batch.
#[derive(Debug)]
pub(crate) struct Broadcaster {
    listeners: RwLock<Vec<flume::Sender<ThreadRecord>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Broadcaster {
            listeners: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Registers a new listener.
    pub fn listen(&self) -> flume::Receiver<ThreadRecord> {
        let (tx, rx) = flume::bounded(self.capacity);
        self.listeners.write().push(tx);
        rx
    }

    /// Delivers `rec` to every listener, waiting up to `timeout` per
    /// listener buffer. Dropped listeners are pruned.
    pub async fn send_with_timeout(&self, rec: ThreadRecord, timeout: Duration) -> Result<()> {
        let senders: Vec<_> = self.listeners.read().iter().cloned().collect();
        let mut stale = false;
        for tx in &senders {
            if tx.is_disconnected() {
                stale = true;
                continue;
            }
            match tokio::time::timeout(timeout, tx.send_async(rec.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => stale = true,
                Err(_) => return Err(Error::NotifyTimeout),
            }
        }
        if stale {
            self.listeners.write().retain(|tx| !tx.is_disconnected());
        }
        Ok(())
    }

    /// Drops all listeners; their channels report disconnection.
    pub fn discard(&self) {
        self.listeners.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Event, Record};
    use crate::keys::SymmetricKey;
    use libp2p::identity::Keypair;

    fn record() -> ThreadRecord {
        let service = SymmetricKey::new_random();
        let read = SymmetricKey::new_random();
        let key = Keypair::generate_ed25519();
        let event = Event::create(b"data", &read, &service).unwrap();
        ThreadRecord {
            record: Record::create(event, None, &key, &service).unwrap(),
            thread_id: ThreadId::new_random(),
            log_id: key.public().to_peer_id(),
        }
    }

    #[tokio::test]
    async fn delivers_to_all_listeners() {
        let bus = Broadcaster::new(1);
        let rx1 = bus.listen();
        let rx2 = bus.listen();

        let rec = record();
        bus.send_with_timeout(rec.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(rx1.recv_async().await.unwrap().record.cid(), rec.record.cid());
        assert_eq!(rx2.recv_async().await.unwrap().record.cid(), rec.record.cid());
    }

    #[tokio::test]
    async fn stalled_listener_times_out() {
        let bus = Broadcaster::new(1);
        let _rx = bus.listen();

        // first send fills the single-slot buffer, second must time out
        bus.send_with_timeout(record(), Duration::from_millis(50))
            .await
            .unwrap();
        let err = bus
            .send_with_timeout(record(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotifyTimeout));
    }

    #[tokio::test]
    async fn dropped_listeners_are_pruned() {
        let bus = Broadcaster::new(1);
        let rx = bus.listen();
        drop(rx);
        bus.send_with_timeout(record(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(bus.listeners.read().is_empty());
    }
}
