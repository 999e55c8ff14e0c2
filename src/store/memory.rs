//! In-memory logstore.

use std::collections::HashMap;

use bytes::Bytes;
use cid::Cid;
use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::keys::{SymmetricKey, ThreadKey};
use crate::store::Logstore;
use crate::thread::{LogInfo, ThreadId, ThreadInfo};

#[derive(Debug)]
struct ThreadRow {
    key: ThreadKey,
    logs: HashMap<PeerId, LogInfo>,
    bytes: HashMap<String, Bytes>,
}

/// A [`Logstore`] backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemLogstore {
    threads: RwLock<HashMap<ThreadId, ThreadRow>>,
}

impl MemLogstore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_thread<T>(
        &self,
        id: &ThreadId,
        f: impl FnOnce(&ThreadRow) -> Result<T>,
    ) -> Result<T> {
        let threads = self.threads.read();
        let row = threads.get(id).ok_or(Error::ThreadNotFound)?;
        f(row)
    }

    fn with_thread_mut<T>(
        &self,
        id: &ThreadId,
        f: impl FnOnce(&mut ThreadRow) -> Result<T>,
    ) -> Result<T> {
        let mut threads = self.threads.write();
        let row = threads.get_mut(id).ok_or(Error::ThreadNotFound)?;
        f(row)
    }
}

impl Logstore for MemLogstore {
    fn add_thread(&self, info: ThreadInfo) -> Result<()> {
        let mut threads = self.threads.write();
        match threads.get_mut(&info.id) {
            Some(row) => {
                // an existing service-only entry may learn the read half
                if !row.key.can_read() && info.key.can_read() {
                    row.key = ThreadKey::new(row.key.service().clone(), info.key.read().cloned());
                }
                Ok(())
            }
            None => {
                threads.insert(
                    info.id,
                    ThreadRow {
                        key: info.key,
                        logs: info.logs.into_iter().map(|l| (l.id, l)).collect(),
                        bytes: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn get_thread(&self, id: &ThreadId) -> Result<ThreadInfo> {
        self.with_thread(id, |row| {
            Ok(ThreadInfo {
                id: *id,
                key: row.key.clone(),
                logs: row.logs.values().cloned().collect(),
                addrs: Vec::new(),
            })
        })
    }

    fn delete_thread(&self, id: &ThreadId) -> Result<()> {
        self.threads.write().remove(id);
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.threads.read().keys().copied().collect())
    }

    fn add_log(&self, id: &ThreadId, log: LogInfo) -> Result<()> {
        self.with_thread_mut(id, |row| {
            if row.logs.contains_key(&log.id) {
                return Err(Error::LogExists);
            }
            row.logs.insert(log.id, log);
            Ok(())
        })
    }

    fn get_log(&self, id: &ThreadId, log: &PeerId) -> Result<LogInfo> {
        self.with_thread(id, |row| {
            row.logs.get(log).cloned().ok_or(Error::LogNotFound)
        })
    }

    fn get_managed_logs(&self, id: &ThreadId) -> Result<Vec<LogInfo>> {
        self.with_thread(id, |row| {
            Ok(row.logs.values().filter(|l| l.managed()).cloned().collect())
        })
    }

    fn heads(&self, id: &ThreadId, log: &PeerId) -> Result<Option<Cid>> {
        self.with_thread(id, |row| {
            Ok(row.logs.get(log).and_then(|l| l.head))
        })
    }

    fn set_head(&self, id: &ThreadId, log: &PeerId, head: Cid) -> Result<()> {
        self.with_thread_mut(id, |row| {
            let log = row.logs.get_mut(log).ok_or(Error::LogNotFound)?;
            log.head = Some(head);
            Ok(())
        })
    }

    fn add_addr(&self, id: &ThreadId, log: &PeerId, addr: Multiaddr) -> Result<()> {
        self.add_addrs(id, log, vec![addr])
    }

    fn add_addrs(&self, id: &ThreadId, log: &PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        self.with_thread_mut(id, |row| {
            let log = row.logs.get_mut(log).ok_or(Error::LogNotFound)?;
            for addr in addrs {
                if !log.addrs.contains(&addr) {
                    log.addrs.push(addr);
                }
            }
            Ok(())
        })
    }

    fn set_addrs(&self, id: &ThreadId, log: &PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        self.with_thread_mut(id, |row| {
            let log = row.logs.get_mut(log).ok_or(Error::LogNotFound)?;
            log.addrs = addrs;
            Ok(())
        })
    }

    fn service_key(&self, id: &ThreadId) -> Result<SymmetricKey> {
        self.with_thread(id, |row| Ok(row.key.service().clone()))
    }

    fn read_key(&self, id: &ThreadId) -> Result<Option<SymmetricKey>> {
        self.with_thread(id, |row| Ok(row.key.read().cloned()))
    }

    fn pub_key(&self, id: &ThreadId, log: &PeerId) -> Result<PublicKey> {
        self.with_thread(id, |row| {
            row.logs
                .get(log)
                .map(|l| l.pub_key.clone())
                .ok_or(Error::LogNotFound)
        })
    }

    fn put_bytes(&self, id: &ThreadId, name: &str, data: Bytes) -> Result<()> {
        self.with_thread_mut(id, |row| {
            row.bytes.insert(name.to_string(), data);
            Ok(())
        })
    }

    fn get_bytes(&self, id: &ThreadId, name: &str) -> Result<Option<Bytes>> {
        self.with_thread(id, |row| Ok(row.bytes.get(name).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn thread() -> ThreadInfo {
        ThreadInfo::new(ThreadId::new_random(), ThreadKey::new_random())
    }

    #[test]
    fn thread_crud() {
        let store = MemLogstore::new();
        let info = thread();
        let id = info.id;

        assert!(matches!(
            store.get_thread(&id),
            Err(Error::ThreadNotFound)
        ));
        store.add_thread(info).unwrap();
        assert_eq!(store.get_thread(&id).unwrap().id, id);
        assert_eq!(store.threads().unwrap(), vec![id]);

        store.delete_thread(&id).unwrap();
        assert!(store.get_thread(&id).is_err());
    }

    #[test]
    fn key_upgrade_on_re_add() {
        let store = MemLogstore::new();
        let id = ThreadId::new_random();
        let service_only = ThreadKey::new_service_only();
        store
            .add_thread(ThreadInfo::new(id, service_only.clone()))
            .unwrap();
        assert!(store.read_key(&id).unwrap().is_none());

        // re-adding with a full key fills in the read half but keeps the service half
        let full = ThreadKey::new(service_only.service().clone(), ThreadKey::new_random().read().cloned());
        store.add_thread(ThreadInfo::new(id, full.clone())).unwrap();
        assert_eq!(store.read_key(&id).unwrap(), full.read().cloned());
        assert_eq!(&store.service_key(&id).unwrap(), service_only.service());
    }

    #[test]
    fn logs_heads_addrs() {
        let store = MemLogstore::new();
        let info = thread();
        let id = info.id;
        store.add_thread(info).unwrap();

        let log = LogInfo::from_keypair(Keypair::generate_ed25519());
        let lid = log.id;
        store.add_log(&id, log.clone()).unwrap();
        assert!(matches!(
            store.add_log(&id, log),
            Err(Error::LogExists)
        ));

        assert_eq!(store.heads(&id, &lid).unwrap(), None);
        let head = crate::blockstore::Block::new(&b"r1"[..]).cid();
        store.set_head(&id, &lid, head).unwrap();
        assert_eq!(store.heads(&id, &lid).unwrap(), Some(head));

        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4006".parse().unwrap();
        store.add_addr(&id, &lid, addr.clone()).unwrap();
        store.add_addr(&id, &lid, addr.clone()).unwrap();
        assert_eq!(store.get_log(&id, &lid).unwrap().addrs, vec![addr]);

        assert_eq!(store.get_managed_logs(&id).unwrap().len(), 1);
    }

    #[test]
    fn indexed_bytes() {
        let store = MemLogstore::new();
        let info = thread();
        let id = info.id;
        store.add_thread(info).unwrap();

        assert_eq!(store.get_bytes(&id, "owner").unwrap(), None);
        store
            .put_bytes(&id, "owner", Bytes::from_static(b"lid"))
            .unwrap();
        assert_eq!(
            store.get_bytes(&id, "owner").unwrap(),
            Some(Bytes::from_static(b"lid"))
        );
    }
}
