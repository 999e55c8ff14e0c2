//! Durable thread metadata: keys, logs, heads and addresses.

use bytes::Bytes;
use cid::Cid;
use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};

use crate::error::Result;
use crate::keys::SymmetricKey;
use crate::thread::{LogInfo, ThreadId, ThreadInfo};

pub mod memory;

/// Durable mapping from thread to metadata and from thread to its logs.
///
/// All methods are safe for concurrent callers on distinct thread ids;
/// within one thread, coherence is provided by the engine's per-thread
/// semaphore, not by the store.
pub trait Logstore: Send + Sync + 'static {
    /// Adds a thread, or upgrades the stored key when the thread exists and
    /// the incoming key carries a read half the stored one lacks.
    fn add_thread(&self, info: ThreadInfo) -> Result<()>;
    /// Returns a thread with all of its logs.
    fn get_thread(&self, id: &ThreadId) -> Result<ThreadInfo>;
    /// Deletes the thread and everything stored under it.
    fn delete_thread(&self, id: &ThreadId) -> Result<()>;
    /// All thread ids.
    fn threads(&self) -> Result<Vec<ThreadId>>;

    /// Adds a new log under the thread.
    fn add_log(&self, id: &ThreadId, log: LogInfo) -> Result<()>;
    /// Returns one log.
    fn get_log(&self, id: &ThreadId, log: &PeerId) -> Result<LogInfo>;
    /// All logs the local peer holds a private key for.
    fn get_managed_logs(&self, id: &ThreadId) -> Result<Vec<LogInfo>>;

    /// Current head of a log, `None` when the log is empty.
    fn heads(&self, id: &ThreadId, log: &PeerId) -> Result<Option<Cid>>;
    /// Advances the head of a log.
    fn set_head(&self, id: &ThreadId, log: &PeerId, head: Cid) -> Result<()>;

    /// Appends one address to a log, ignoring duplicates.
    fn add_addr(&self, id: &ThreadId, log: &PeerId, addr: Multiaddr) -> Result<()>;
    /// Appends addresses to a log, ignoring duplicates.
    fn add_addrs(&self, id: &ThreadId, log: &PeerId, addrs: Vec<Multiaddr>) -> Result<()>;
    /// Replaces the address list of a log.
    fn set_addrs(&self, id: &ThreadId, log: &PeerId, addrs: Vec<Multiaddr>) -> Result<()>;

    /// The thread's service-key.
    fn service_key(&self, id: &ThreadId) -> Result<SymmetricKey>;
    /// The thread's read-key, if the local peer holds one.
    fn read_key(&self, id: &ThreadId) -> Result<Option<SymmetricKey>>;
    /// Public key of a log.
    fn pub_key(&self, id: &ThreadId, log: &PeerId) -> Result<PublicKey>;

    /// Stores arbitrary indexed bytes under a name scoped to the thread.
    fn put_bytes(&self, id: &ThreadId, name: &str, data: Bytes) -> Result<()>;
    /// Loads indexed bytes, `None` when the name is unset.
    fn get_bytes(&self, id: &ThreadId, name: &str) -> Result<Option<Bytes>>;
    /// Releases underlying resources; called once on engine shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}
