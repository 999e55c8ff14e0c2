//! Content-addressed block storage.
//!
//! The engine treats the block store as an external collaborator: a flat
//! mapping from [`Cid`] to bytes. Chain semantics (what a block *means*)
//! live in [`codec`](crate::codec).

use std::collections::HashMap;

use bytes::Bytes;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};
use parking_lot::RwLock;

use crate::error::Result;

/// Multicodec code for raw bytes.
const RAW_CODEC: u64 = 0x55;

/// A block of bytes together with its content id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    cid: Cid,
    data: Bytes,
}

impl Block {
    /// Wraps bytes, computing the CIDv1 (raw, sha2-256) over them.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let cid = Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(&data));
        Block { cid, data }
    }

    /// Rebuilds a block from wire parts, verifying nothing.
    ///
    /// Use [`Block::new`] unless the cid is already known to match.
    pub fn from_parts(cid: Cid, data: Bytes) -> Self {
        Block { cid, data }
    }

    /// The content id.
    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// The raw bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Flat content-addressed storage.
///
/// Implementations must be safe for concurrent callers; the engine never
/// assumes ordering between blocks, only presence.
pub trait Blockstore: Send + Sync + 'static {
    /// Whether the block is present.
    fn has(&self, cid: &Cid) -> Result<bool>;
    /// Fetches a block, `None` when absent.
    fn get(&self, cid: &Cid) -> Result<Option<Block>>;
    /// Stores one block.
    fn put(&self, block: Block) -> Result<()>;
    /// Stores a batch of blocks.
    fn put_many(&self, blocks: Vec<Block>) -> Result<()>;
    /// Removes a block if present.
    fn remove(&self, cid: &Cid) -> Result<()>;
    /// Releases underlying resources; called once on engine shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory block store used by tests and embedders without persistence.
#[derive(Debug, Default)]
pub struct MemBlockstore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
}

impl MemBlockstore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Blockstore for MemBlockstore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }

    fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self
            .blocks
            .read()
            .get(cid)
            .map(|data| Block::from_parts(*cid, data.clone())))
    }

    fn put(&self, block: Block) -> Result<()> {
        self.blocks.write().insert(block.cid, block.data);
        Ok(())
    }

    fn put_many(&self, blocks: Vec<Block>) -> Result<()> {
        let mut map = self.blocks.write();
        for block in blocks {
            map.insert(block.cid, block.data);
        }
        Ok(())
    }

    fn remove(&self, cid: &Cid) -> Result<()> {
        self.blocks.write().remove(cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_has_remove() {
        let store = MemBlockstore::new();
        let block = Block::new(&b"some data"[..]);
        assert!(!store.has(&block.cid()).unwrap());

        store.put(block.clone()).unwrap();
        assert!(store.has(&block.cid()).unwrap());
        assert_eq!(store.get(&block.cid()).unwrap().unwrap(), block);

        store.remove(&block.cid()).unwrap();
        assert!(!store.has(&block.cid()).unwrap());
    }

    #[test]
    fn stable_cids() {
        let a = Block::new(&b"x"[..]);
        let b = Block::new(&b"x"[..]);
        assert_eq!(a.cid(), b.cid());
        assert_ne!(a.cid(), Block::new(&b"y"[..]).cid());
    }
}
