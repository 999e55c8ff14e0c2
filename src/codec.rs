//! Record and event block codec.
//!
//! Every log entry is stored as four blocks:
//!
//! * body: the user payload sealed with the thread's read-key,
//! * header: the read-key and creation time sealed with the service-key,
//! * event: a plain node linking header and body by cid,
//! * record: the signed envelope `{prev, block, sig, pub_key}` sealed with
//!   the service-key; its cid is the link unit forming the log chain.
//!
//! Nodes are postcard-encoded before sealing; block cids are computed over
//! the stored (sealed) bytes.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::blockstore::{Block, Blockstore};
use crate::error::{Error, Result};
use crate::keys::SymmetricKey;

/// Plain node linking the sealed header and body blocks of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventNode {
    /// Cid of the sealed header block.
    pub header: Cid,
    /// Cid of the sealed body block.
    pub body: Cid,
}

/// Decrypted contents of an event header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// The read-key that seals the body.
    pub key: Vec<u8>,
    /// Creation time, micros since the Unix epoch.
    pub time: u64,
}

/// Decrypted contents of a record envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordNode {
    /// Cid of the previous record, `None` for genesis.
    pub prev: Option<Cid>,
    /// Cid of the event block this record points at.
    pub block: Cid,
    /// Log-key signature over `block ‖ prev`.
    pub sig: Vec<u8>,
    /// Protobuf-encoded public key of the authoring log.
    pub pub_key: Vec<u8>,
}

/// An event with all three of its blocks materialized.
#[derive(Debug, Clone)]
pub struct Event {
    node: EventNode,
    block: Block,
    header: Block,
    body: Block,
}

impl Event {
    /// Creates a new event sealing `payload` with the read-key and the
    /// header with the service-key.
    pub fn create(
        payload: &[u8],
        read_key: &SymmetricKey,
        service_key: &SymmetricKey,
    ) -> Result<Self> {
        let body = Block::new(read_key.seal(payload));
        let header = EventHeader {
            key: read_key.as_bytes().to_vec(),
            time: unix_micros(),
        };
        let header = Block::new(service_key.seal(&postcard::to_stdvec(&header)?));
        let node = EventNode {
            header: header.cid(),
            body: body.cid(),
        };
        let block = Block::new(postcard::to_stdvec(&node)?);
        Ok(Event {
            node,
            block,
            header,
            body,
        })
    }

    /// Loads an event and its header/body blocks from the store.
    pub fn from_store(blocks: &dyn Blockstore, cid: Cid) -> Result<Self> {
        let block = blocks.get(&cid)?.ok_or(Error::RecordNotFound(cid))?;
        let node: EventNode = postcard::from_bytes(block.data())?;
        let header = blocks
            .get(&node.header)?
            .ok_or(Error::RecordNotFound(node.header))?;
        let body = blocks
            .get(&node.body)?
            .ok_or(Error::RecordNotFound(node.body))?;
        Ok(Event {
            node,
            block,
            header,
            body,
        })
    }

    /// Rebuilds an event from wire blocks, checking their linkage.
    pub fn from_blocks(block: Block, header: Block, body: Block) -> Result<Self> {
        let node: EventNode = postcard::from_bytes(block.data())?;
        if node.header != header.cid() || node.body != body.cid() {
            return Err(Error::Other(anyhow::anyhow!(
                "header/body blocks do not match the event node"
            )));
        }
        Ok(Event {
            node,
            block,
            header,
            body,
        })
    }

    /// The node linking header and body.
    pub fn node(&self) -> &EventNode {
        &self.node
    }

    /// The plain event block.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// The sealed header block.
    pub fn header_block(&self) -> &Block {
        &self.header
    }

    /// The sealed body block.
    pub fn body_block(&self) -> &Block {
        &self.body
    }

    /// Opens the header with the service-key.
    pub fn header(&self, service_key: &SymmetricKey) -> Result<EventHeader> {
        Ok(postcard::from_bytes(&service_key.open(self.header.data())?)?)
    }

    /// Opens the body with the given read-key.
    pub fn body(&self, read_key: &SymmetricKey) -> Result<Bytes> {
        Ok(read_key.open(self.body.data())?.into())
    }
}

/// A record: the decoded envelope plus, when available, its event blocks.
///
/// Records decoded from the local store have `event == None` and load their
/// event lazily; records from the wire arrive hydrated.
#[derive(Debug, Clone)]
pub struct Record {
    envelope: Block,
    node: RecordNode,
    event: Option<Event>,
}

impl Record {
    /// Signs and seals a new record pointing at `event` with `prev` as the
    /// chain predecessor.
    pub fn create(
        event: Event,
        prev: Option<Cid>,
        log_key: &Keypair,
        service_key: &SymmetricKey,
    ) -> Result<Self> {
        let block = event.block.cid();
        let sig = log_key
            .sign(&sig_payload(&block, &prev))
            .map_err(|e| Error::Other(e.into()))?;
        let node = RecordNode {
            prev,
            block,
            sig,
            pub_key: log_key.public().encode_protobuf(),
        };
        let envelope = Block::new(service_key.seal(&postcard::to_stdvec(&node)?));
        Ok(Record {
            envelope,
            node,
            event: Some(event),
        })
    }

    /// Opens a sealed envelope block.
    pub fn from_block(envelope: Block, service_key: &SymmetricKey) -> Result<Self> {
        let node: RecordNode = postcard::from_bytes(&service_key.open(envelope.data())?)?;
        Ok(Record {
            envelope,
            node,
            event: None,
        })
    }

    /// Attaches hydrated event blocks (wire path).
    pub fn with_event(mut self, event: Event) -> Result<Self> {
        if event.block.cid() != self.node.block {
            return Err(Error::Other(anyhow::anyhow!(
                "event block does not match the record envelope"
            )));
        }
        self.event = Some(event);
        Ok(self)
    }

    /// The envelope cid, identifying this record in the chain.
    pub fn cid(&self) -> Cid {
        self.envelope.cid()
    }

    /// Cid of the previous record, `None` for genesis.
    pub fn prev(&self) -> Option<Cid> {
        self.node.prev
    }

    /// Cid of the event this record carries.
    pub fn block_cid(&self) -> Cid {
        self.node.block
    }

    /// The sealed envelope block.
    pub fn envelope(&self) -> &Block {
        &self.envelope
    }

    /// The decoded envelope node.
    pub fn node(&self) -> &RecordNode {
        &self.node
    }

    /// Hydrated event blocks, if attached.
    pub fn event(&self) -> Option<&Event> {
        self.event.as_ref()
    }

    /// The authoring public key embedded in the envelope.
    pub fn pub_key(&self) -> Result<PublicKey> {
        PublicKey::try_decode_protobuf(&self.node.pub_key).map_err(|_| Error::InvalidSignature)
    }

    /// Verifies the envelope signature against `key`.
    pub fn verify(&self, key: &PublicKey) -> Result<()> {
        let msg = sig_payload(&self.node.block, &self.node.prev);
        if key.verify(&msg, &self.node.sig) {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }
}

/// Loads and opens a record from the store; the service-key is required.
pub fn get_record(blocks: &dyn Blockstore, cid: Cid, service_key: &SymmetricKey) -> Result<Record> {
    let envelope = blocks.get(&cid)?.ok_or(Error::RecordNotFound(cid))?;
    Record::from_block(envelope, service_key)
}

/// Canonical byte payload the log key signs: `block ‖ prev?`.
fn sig_payload(block: &Cid, prev: &Option<Cid>) -> Vec<u8> {
    let mut out = block.to_bytes();
    if let Some(prev) = prev {
        out.extend(prev.to_bytes());
    }
    out
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemBlockstore;

    fn keys() -> (SymmetricKey, SymmetricKey) {
        (SymmetricKey::new_random(), SymmetricKey::new_random())
    }

    #[test]
    fn event_roundtrip() {
        let (service, read) = keys();
        let event = Event::create(b"payload", &read, &service).unwrap();
        assert_eq!(event.body(&read).unwrap().as_ref(), b"payload");

        let header = event.header(&service).unwrap();
        let recovered = SymmetricKey::from_bytes(&header.key).unwrap();
        assert_eq!(event.body(&recovered).unwrap().as_ref(), b"payload");

        let store = MemBlockstore::new();
        store
            .put_many(vec![
                event.block().clone(),
                event.header_block().clone(),
                event.body_block().clone(),
            ])
            .unwrap();
        let loaded = Event::from_store(&store, event.block().cid()).unwrap();
        assert_eq!(loaded.node(), event.node());
    }

    #[test]
    fn record_sign_and_verify() {
        let (service, read) = keys();
        let log_key = Keypair::generate_ed25519();
        let event = Event::create(b"r1", &read, &service).unwrap();
        let rec = Record::create(event, None, &log_key, &service).unwrap();

        rec.verify(&log_key.public()).unwrap();
        assert_eq!(rec.pub_key().unwrap(), log_key.public());
        assert!(rec
            .verify(&Keypair::generate_ed25519().public())
            .is_err());

        // reopen from the sealed envelope
        let reopened = Record::from_block(rec.envelope().clone(), &service).unwrap();
        assert_eq!(reopened.cid(), rec.cid());
        reopened.verify(&log_key.public()).unwrap();

        // wrong service key cannot even open the envelope
        let other = SymmetricKey::new_random();
        assert!(Record::from_block(rec.envelope().clone(), &other).is_err());
    }

    #[test]
    fn chained_records() {
        let (service, read) = keys();
        let log_key = Keypair::generate_ed25519();

        let e1 = Event::create(b"r1", &read, &service).unwrap();
        let r1 = Record::create(e1, None, &log_key, &service).unwrap();
        let e2 = Event::create(b"r2", &read, &service).unwrap();
        let r2 = Record::create(e2, Some(r1.cid()), &log_key, &service).unwrap();

        assert_eq!(r2.prev(), Some(r1.cid()));
        assert_eq!(r1.prev(), None);
        assert_ne!(r1.cid(), r2.cid());
    }
}
