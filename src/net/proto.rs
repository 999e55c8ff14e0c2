//! Wire protocol: framed request/response messages between peers.
//!
//! Every RPC is one freshly opened stream carrying a single
//! length-prefixed, postcard-encoded [`Request`] and its [`Response`].
//! Requests touching log content carry the thread's service-key bytes as
//! bearer proof of membership.

use bytes::Bytes;
use cid::Cid;
use libp2p::{Multiaddr, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::blockstore::{Block, Blockstore};
use crate::codec::{Event, Record};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::keys::SymmetricKey;
use crate::thread::{LogInfo, ThreadId};

/// Frames above this size are refused outright.
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A log announcement without private key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireLog {
    pub id: Vec<u8>,
    pub pub_key: Vec<u8>,
    pub addrs: Vec<Vec<u8>>,
}

impl WireLog {
    pub fn from_info(info: &LogInfo) -> Self {
        WireLog {
            id: info.id.to_bytes(),
            pub_key: info.pub_key.encode_protobuf(),
            addrs: info.addrs.iter().map(|a| a.to_vec()).collect(),
        }
    }

    pub fn into_info(self) -> Result<LogInfo> {
        let pub_key = libp2p::identity::PublicKey::try_decode_protobuf(&self.pub_key)
            .map_err(|_| Error::InvalidLogKey)?;
        let id = PeerId::from_bytes(&self.id).map_err(|_| Error::InvalidLogKey)?;
        if id != pub_key.to_peer_id() {
            return Err(Error::InvalidLogKey);
        }
        let mut info = LogInfo::from_public(pub_key);
        for addr in self.addrs {
            if let Ok(addr) = Multiaddr::try_from(addr) {
                info.addrs.push(addr);
            }
        }
        Ok(info)
    }
}

/// A record with its event blocks, hydrated for transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireRecord {
    pub envelope: Bytes,
    pub event: Bytes,
    pub header: Bytes,
    pub body: Bytes,
}

impl WireRecord {
    /// Hydrates a record for the wire, loading event blocks from the store
    /// when the record does not carry them already.
    pub fn from_record(rec: &Record, blocks: &dyn Blockstore) -> Result<Self> {
        let event = match rec.event() {
            Some(event) => event.clone(),
            None => Event::from_store(blocks, rec.block_cid())?,
        };
        Ok(WireRecord {
            envelope: rec.envelope().data().clone(),
            event: event.block().data().clone(),
            header: event.header_block().data().clone(),
            body: event.body_block().data().clone(),
        })
    }

    /// Decodes into a hydrated [`Record`], checking block linkage.
    pub fn into_record(self, service_key: &SymmetricKey) -> Result<Record> {
        let record = Record::from_block(Block::new(self.envelope), service_key)?;
        let event = Event::from_blocks(
            Block::new(self.event),
            Block::new(self.header),
            Block::new(self.body),
        )?;
        record.with_event(event)
    }
}

/// `(thread, multiset hash of log heads)` pair for edge comparison.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ThreadEdge {
    pub thread: ThreadId,
    pub edge: u64,
}

/// Per-log offset of a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LogOffset {
    pub log: Vec<u8>,
    pub offset: Option<Cid>,
}

/// Records served for one log, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LogRecords {
    pub log: Vec<u8>,
    pub records: Vec<WireRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Request {
    GetLogs {
        thread: ThreadId,
        service_key: Vec<u8>,
    },
    GetRecords {
        thread: ThreadId,
        service_key: Vec<u8>,
        offsets: Vec<LogOffset>,
        limit: u64,
    },
    PushLog {
        thread: ThreadId,
        log: WireLog,
        service_key: Option<Vec<u8>>,
    },
    PushRecord {
        thread: ThreadId,
        log: Vec<u8>,
        record: WireRecord,
    },
    ExchangeEdges {
        edges: Vec<ThreadEdge>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum Response {
    Logs { logs: Vec<WireLog> },
    Records { logs: Vec<LogRecords> },
    Edges { edges: Vec<ThreadEdge> },
    Ok,
    Error { message: String },
}

/// Writes one length-prefixed postcard frame.
pub(crate) async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<()> {
    let data = postcard::to_stdvec(msg)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Other(anyhow::anyhow!(
            "outgoing frame too large: {}",
            data.len()
        )));
    }
    writer.write_u32(data.len() as u32).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed postcard frame.
pub(crate) async fn read_message<T: DeserializeOwned, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<T> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Other(anyhow::anyhow!(
            "incoming frame too large: {len}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

/// Performs one request/response exchange over a fresh stream, bounded by
/// [`PULL_TIMEOUT`](crate::PULL_TIMEOUT).
///
/// A remote [`Response::Error`] is surfaced as [`Error::Remote`].
pub(crate) async fn rpc(host: &dyn Host, peer: &PeerId, req: &Request) -> Result<Response> {
    let exchange = async {
        let mut stream = host.dial(peer).await?;
        write_message(&mut stream.send, req).await?;
        read_message::<Response, _>(&mut stream.recv).await
    };
    let res = tokio::time::timeout(crate::PULL_TIMEOUT, exchange)
        .await
        .map_err(|_| Error::Remote(format!("call to {peer} timed out")))??;
    if let Response::Error { message } = res {
        return Err(Error::Remote(message));
    }
    Ok(res)
}

/// Order-independent hash over a thread's `(log, head)` set.
pub(crate) fn logs_edge(heads: &[(PeerId, Option<Cid>)]) -> u64 {
    let mut items: Vec<(Vec<u8>, Vec<u8>)> = heads
        .iter()
        .map(|(log, head)| {
            (
                log.to_bytes(),
                head.map(|c| c.to_bytes()).unwrap_or_default(),
            )
        })
        .collect();
    items.sort();
    let mut hasher = blake3::Hasher::new();
    for (log, head) in &items {
        hasher.update(log);
        hasher.update(head);
    }
    let digest = hasher.finalize();
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ThreadKey;
    use libp2p::identity::Keypair;

    #[tokio::test]
    async fn frame_roundtrip() {
        let (mut w, mut r) = tokio::io::duplex(4096);
        let req = Request::GetLogs {
            thread: ThreadId::new_random(),
            service_key: vec![1, 2, 3],
        };
        write_message(&mut w, &req).await.unwrap();
        let back: Request = read_message(&mut r).await.unwrap();
        match (req, back) {
            (
                Request::GetLogs { thread: a, .. },
                Request::GetLogs { thread: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn wire_record_roundtrip() {
        let key = ThreadKey::new_random();
        let log_key = Keypair::generate_ed25519();
        let event = Event::create(b"payload", key.read().unwrap(), key.service()).unwrap();
        let rec = Record::create(event, None, &log_key, key.service()).unwrap();

        let blocks = crate::blockstore::MemBlockstore::new();
        let wire = WireRecord::from_record(&rec, &blocks).unwrap();
        let back = wire.into_record(key.service()).unwrap();
        assert_eq!(back.cid(), rec.cid());
        back.verify(&log_key.public()).unwrap();
        assert!(back.event().is_some());
    }

    #[test]
    fn wire_log_rejects_mismatched_id() {
        let info = LogInfo::from_keypair(Keypair::generate_ed25519());
        let mut wire = WireLog::from_info(&info);
        assert!(!wire.clone().into_info().unwrap().managed());

        wire.id = Keypair::generate_ed25519()
            .public()
            .to_peer_id()
            .to_bytes();
        assert!(wire.into_info().is_err());
    }

    #[test]
    fn edge_is_order_independent() {
        let l1 = Keypair::generate_ed25519().public().to_peer_id();
        let l2 = Keypair::generate_ed25519().public().to_peer_id();
        let head = crate::blockstore::Block::new(&b"r"[..]).cid();

        let a = logs_edge(&[(l1, Some(head)), (l2, None)]);
        let b = logs_edge(&[(l2, None), (l1, Some(head))]);
        assert_eq!(a, b);
        assert_ne!(a, logs_edge(&[(l1, None), (l2, None)]));
    }
}
