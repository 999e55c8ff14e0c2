//! Transport host abstraction.
//!
//! The engine does not speak a concrete transport; it needs a local
//! identity, an address book and the ability to open one bidirectional
//! stream per RPC exchange. [`MemNetwork`] wires hosts together in-process
//! for tests and single-binary embeddings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// One bidirectional stream, carrying a single RPC exchange.
#[derive(derive_more::Debug)]
pub struct BiStream {
    /// Write half.
    #[debug(skip)]
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    /// Read half.
    #[debug(skip)]
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
}

/// Opaque peer identity plus dialable stream abstraction.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// The local peer id.
    fn id(&self) -> PeerId;
    /// The local keypair (host identity, used for token issuance).
    fn keypair(&self) -> Keypair;
    /// Addresses the host is reachable on.
    fn addrs(&self) -> Vec<Multiaddr>;
    /// Records a dialable address for a peer.
    fn add_addr(&self, peer: PeerId, addr: Multiaddr);
    /// Opens a fresh stream to the peer.
    async fn dial(&self, peer: &PeerId) -> Result<BiStream>;
    /// Inbound streams, one per remote RPC exchange.
    fn incoming(&self) -> flume::Receiver<(PeerId, BiStream)>;
    /// Stops accepting and opening streams; called once on engine shutdown.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

const STREAM_BUF: usize = 64 * 1024;

type Inbox = flume::Sender<(PeerId, BiStream)>;

/// An in-process network connecting [`MemHost`]s.
#[derive(Debug, Default, Clone)]
pub struct MemNetwork {
    peers: Arc<Mutex<HashMap<PeerId, Inbox>>>,
}

impl MemNetwork {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host with a fresh ed25519 identity on this network.
    pub fn host(&self) -> Arc<MemHost> {
        let keypair = Keypair::generate_ed25519();
        let id = keypair.public().to_peer_id();
        let (inbox_tx, inbox_rx) = flume::unbounded();
        self.peers.lock().insert(id, inbox_tx);
        Arc::new(MemHost {
            keypair,
            id,
            network: self.clone(),
            inbox: inbox_rx,
            addr_book: Mutex::new(HashMap::new()),
        })
    }
}

/// A [`Host`] connected to a [`MemNetwork`].
#[derive(derive_more::Debug)]
pub struct MemHost {
    #[debug("<keypair>")]
    keypair: Keypair,
    id: PeerId,
    network: MemNetwork,
    #[debug(skip)]
    inbox: flume::Receiver<(PeerId, BiStream)>,
    addr_book: Mutex<HashMap<PeerId, Vec<Multiaddr>>>,
}

#[async_trait]
impl Host for MemHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn keypair(&self) -> Keypair {
        self.keypair.clone()
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        // a single synthetic address; peers on a MemNetwork dial by id
        vec![Multiaddr::empty().with(libp2p::multiaddr::Protocol::Memory(1))]
    }

    fn add_addr(&self, peer: PeerId, addr: Multiaddr) {
        let mut book = self.addr_book.lock();
        let addrs = book.entry(peer).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    async fn dial(&self, peer: &PeerId) -> Result<BiStream> {
        let inbox = self
            .network
            .peers
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("peer {peer} is not dialable")))?;
        let (out_w, out_r) = tokio::io::duplex(STREAM_BUF);
        let (in_w, in_r) = tokio::io::duplex(STREAM_BUF);
        let remote = BiStream {
            send: Box::new(in_w),
            recv: Box::new(out_r),
        };
        inbox
            .send_async((self.id, remote))
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("peer {peer} is gone")))?;
        Ok(BiStream {
            send: Box::new(out_w),
            recv: Box::new(in_r),
        })
    }

    fn incoming(&self) -> flume::Receiver<(PeerId, BiStream)> {
        self.inbox.clone()
    }

    fn close(&self) -> Result<()> {
        // deregistering drops the inbox sender, so peers cannot dial us
        // and pending incoming receivers disconnect
        self.network.peers.lock().remove(&self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_echo() {
        let network = MemNetwork::new();
        let a = network.host();
        let b = network.host();

        let b_inbox = b.incoming();
        let server = tokio::spawn(async move {
            let (from, mut stream) = b_inbox.recv_async().await.unwrap();
            let mut buf = [0u8; 5];
            stream.recv.read_exact(&mut buf).await.unwrap();
            stream.send.write_all(&buf).await.unwrap();
            from
        });

        let mut stream = a.dial(&b.id()).await.unwrap();
        stream.send.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.recv.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(server.await.unwrap(), a.id());
    }

    #[tokio::test]
    async fn unknown_peer_fails() {
        let network = MemNetwork::new();
        let a = network.host();
        let stranger = Keypair::generate_ed25519().public().to_peer_id();
        assert!(a.dial(&stranger).await.is_err());
    }

    #[tokio::test]
    async fn closed_host_is_not_dialable() {
        let network = MemNetwork::new();
        let a = network.host();
        let b = network.host();

        let b_inbox = b.incoming();
        b.close().unwrap();
        assert!(a.dial(&b.id()).await.is_err());
        assert!(
            b_inbox.recv_async().await.is_err(),
            "inbox disconnects on close"
        );
    }
}
