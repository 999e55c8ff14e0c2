//! Thread and log identities.
//!
//! A thread is a logical collection of single-author logs sharing a
//! [`ThreadKey`](crate::keys::ThreadKey). Every log is identified by the
//! peer-shaped id derived from its public key, so a log id doubles as a
//! dialable identity on the network.

use std::fmt::{self, Debug, Display};
use std::str::FromStr;

use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::keys::ThreadKey;

/// Total encoded length of a thread id: 4 header bytes plus 32 random bytes.
pub const THREAD_ID_LEN: usize = 36;

const THREAD_ID_VERSION: u8 = 0x01;

/// Thread variant, carried in the id header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Variant {
    /// Unrestricted thread.
    Raw = 0x55,
    /// Thread subject to an (externally enforced) access-control list.
    AccessControlled = 0x70,
}

/// Opaque 36-byte identifier of a thread.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId([u8; THREAD_ID_LEN]);

impl ThreadId {
    /// Generates a fresh random id with the [`Variant::Raw`] variant.
    pub fn new_random() -> Self {
        Self::new(Variant::Raw)
    }

    /// Generates a fresh random id with the given variant.
    pub fn new(variant: Variant) -> Self {
        let mut bytes = [0u8; THREAD_ID_LEN];
        bytes[0] = b't';
        bytes[1] = b'h';
        bytes[2] = THREAD_ID_VERSION;
        bytes[3] = variant as u8;
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        ThreadId(bytes)
    }

    /// Parses an id from its raw byte representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; THREAD_ID_LEN] = bytes.try_into().map_err(|_| Error::InvalidThreadId)?;
        let id = ThreadId(arr);
        id.validate()?;
        Ok(id)
    }

    /// Raw byte representation.
    pub fn as_bytes(&self) -> &[u8; THREAD_ID_LEN] {
        &self.0
    }

    /// Checks the header for a known version and variant.
    pub fn validate(&self) -> Result<()> {
        if self.0[0] != b't' || self.0[1] != b'h' || self.0[2] != THREAD_ID_VERSION {
            return Err(Error::InvalidThreadId);
        }
        match self.0[3] {
            x if x == Variant::Raw as u8 => Ok(()),
            x if x == Variant::AccessControlled as u8 => Ok(()),
            _ => Err(Error::InvalidThreadId),
        }
    }

    /// Shortened form for log output.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[4..9])
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.fmt_short())
    }
}

impl FromStr for ThreadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidThreadId)?;
        Self::from_bytes(&bytes)
    }
}

impl serde::Serialize for ThreadId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ThreadId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;
        impl<'de> serde::de::Visitor<'de> for IdVisitor {
            type Value = ThreadId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{THREAD_ID_LEN} bytes")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ThreadId, E> {
                ThreadId::from_bytes(v).map_err(|_| E::invalid_length(v.len(), &self))
            }
        }
        deserializer.deserialize_bytes(IdVisitor)
    }
}

/// A peer multiaddr with a trailing `/thread/<id>` component.
///
/// This is the unit shared out-of-band to invite a peer onto a thread:
/// `/ip4/…/p2p/<peer>/thread/<id>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadAddr {
    addr: Multiaddr,
    thread: ThreadId,
}

impl ThreadAddr {
    /// Combines a peer multiaddr with a thread id.
    pub fn new(addr: Multiaddr, thread: ThreadId) -> Self {
        Self { addr, thread }
    }

    /// The thread id component.
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// The peer multiaddr without the thread component.
    pub fn peer_addr(&self) -> &Multiaddr {
        &self.addr
    }

    /// The peer id embedded in the address.
    pub fn peer_id(&self) -> Result<PeerId> {
        peer_of(&self.addr).ok_or(Error::InvalidThreadAddr)
    }
}

impl Display for ThreadAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/thread/{}", self.addr, self.thread)
    }
}

impl FromStr for ThreadAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, id) = s.rsplit_once("/thread/").ok_or(Error::InvalidThreadAddr)?;
        let addr: Multiaddr = addr.parse().map_err(|_| Error::InvalidThreadAddr)?;
        let thread = id.parse()?;
        Ok(ThreadAddr { addr, thread })
    }
}

/// Everything a peer knows about one log.
#[derive(derive_more::Debug, Clone)]
pub struct LogInfo {
    /// Peer-shaped id derived from the log's public key.
    pub id: PeerId,
    /// Public key all records of this log are signed with.
    pub pub_key: PublicKey,
    /// Private key, present only when the local peer manages the log.
    #[debug(skip)]
    pub priv_key: Option<Keypair>,
    /// Dialable addresses of peers carrying this log.
    pub addrs: Vec<Multiaddr>,
    /// The most recent persisted-and-processed record, if any.
    pub head: Option<Cid>,
}

impl LogInfo {
    /// Builds log info for a freshly generated or imported keypair.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let pub_key = keypair.public();
        LogInfo {
            id: pub_key.to_peer_id(),
            pub_key,
            priv_key: Some(keypair),
            addrs: Vec::new(),
            head: None,
        }
    }

    /// Builds log info for a log managed elsewhere.
    pub fn from_public(pub_key: PublicKey) -> Self {
        LogInfo {
            id: pub_key.to_peer_id(),
            pub_key,
            priv_key: None,
            addrs: Vec::new(),
            head: None,
        }
    }

    /// True iff the local peer holds the private key and may author records.
    pub fn managed(&self) -> bool {
        self.priv_key.is_some()
    }
}

/// A thread with its key material and known logs.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// The thread id.
    pub id: ThreadId,
    /// Service (and optionally read) key.
    pub key: ThreadKey,
    /// All logs known under this thread.
    pub logs: Vec<LogInfo>,
    /// Host-rooted thread addresses, filled by the facade.
    pub addrs: Vec<ThreadAddr>,
}

impl ThreadInfo {
    /// A thread with no logs yet.
    pub fn new(id: ThreadId, key: ThreadKey) -> Self {
        ThreadInfo {
            id,
            key,
            logs: Vec::new(),
            addrs: Vec::new(),
        }
    }

    /// The first managed log, if any.
    pub fn first_managed_log(&self) -> Option<&LogInfo> {
        self.logs.iter().find(|l| l.managed())
    }
}

/// Extracts the peer id component from a multiaddr.
pub(crate) fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(id) => Some(id),
        _ => None,
    })
}

/// Strips everything from the `/p2p` component on, leaving the dialable part.
pub(crate) fn dialable(addr: &Multiaddr) -> Option<Multiaddr> {
    let mut out = Multiaddr::empty();
    for p in addr.iter() {
        if matches!(p, Protocol::P2p(_)) {
            break;
        }
        out.push(p);
    }
    (!out.is_empty()).then_some(out)
}

/// A bare `/p2p/<peer>` multiaddr.
pub(crate) fn p2p_addr(peer: PeerId) -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2p(peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ThreadKey;

    #[test]
    fn thread_id_roundtrip() {
        let id = ThreadId::new_random();
        let parsed: ThreadId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(ThreadId::from_bytes(&[0u8; 36]).is_err());
        assert!(ThreadId::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn thread_addr_roundtrip() {
        let keypair = Keypair::generate_ed25519();
        let peer = keypair.public().to_peer_id();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4006/p2p/{peer}")
            .parse()
            .unwrap();
        let ta = ThreadAddr::new(addr.clone(), ThreadId::new_random());
        let parsed: ThreadAddr = ta.to_string().parse().unwrap();
        assert_eq!(ta, parsed);
        assert_eq!(parsed.peer_id().unwrap(), peer);
        assert_eq!(dialable(&addr).unwrap().to_string(), "/ip4/127.0.0.1/tcp/4006");
    }

    #[test]
    fn managed_logs() {
        let lg = LogInfo::from_keypair(Keypair::generate_ed25519());
        assert!(lg.managed());
        let ext = LogInfo::from_public(Keypair::generate_ed25519().public());
        assert!(!ext.managed());

        let mut info = ThreadInfo::new(ThreadId::new_random(), ThreadKey::new_random());
        info.logs.push(ext);
        assert!(info.first_managed_log().is_none());
        info.logs.push(lg);
        assert!(info.first_managed_log().is_some());
    }
}
