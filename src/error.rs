//! Error surface of the replication engine.

use cid::Cid;

/// Alias for results produced by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors emitted by the engine and its stores.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The thread is not present in the logstore.
    #[error("thread not found")]
    ThreadNotFound,
    /// The thread already exists and cannot be created again.
    #[error("thread already exists")]
    ThreadExists,
    /// The log is not present under the given thread.
    #[error("log not found")]
    LogNotFound,
    /// A log with this id (or for this identity) already exists in the thread.
    #[error("log already exists")]
    LogExists,
    /// A record block is missing from the content store.
    #[error("record not found: {0}")]
    RecordNotFound(Cid),
    /// Signature verification failed for a record envelope.
    #[error("invalid record signature")]
    InvalidSignature,
    /// The operation requires the thread's service-key.
    #[error("a service-key is required")]
    ServiceKeyRequired,
    /// The operation requires the thread's read-key.
    #[error("a read-key is required")]
    ReadKeyRequired,
    /// Authoring requires a managed log (one with a private key).
    #[error("a private-key is required to create records")]
    PrivateKeyRequired,
    /// The provided log key is neither a usable public nor private key.
    #[error("invalid log key")]
    InvalidLogKey,
    /// The thread id bytes do not parse.
    #[error("invalid thread id")]
    InvalidThreadId,
    /// The address misses a peer or thread component.
    #[error("invalid thread address")]
    InvalidThreadAddr,
    /// Token signature did not verify against the host key.
    #[error("invalid token")]
    InvalidToken,
    /// The thread is owned by an app connector and the token does not match.
    #[error("thread is in use by an app connector")]
    ThreadInUse,
    /// The presented service-key proof does not match the thread's key.
    #[error("service-key proof rejected")]
    Unauthorized,
    /// The engine (or one of its pools) has been stopped.
    #[error("stopped")]
    Stopped,
    /// A subscriber did not drain its buffer within the notify timeout.
    #[error("subscriber did not keep up within the notify timeout")]
    NotifyTimeout,
    /// Symmetric encryption or decryption failed.
    #[error("crypto failure")]
    Crypto,
    /// Node or frame (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    /// Stream-level failure while talking to a peer.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A remote peer answered with an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// Anything else, mostly transport and store internals.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for the not-found family, which callers may treat as benign.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::ThreadNotFound | Error::LogNotFound | Error::RecordNotFound(_)
        )
    }
}
