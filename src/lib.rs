//! Peer-to-peer replication of append-only, per-author record logs grouped
//! into logical *threads*.
//!
//! Each peer holds a local view of a thread composed of one or more logs
//! authored by different identities. Peers discover each other, push new
//! records as they are produced, and periodically pull to bridge any gap.
//! Per log, records form a linear, cryptographically chained sequence; head
//! advancement is serialized per thread while work across threads runs in
//! parallel.
//!
//! The entry point is [`net::Net`], composed from four pluggable
//! collaborators: a [`host::Host`] (peer identity + dialable streams), a
//! [`blockstore::Blockstore`] (content-addressed block storage), a
//! [`store::Logstore`] (thread metadata) and optionally an
//! [`app::App`] connector receiving decrypted records.
//!
//! In-memory implementations of all collaborators are included, so two
//! fully working peers fit in one process:
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use threads_net::blockstore::MemBlockstore;
//! use threads_net::host::MemNetwork;
//! use threads_net::net::{Config, Net, NewThreadOptions, ThreadOptions};
//! use threads_net::store::memory::MemLogstore;
//! use threads_net::thread::ThreadId;
//!
//! let network = MemNetwork::new();
//! let net = Net::new(
//!     network.host(),
//!     Arc::new(MemBlockstore::new()),
//!     Arc::new(MemLogstore::new()),
//!     None,
//!     Config::default(),
//! );
//! let info = net.create_thread(ThreadId::new_random(), NewThreadOptions::default())?;
//! net.create_record(info.id, "hello".into(), ThreadOptions::default()).await?;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

use std::time::Duration;

pub mod app;
pub mod blockstore;
pub mod bus;
pub mod codec;
pub mod error;
pub mod host;
pub mod keys;
pub mod net;
pub mod queue;
pub mod semaphore;
pub mod store;
pub mod thread;

pub use self::error::{Error, Result};

/// Maximum page size for pulling records.
pub const MAX_PULL_LIMIT: usize = 10_000;

/// Pause before the pull/exchange scheduler starts.
pub const PULL_START_AFTER: Duration = Duration::from_secs(1);

/// Interval for the first cycle of edge exchange.
pub const INITIAL_PULL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between automatic edge exchanges.
pub const PULL_INTERVAL: Duration = Duration::from_secs(10);

/// Timeout of one pull interaction with a peer.
pub const PULL_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of threads in a single edge exchange.
pub const MAX_THREADS_EXCHANGED: usize = 10;

/// Maximum duration of collecting threads for one exchange request.
pub const EXCHANGE_COMPRESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Polling interval of the call queues.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Buffer size of local event bus listeners.
pub const EVENT_BUS_CAPACITY: usize = 1;

/// Duration to wait for a subscriber to read a new record.
pub(crate) const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte length of token challenges.
pub(crate) const TOKEN_CHALLENGE_BYTES: usize = 32;

/// Time given to an identity to complete a token challenge.
pub(crate) const TOKEN_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(60);
