//! Application-layer hooks.
//!
//! An [`App`] attaches to one thread through
//! [`Net::connect_app`](crate::net::Net::connect_app) and receives every
//! record the pipeline commits, in chain order per log. Handlers run with
//! the head already advanced, so delivery is at-least-once and reducers
//! must be idempotent.

use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::identity::PublicKey;
use rand::RngCore;

use crate::bus::ThreadRecord;
use crate::error::Result;
use crate::thread::ThreadInfo;

/// Opaque capability proving ownership of a thread's connector.
#[derive(Clone, PartialEq, Eq)]
pub struct AppToken([u8; 32]);

impl AppToken {
    fn new_random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        AppToken(bytes)
    }
}

impl Debug for AppToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AppToken(<opaque>)")
    }
}

/// Domain-level validation and reduction hooks.
#[async_trait]
pub trait App: Send + Sync + 'static {
    /// Judges a decrypted record body before any head mutation; an error
    /// aborts the whole batch.
    async fn validate_net_record_body(&self, body: &[u8], identity: &PublicKey) -> Result<()>;

    /// Reduces a committed record. The head has already advanced; failures
    /// abort the remainder of the batch but are not rolled back.
    async fn handle_net_record(&self, rec: &ThreadRecord) -> Result<()>;
}

/// An [`App`] bound to one thread, with its capability token.
#[derive(Clone)]
pub struct Connector {
    app: Arc<dyn App>,
    token: AppToken,
    thread: ThreadInfo,
}

impl Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("thread", &self.thread.id)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub(crate) fn new(app: Arc<dyn App>, thread: ThreadInfo) -> Self {
        Connector {
            app,
            token: AppToken::new_random(),
            thread,
        }
    }

    /// The capability token mutating operations must present.
    pub fn token(&self) -> AppToken {
        self.token.clone()
    }

    /// The thread this connector owns.
    pub fn thread(&self) -> &ThreadInfo {
        &self.thread
    }

    pub(crate) async fn validate_net_record_body(
        &self,
        body: &[u8],
        identity: &PublicKey,
    ) -> Result<()> {
        self.app.validate_net_record_body(body, identity).await
    }

    pub(crate) async fn handle_net_record(&self, rec: &ThreadRecord) -> Result<()> {
        self.app.handle_net_record(rec).await
    }
}

/// Pluggable pubsub topic manager.
///
/// The engine only registers and unregisters thread topics; message
/// delivery is the manager's business.
pub trait PubSub: Send + Sync + 'static {
    /// Starts serving the thread's topic.
    fn add(&self, id: crate::thread::ThreadId) -> Result<()>;
    /// Stops serving the thread's topic.
    fn remove(&self, id: crate::thread::ThreadId) -> Result<()>;
}
