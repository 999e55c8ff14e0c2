//! The replication engine facade.
//!
//! [`Net`] composes the logstore, the block store, the transport host and
//! the in-process machinery (semaphore pool, call queues, thread packer,
//! event bus) into the public thread API. All state lives in one inner
//! struct behind an [`Arc`]; cloning a [`Net`] is cheap and every clone
//! drives the same engine.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use rand::RngCore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::app::{App, AppToken, Connector, PubSub};
use crate::blockstore::Blockstore;
use crate::bus::{Broadcaster, ThreadRecord};
use crate::codec::{self, Event, Record};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::keys::{Identity, SymmetricKey, ThreadKey, Token};
use crate::queue::{CallQueue, DuplicatePolicy, ThreadPacker};
use crate::semaphore::{thread_update, SemaphorePool};
use crate::store::Logstore;
use crate::thread::{dialable, p2p_addr, peer_of, LogInfo, ThreadAddr, ThreadId, ThreadInfo};

mod proto;
mod server;

/// Engine tunables; [`Config::default`] matches the crate-level constants.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum page size for pulling records.
    pub max_pull_limit: usize,
    /// Pause before the pull/exchange scheduler starts.
    pub pull_start_after: Duration,
    /// Interval of the first pull cycle.
    pub initial_pull_interval: Duration,
    /// Interval of subsequent pull cycles, and the per-key call-queue gap.
    pub pull_interval: Duration,
    /// Maximum number of threads per edge exchange.
    pub max_threads_exchanged: usize,
    /// How long exchange signals buffer before flushing.
    pub exchange_compression_timeout: Duration,
    /// Polling interval of the call queues.
    pub queue_poll_interval: Duration,
    /// Buffer size of event bus listeners.
    pub event_bus_capacity: usize,
    /// How long a subscriber may stall a publishing batch.
    pub notify_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_pull_limit: crate::MAX_PULL_LIMIT,
            pull_start_after: crate::PULL_START_AFTER,
            initial_pull_interval: crate::INITIAL_PULL_INTERVAL,
            pull_interval: crate::PULL_INTERVAL,
            max_threads_exchanged: crate::MAX_THREADS_EXCHANGED,
            exchange_compression_timeout: crate::EXCHANGE_COMPRESSION_TIMEOUT,
            queue_poll_interval: crate::QUEUE_POLL_INTERVAL,
            event_bus_capacity: crate::EVENT_BUS_CAPACITY,
            notify_timeout: crate::NOTIFY_TIMEOUT,
        }
    }
}

/// Key material for a new log.
#[derive(derive_more::Debug, Clone)]
pub enum LogKey {
    /// The log will be managed locally.
    #[debug("Private(<secret>)")]
    Private(Keypair),
    /// The log is managed elsewhere; records can only be followed.
    Public(PublicKey),
}

/// Options for [`Net::create_thread`] and [`Net::add_thread`].
#[derive(Debug, Default)]
pub struct NewThreadOptions {
    /// Thread key; generated for `create_thread`, required for `add_thread`.
    pub thread_key: Option<ThreadKey>,
    /// Key of the local log, fresh ed25519 when absent.
    pub log_key: Option<LogKey>,
    /// Access token obtained from [`Net::get_token`].
    pub token: Option<Token>,
}

/// Options for operations on existing threads.
#[derive(Debug, Default)]
pub struct ThreadOptions {
    /// Access token obtained from [`Net::get_token`].
    pub token: Option<Token>,
    /// Connector capability, required when an app owns the thread.
    pub app_token: Option<AppToken>,
}

struct NetInner {
    host: Arc<dyn Host>,
    blocks: Arc<dyn Blockstore>,
    store: Arc<dyn Logstore>,
    pubsub: Option<Arc<dyn PubSub>>,
    bus: Broadcaster,
    connectors: RwLock<HashMap<ThreadId, Arc<Connector>>>,
    semaphores: SemaphorePool,
    queue_get_logs: CallQueue,
    queue_get_records: CallQueue,
    config: Config,
    cancel: CancellationToken,
}

/// Handle to a running replication engine.
#[derive(Clone)]
pub struct Net {
    inner: Arc<NetInner>,
}

impl Debug for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Net")
            .field("host", &self.inner.host.id())
            .finish_non_exhaustive()
    }
}

impl Net {
    /// Starts the engine: spawns the RPC accept loop and the pull/exchange
    /// scheduler. Must be called within a tokio runtime.
    pub fn new(
        host: Arc<dyn Host>,
        blocks: Arc<dyn Blockstore>,
        store: Arc<dyn Logstore>,
        pubsub: Option<Arc<dyn PubSub>>,
        config: Config,
    ) -> Net {
        let cancel = CancellationToken::new();
        let inner = Arc::new(NetInner {
            host,
            blocks,
            store,
            pubsub,
            bus: Broadcaster::new(config.event_bus_capacity),
            connectors: RwLock::new(HashMap::new()),
            semaphores: SemaphorePool::new(),
            queue_get_logs: CallQueue::new(
                cancel.child_token(),
                DuplicatePolicy::Drop,
                config.queue_poll_interval,
                config.pull_interval,
            ),
            queue_get_records: CallQueue::new(
                cancel.child_token(),
                DuplicatePolicy::Replace,
                config.queue_poll_interval,
                config.pull_interval,
            ),
            config,
            cancel,
        });
        let net = Net { inner };
        tokio::spawn(net.clone().run_server());
        tokio::spawn(net.clone().run_pull_loop());
        net
    }

    /// The local peer id.
    pub fn host_id(&self) -> PeerId {
        self.inner.host.id()
    }

    /// The underlying logstore.
    pub fn store(&self) -> Arc<dyn Logstore> {
        self.inner.store.clone()
    }

    /// Shuts the engine down: waits for in-flight record batches, cancels
    /// all background work (and with it the per-RPC streams), then closes
    /// the host and both stores. Idempotent.
    pub async fn close(&self) {
        self.inner.semaphores.stop().await;
        self.inner.cancel.cancel();
        if let Err(err) = self.inner.host.close() {
            error!("closing host failed: {err}");
        }
        if let Err(err) = self.inner.blocks.close() {
            error!("closing block store failed: {err}");
        }
        if let Err(err) = self.inner.store.close() {
            error!("closing logstore failed: {err}");
        }
        self.inner.bus.discard();
    }

    /// Issues an access token after a challenge round with `identity`.
    pub async fn get_token(&self, identity: &dyn Identity) -> Result<Token> {
        let mut challenge = vec![0u8; crate::TOKEN_CHALLENGE_BYTES];
        rand::thread_rng().fill_bytes(&mut challenge);
        let sig = tokio::time::timeout(crate::TOKEN_CHALLENGE_TIMEOUT, identity.sign(&challenge))
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("token challenge timed out")))??;
        let key = identity.public();
        if !key.verify(&challenge, &sig) {
            return Err(Error::InvalidToken);
        }
        Token::issue(&self.inner.host.keypair(), &key)
    }

    /// Creates a thread with a local managing log.
    pub fn create_thread(&self, id: ThreadId, opts: NewThreadOptions) -> Result<ThreadInfo> {
        let identity = self
            .validate(&id, opts.token.as_ref(), false)?
            .unwrap_or_else(|| self.inner.host.keypair().public());
        self.ensure_unique_log(&id, opts.log_key.as_ref(), &identity)?;

        let key = opts.thread_key.unwrap_or_else(ThreadKey::new_random);
        self.inner.store.add_thread(ThreadInfo::new(id, key))?;
        self.create_log(&id, opts.log_key, &identity)?;
        if let Some(ps) = &self.inner.pubsub {
            ps.add(id)?;
        }
        debug!(thread = %id.fmt_short(), "created thread");
        self.get_thread_with_addrs(&id)
    }

    /// Adds a thread served by another peer and schedules log discovery.
    ///
    /// The thread key must be provided out-of-band with the address.
    pub fn add_thread(&self, addr: &ThreadAddr, opts: NewThreadOptions) -> Result<ThreadInfo> {
        let id = addr.thread();
        let identity = self
            .validate(&id, opts.token.as_ref(), false)?
            .unwrap_or_else(|| self.inner.host.keypair().public());
        self.ensure_unique_log(&id, opts.log_key.as_ref(), &identity)?;

        let peer = addr.peer_id()?;
        let from_self = peer == self.inner.host.id();
        if from_self && matches!(self.inner.store.get_thread(&id), Err(Error::ThreadNotFound)) {
            return Err(Error::ThreadNotFound);
        }

        let key = opts.thread_key.ok_or(Error::ServiceKeyRequired)?;
        let can_read = key.can_read();
        self.inner.store.add_thread(ThreadInfo::new(id, key))?;
        if can_read || opts.log_key.is_some() {
            self.create_log(&id, opts.log_key, &identity)?;
        }

        if !from_self {
            if let Some(d) = dialable(addr.peer_addr()) {
                self.inner.host.add_addr(peer, d);
            }
            let net = self.clone();
            self.inner.queue_get_logs.call(peer, id, move || async move {
                net.update_logs_from_peer(peer, id).await?;
                if let Some(ps) = &net.inner.pubsub {
                    ps.add(id)?;
                }
                Ok(())
            });
        } else if let Some(ps) = &self.inner.pubsub {
            ps.add(id)?;
        }
        self.get_thread_with_addrs(&id)
    }

    /// Returns the thread with host-rooted thread addresses.
    pub fn get_thread(&self, id: &ThreadId, opts: ThreadOptions) -> Result<ThreadInfo> {
        self.validate(id, opts.token.as_ref(), true)?;
        self.get_thread_with_addrs(id)
    }

    /// Pulls new records for the thread from all involved peers.
    pub async fn pull_thread(&self, id: ThreadId, opts: ThreadOptions) -> Result<()> {
        self.validate(&id, opts.token.as_ref(), true)?;
        self.pull_thread_inner(id).await
    }

    pub(crate) async fn pull_thread_inner(&self, id: ThreadId) -> Result<()> {
        let (offsets, peers) = self.thread_offsets(&id)?;
        let recs = self
            .get_records_from_peers(&peers, id, offsets, self.inner.config.max_pull_limit)
            .await;
        for (lid, rs) in recs {
            if rs.is_empty() {
                continue;
            }
            self.put_records(id, lid, rs).await?;
        }
        Ok(())
    }

    /// Deletes the thread: removes every record, event, header and body
    /// block of all of its logs, then the logstore metadata.
    pub async fn delete_thread(&self, id: ThreadId, opts: ThreadOptions) -> Result<()> {
        self.validate(&id, opts.token.as_ref(), false)?;
        let (_, authorized) = self.connector_protected(&id, opts.app_token.as_ref());
        if !authorized {
            return Err(Error::ThreadInUse);
        }
        debug!(thread = %id.fmt_short(), "deleting thread");
        // must block while the thread is being pulled
        let _guard = self.inner.semaphores.acquire(thread_update(&id)).await?;
        self.delete_thread_locked(&id)
    }

    fn delete_thread_locked(&self, id: &ThreadId) -> Result<()> {
        if let Some(ps) = &self.inner.pubsub {
            ps.remove(*id)?;
        }
        let info = self.inner.store.get_thread(id)?;
        for lg in &info.logs {
            let mut head = lg.head;
            while let Some(rid) = head {
                head = self.delete_record(rid, info.key.service())?;
            }
        }
        self.inner.store.delete_thread(id)
    }

    fn delete_record(&self, rid: Cid, service_key: &SymmetricKey) -> Result<Option<Cid>> {
        let rec = codec::get_record(&*self.inner.blocks, rid, service_key)?;
        self.inner.blocks.remove(&rid)?;
        let event = Event::from_store(&*self.inner.blocks, rec.block_cid())?;
        self.inner.blocks.remove(&event.block().cid())?;
        self.inner.blocks.remove(&event.header_block().cid())?;
        self.inner.blocks.remove(&event.body_block().cid())?;
        Ok(rec.prev())
    }

    /// Makes `paddr`'s peer a replicator of the thread: adds its address to
    /// every managed log and pushes all logs to it, then announces the
    /// updated logs to all other known peers.
    pub async fn add_replicator(
        &self,
        id: ThreadId,
        paddr: &Multiaddr,
        opts: ThreadOptions,
    ) -> Result<PeerId> {
        self.validate(&id, opts.token.as_ref(), true)?;
        let info = self.inner.store.get_thread(&id)?;
        let pid = peer_of(paddr).ok_or(Error::InvalidThreadAddr)?;

        let addr = p2p_addr(pid);
        let managed = self.inner.store.get_managed_logs(&id)?;
        for lg in &managed {
            self.inner.store.add_addr(&id, &lg.id, addr.clone())?;
        }
        let updated = self.inner.store.get_thread(&id)?;

        if pid != self.inner.host.id() {
            match dialable(paddr) {
                Some(d) => self.inner.host.add_addr(pid, d),
                None => warn!(peer = %pid, "peer address requires an external lookup"),
            }
            // send all logs to the new replicator
            for lg in &updated.logs {
                if let Err(err) = self
                    .push_log_to(pid, id, lg, Some(info.key.service()))
                    .await
                {
                    // roll back the address change for this log only
                    if let Some(orig) = managed.iter().find(|m| m.id == lg.id) {
                        if let Err(rb) =
                            self.inner.store.set_addrs(&id, &orig.id, orig.addrs.clone())
                        {
                            error!("rolling back log address change failed: {rb}");
                        }
                    }
                    return Err(err);
                }
            }
        }

        // announce the updated managed logs to every peer involved
        let mut addrs = Vec::new();
        for lg in &updated.logs {
            addrs.extend(lg.addrs.iter().cloned());
        }
        let peers = self.unique_peers(&addrs);
        let futs = peers.into_iter().map(|peer| {
            let net = self.clone();
            let managed = managed.clone();
            async move {
                for lg in &managed {
                    if let Err(err) = net.push_log_to(peer, id, lg, None).await {
                        error!(log = %lg.id, peer = %peer, "pushing log failed: {err:#}");
                    }
                }
            }
        });
        futures::future::join_all(futs).await;
        Ok(pid)
    }

    /// Authors a new record carrying `payload` on the local log.
    pub async fn create_record(
        &self,
        id: ThreadId,
        payload: Bytes,
        opts: ThreadOptions,
    ) -> Result<ThreadRecord> {
        let identity = self
            .validate(&id, opts.token.as_ref(), false)?
            .unwrap_or_else(|| self.inner.host.keypair().public());
        let (connector, authorized) = self.connector_protected(&id, opts.app_token.as_ref());
        if !authorized {
            return Err(Error::ThreadInUse);
        }
        if let Some(con) = &connector {
            con.validate_net_record_body(&payload, &identity).await?;
        }

        let lg = self.get_or_create_log(&id, &identity)?;
        let priv_key = lg.priv_key.clone().ok_or(Error::PrivateKeyRequired)?;
        let service_key = self.inner.store.service_key(&id)?;
        let read_key = self
            .inner
            .store
            .read_key(&id)?
            .ok_or(Error::ReadKeyRequired)?;

        let tr = {
            let _guard = self.inner.semaphores.acquire(thread_update(&id)).await?;
            let head = self.inner.store.heads(&id, &lg.id)?;
            let event = Event::create(&payload, &read_key, &service_key)?;
            self.inner.blocks.put_many(vec![
                event.block().clone(),
                event.header_block().clone(),
                event.body_block().clone(),
            ])?;
            let record = Record::create(event, head, &priv_key, &service_key)?;
            self.inner.store.set_head(&id, &lg.id, record.cid())?;
            self.inner.blocks.put(record.envelope().clone())?;
            let tr = ThreadRecord {
                record,
                thread_id: id,
                log_id: lg.id,
            };
            debug!(
                record = %tr.record.cid(),
                thread = %id.fmt_short(),
                log = %lg.id,
                "created record"
            );
            self.inner
                .bus
                .send_with_timeout(tr.clone(), self.inner.config.notify_timeout)
                .await?;
            tr
        };
        self.push_record(id, lg.id, &tr.record).await;
        Ok(tr)
    }

    /// Ingests a record received out-of-band for a known log: dedupes on
    /// the block store, verifies the signature and fans out to peers.
    pub async fn add_record(
        &self,
        id: ThreadId,
        lid: PeerId,
        rec: Record,
        opts: ThreadOptions,
    ) -> Result<()> {
        self.validate(&id, opts.token.as_ref(), false)?;
        self.add_record_inner(id, lid, rec).await
    }

    pub(crate) async fn add_record_inner(
        &self,
        id: ThreadId,
        lid: PeerId,
        rec: Record,
    ) -> Result<()> {
        let log_key = self.inner.store.pub_key(&id, &lid)?;
        if self.is_known(&rec.cid())? {
            return Ok(());
        }
        rec.verify(&log_key)?;
        self.put_records(id, lid, vec![rec.clone()]).await?;
        self.push_record(id, lid, &rec).await;
        Ok(())
    }

    /// Loads a record from the block store; the service-key is required.
    pub fn get_record(&self, id: &ThreadId, rid: Cid, opts: ThreadOptions) -> Result<Record> {
        self.validate(id, opts.token.as_ref(), true)?;
        self.get_record_inner(id, rid)
    }

    fn get_record_inner(&self, id: &ThreadId, rid: Cid) -> Result<Record> {
        let service_key = self.inner.store.service_key(id)?;
        codec::get_record(&*self.inner.blocks, rid, &service_key)
    }

    /// Adds a single existing record; see [`Net::put_records`].
    pub async fn put_record(&self, id: ThreadId, lid: PeerId, rec: Record) -> Result<()> {
        id.validate()?;
        self.put_records(id, lid, vec![rec]).await
    }

    /// The record-ingestion pipeline: validates, gap-fills, persists and
    /// broadcasts a chain of records for one log.
    ///
    /// Heads advance record-by-record, so partial success of a sub-chain is
    /// possible; the first failing record aborts the remainder. Downstream
    /// reducers must therefore be idempotent.
    pub async fn put_records(&self, tid: ThreadId, lid: PeerId, recs: Vec<Record>) -> Result<()> {
        let (mut chain, head) = self
            .load_records(tid, lid, recs)
            .await
            .map_err(|err| Error::Other(anyhow::anyhow!("loading records failed: {err}")))?;
        if chain.is_empty() {
            return Ok(());
        }

        let _guard = self.inner.semaphores.acquire(thread_update(&tid)).await?;

        // the head may have moved while we were validating
        let current = self.current_head(&tid, &lid)?;
        if current != head {
            match chain.iter().position(|tr| Some(tr.record.cid()) == current) {
                // fast-forward past the already-processed prefix
                Some(i) => {
                    chain.drain(..=i);
                }
                // another worker absorbed a superset of this chain
                None => return Ok(()),
            }
        }

        let connector = self.connector(&tid);
        for tr in chain {
            self.inner.store.set_head(&tid, &lid, tr.record.cid())?;

            if let Some(con) = &connector {
                // The head stays advanced if handling fails: at-least-once
                // delivery for reducers, which must be idempotent.
                con.handle_net_record(&tr)
                    .await
                    .map_err(|err| Error::Other(anyhow::anyhow!("handling record failed: {err}")))?;
            }

            // the envelope marks the record as fully processed
            self.inner.blocks.put(tr.record.envelope().clone())?;

            self.inner
                .bus
                .send_with_timeout(tr, self.inner.config.notify_timeout)
                .await?;
        }
        Ok(())
    }

    /// Loads, validates and caches all records between the last provided
    /// one and the current head. Returns the chain (oldest first) and the
    /// head observed before any locking.
    async fn load_records(
        &self,
        tid: ThreadId,
        lid: PeerId,
        recs: Vec<Record>,
    ) -> Result<(Vec<ThreadRecord>, Option<Cid>)> {
        let Some(last) = recs.last() else {
            return Err(Error::Other(anyhow::anyhow!(
                "cannot load an empty record chain"
            )));
        };
        // the whole chain has been processed before
        if self.is_known(&last.cid())? {
            return Ok((Vec::new(), None));
        }

        let head = self.current_head(&tid, &lid)?;

        // walk the input backwards until the current head
        let mut chain: Vec<Record> = Vec::with_capacity(recs.len());
        let mut complete = false;
        for next in recs.iter().rev() {
            if Some(next.cid()) == head {
                complete = true;
                break;
            }
            chain.push(next.clone());
        }

        if !complete {
            // bridge the gap between the oldest provided record and the head
            let mut cursor = chain.last().and_then(|r| r.prev());
            while let Some(c) = cursor {
                if Some(c) == head {
                    break;
                }
                let r = self.get_record_inner(&tid, c)?;
                cursor = r.prev();
                chain.push(r);
            }
        }

        if chain.is_empty() {
            return Ok((Vec::new(), head));
        }

        let connector = self.connector(&tid);
        // the connector's thread snapshot carries the key material
        let read_key = connector
            .as_ref()
            .and_then(|con| con.thread().key.read().cloned());

        let mut out = Vec::with_capacity(chain.len());
        for r in chain.iter().rev() {
            let event = match r.event() {
                Some(event) => event.clone(),
                None => Event::from_store(&*self.inner.blocks, r.block_cid())?,
            };

            if let (Some(con), Some(read_key)) = (&connector, &read_key) {
                let body = event.body(read_key)?;
                let identity = r.pub_key()?;
                con.validate_net_record_body(&body, &identity).await?;
            }

            // internal blocks are stored here; the envelope is added by the
            // caller only after successful processing
            self.inner.blocks.put_many(vec![
                event.block().clone(),
                event.header_block().clone(),
                event.body_block().clone(),
            ])?;

            out.push(ThreadRecord {
                record: r.clone(),
                thread_id: tid,
                log_id: lid,
            });
        }
        Ok((out, head))
    }

    /// Subscribes to committed records; an empty filter selects all
    /// threads. The returned channel closes when the engine shuts down.
    pub fn subscribe(&self, filter: impl IntoIterator<Item = ThreadId>) -> flume::Receiver<ThreadRecord> {
        let filter: HashSet<ThreadId> = filter.into_iter().collect();
        let listener = self.inner.bus.listen();
        // rendezvous channel: a slow subscriber backs up into the bus
        // buffer and ultimately fails the publishing batch
        let (tx, rx) = flume::bounded(0);
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    rec = listener.recv_async() => {
                        let Ok(rec) = rec else { break };
                        if !filter.is_empty() && !filter.contains(&rec.thread_id) {
                            continue;
                        }
                        if tx.send_async(rec).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        rx
    }

    /// Registers `app` as the exclusive connector of the thread.
    pub fn connect_app(&self, app: Arc<dyn App>, id: ThreadId) -> Result<Arc<Connector>> {
        id.validate()?;
        let info = self.get_thread_with_addrs(&id)?;
        let mut connectors = self.inner.connectors.write();
        if connectors.contains_key(&id) {
            return Err(Error::ThreadInUse);
        }
        let con = Arc::new(Connector::new(app, info));
        connectors.insert(id, con.clone());
        Ok(con)
    }

    /// Validates a thread id and, when present, an access token.
    ///
    /// ACL enforcement against `read_only` is not implemented; the hook
    /// only authenticates the token and recovers the identity key.
    pub fn validate(
        &self,
        id: &ThreadId,
        token: Option<&Token>,
        _read_only: bool,
    ) -> Result<Option<PublicKey>> {
        id.validate()?;
        token
            .map(|t| t.validate(&self.inner.host.keypair().public()))
            .transpose()
    }

    // ---- internals ----------------------------------------------------

    fn connector(&self, id: &ThreadId) -> Option<Arc<Connector>> {
        self.inner.connectors.read().get(id).cloned()
    }

    /// Returns the connector tied to the thread, if any, and whether the
    /// presented capability authorizes the caller.
    fn connector_protected(
        &self,
        id: &ThreadId,
        token: Option<&AppToken>,
    ) -> (Option<Arc<Connector>>, bool) {
        match self.connector(id) {
            None => (None, true),
            Some(con) => {
                if token.is_some_and(|t| *t == con.token()) {
                    (Some(con), true)
                } else {
                    (None, false)
                }
            }
        }
    }

    fn get_thread_with_addrs(&self, id: &ThreadId) -> Result<ThreadInfo> {
        let mut info = self.inner.store.get_thread(id)?;
        let peer = self.inner.host.id();
        info.addrs = self
            .inner
            .host
            .addrs()
            .into_iter()
            .map(|a| ThreadAddr::new(a.with(Protocol::P2p(peer)), *id))
            .collect();
        Ok(info)
    }

    pub(crate) fn is_known(&self, cid: &Cid) -> Result<bool> {
        self.inner.blocks.has(cid)
    }

    pub(crate) fn current_head(&self, tid: &ThreadId, lid: &PeerId) -> Result<Option<Cid>> {
        self.inner.store.heads(tid, lid)
    }

    fn identity_index(identity: &PublicKey) -> String {
        format!("identity:{}", hex::encode(identity.encode_protobuf()))
    }

    /// Creates a new log under the thread and indexes it for `identity`.
    fn create_log(
        &self,
        id: &ThreadId,
        key: Option<LogKey>,
        identity: &PublicKey,
    ) -> Result<LogInfo> {
        let mut info = match key {
            None => LogInfo::from_keypair(Keypair::generate_ed25519()),
            Some(LogKey::Private(keypair)) => LogInfo::from_keypair(keypair),
            Some(LogKey::Public(pub_key)) => LogInfo::from_public(pub_key),
        };
        info.addrs.push(p2p_addr(self.inner.host.id()));
        self.inner.store.add_log(id, info.clone())?;
        self.inner.store.put_bytes(
            id,
            &Self::identity_index(identity),
            Bytes::from(info.id.to_bytes()),
        )?;
        Ok(info)
    }

    /// Returns the identity's log under the thread, creating one if needed.
    fn get_or_create_log(&self, id: &ThreadId, identity: &PublicKey) -> Result<LogInfo> {
        match self.inner.store.get_bytes(id, &Self::identity_index(identity))? {
            Some(bytes) => {
                let lid = PeerId::from_bytes(&bytes).map_err(|_| Error::InvalidLogKey)?;
                self.inner.store.get_log(id, &lid)
            }
            None => {
                // an unindexed "own" log may predate the identity index
                if *identity == self.inner.host.keypair().public() {
                    if let Some(own) = self.inner.store.get_thread(id)?.first_managed_log() {
                        return Ok(own.clone());
                    }
                }
                self.create_log(id, None, identity)
            }
        }
    }

    /// Errors when a log with `key` already exists, or the identity
    /// already owns a managed log in the thread.
    fn ensure_unique_log(
        &self,
        id: &ThreadId,
        key: Option<&LogKey>,
        identity: &PublicKey,
    ) -> Result<()> {
        let thread = match self.inner.store.get_thread(id) {
            Err(Error::ThreadNotFound) => return Ok(()),
            other => other?,
        };
        let lid = match key {
            Some(LogKey::Private(keypair)) => keypair.public().to_peer_id(),
            Some(LogKey::Public(pub_key)) => pub_key.to_peer_id(),
            None => match self
                .inner
                .store
                .get_bytes(id, &Self::identity_index(identity))?
            {
                Some(bytes) => PeerId::from_bytes(&bytes).map_err(|_| Error::InvalidLogKey)?,
                None => {
                    if *identity == self.inner.host.keypair().public()
                        && thread.first_managed_log().is_some()
                    {
                        return Err(Error::ThreadExists);
                    }
                    return Ok(());
                }
            },
        };
        match self.inner.store.get_log(id, &lid) {
            Ok(_) => Err(Error::LogExists),
            Err(Error::LogNotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Creates unknown external logs with an empty head; merges addresses
    /// of logs already present. Serialized per thread.
    pub(crate) async fn create_external_logs_if_not_exist(
        &self,
        tid: ThreadId,
        logs: Vec<LogInfo>,
    ) -> Result<()> {
        let _guard = self.inner.semaphores.acquire(thread_update(&tid)).await?;
        for mut li in logs {
            match self.inner.store.get_log(&tid, &li.id) {
                Err(Error::LogNotFound) => {
                    li.head = None;
                    self.inner.store.add_log(&tid, li)?;
                }
                Ok(_) => {
                    self.inner.store.add_addrs(&tid, &li.id, li.addrs)?;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub(crate) async fn update_logs_from_peer(&self, peer: PeerId, tid: ThreadId) -> Result<()> {
        let logs = self.rpc_get_logs(peer, tid).await?;
        self.create_external_logs_if_not_exist(tid, logs).await
    }

    pub(crate) async fn update_records_from_peer(&self, peer: PeerId, tid: ThreadId) -> Result<()> {
        let (offsets, _) = self.thread_offsets(&tid)?;
        let recs = self
            .rpc_get_records(peer, tid, offsets, self.inner.config.max_pull_limit)
            .await?;
        for (lid, rs) in recs {
            if rs.is_empty() {
                continue;
            }
            self.put_records(tid, lid, rs).await?;
        }
        Ok(())
    }

    /// Per-log offsets (head if its block is known, otherwise none) and the
    /// unique dialable peers of all logs.
    pub(crate) fn thread_offsets(
        &self,
        tid: &ThreadId,
    ) -> Result<(Vec<(PeerId, Option<Cid>)>, Vec<PeerId>)> {
        let info = self.inner.store.get_thread(tid)?;
        let mut offsets = Vec::with_capacity(info.logs.len());
        let mut addrs = Vec::new();
        for lg in &info.logs {
            let known = match lg.head {
                Some(head) => self.is_known(&head)?,
                None => false,
            };
            offsets.push((lg.id, if known { lg.head } else { None }));
            addrs.extend(lg.addrs.iter().cloned());
        }
        let peers = self.unique_peers(&addrs);
        Ok((offsets, peers))
    }

    /// Distinct external peers named by the addresses, skipping the host.
    fn unique_peers(&self, addrs: &[Multiaddr]) -> Vec<PeerId> {
        let own = self.inner.host.id();
        let mut seen = HashSet::new();
        addrs
            .iter()
            .filter_map(peer_of)
            .filter(|p| *p != own && seen.insert(*p))
            .collect()
    }

    // ---- background loops ---------------------------------------------

    /// Round-robin walk over all threads feeding the thread packer, as
    /// described in the scheduler design.
    async fn run_pull_loop(self) {
        let cancel = self.inner.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.inner.config.pull_start_after) => {}
        }

        // the first cycle runs fast, then settles on the pull interval
        let mut interval = self.inner.config.initial_pull_interval;

        let (packer, packs) = ThreadPacker::new(
            cancel.clone(),
            self.inner.config.max_threads_exchanged,
            self.inner.config.exchange_compression_timeout,
        );
        tokio::spawn(self.clone().run_exchange_loop(packs));

        'cycle: loop {
            let threads = match self.inner.store.threads() {
                Ok(threads) => threads,
                Err(err) => {
                    error!("listing threads failed: {err}");
                    return;
                }
            };

            if threads.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {
                        interval = self.inner.config.pull_interval;
                        continue 'cycle;
                    }
                }
            }

            let period = interval / threads.len() as u32;
            let mut tick = tokio::time::interval(period.max(Duration::from_millis(1)));
            tick.tick().await; // consume the immediate first tick
            let mut idx = 0;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => {
                        let tid = threads[idx];
                        match self.thread_offsets(&tid) {
                            Ok((_, peers)) => {
                                for pid in peers {
                                    packer.add(pid, tid);
                                }
                            }
                            Err(err) if err.is_not_found() => {} // deleted mid-cycle
                            Err(err) => error!(thread = %tid.fmt_short(), "getting thread info failed: {err}"),
                        }
                        idx += 1;
                        if idx >= threads.len() {
                            interval = self.inner.config.pull_interval;
                            continue 'cycle;
                        }
                    }
                }
            }
        }
    }

    /// Consumes packed exchange assignments, one task per pack.
    async fn run_exchange_loop(self, packs: flume::Receiver<crate::queue::ThreadPack>) {
        while let Ok(pack) = packs.recv_async().await {
            let net = self.clone();
            tokio::spawn(async move {
                if let Err(err) = net.exchange_edges(pack.peer, &pack.threads).await {
                    error!(peer = %pack.peer, "exchange edges failed: {err:#}");
                }
            });
        }
    }

    /// Accepts inbound RPC streams until shutdown.
    async fn run_server(self) {
        let incoming = self.inner.host.incoming();
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                stream = incoming.recv_async() => {
                    let Ok((peer, stream)) = stream else { break };
                    let net = self.clone();
                    tokio::spawn(async move {
                        net.handle_stream(peer, stream).await;
                    });
                }
            }
        }
    }
}
