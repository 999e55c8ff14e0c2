//! RPC dispatch (inbound) and calls (outbound).
//!
//! Every exchange travels on a fresh host stream as one framed request and
//! one framed response; see [`proto`](super::proto) for the messages.
//! Inbound handlers never take the per-thread semaphore directly except
//! through [`Net::create_external_logs_if_not_exist`] and the record
//! pipeline, keeping the documented deadlock-avoidance rules.

use std::collections::{HashMap, VecDeque};

use cid::Cid;
use libp2p::PeerId;
use tracing::{debug, warn};

use crate::codec::{self, Record};
use crate::error::{Error, Result};
use crate::host::BiStream;
use crate::keys::{SymmetricKey, ThreadKey};
use crate::net::proto::{
    self, read_message, write_message, LogOffset, LogRecords, Request, Response, ThreadEdge,
    WireLog, WireRecord,
};
use crate::net::Net;
use crate::thread::{p2p_addr, LogInfo, ThreadId, ThreadInfo};

impl Net {
    // ---- inbound -------------------------------------------------------

    pub(crate) async fn handle_stream(&self, peer: PeerId, mut stream: BiStream) {
        let result = async {
            let request: Request = read_message(&mut stream.recv).await?;
            let response = match self.dispatch(peer, request).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(peer = %peer, "rpc handler failed: {err}");
                    Response::Error {
                        message: err.to_string(),
                    }
                }
            };
            write_message(&mut stream.send, &response).await
        }
        .await;
        if let Err(err) = result {
            debug!(peer = %peer, "stream failed: {err}");
        }
    }

    async fn dispatch(&self, peer: PeerId, request: Request) -> Result<Response> {
        match request {
            Request::GetLogs {
                thread,
                service_key,
            } => {
                self.check_service_key(&thread, &service_key)?;
                let info = self.inner.store.get_thread(&thread)?;
                debug!(thread = %thread.fmt_short(), peer = %peer, "sending {} logs", info.logs.len());
                Ok(Response::Logs {
                    logs: info.logs.iter().map(WireLog::from_info).collect(),
                })
            }
            Request::GetRecords {
                thread,
                service_key,
                offsets,
                limit,
            } => {
                self.check_service_key(&thread, &service_key)?;
                let info = self.inner.store.get_thread(&thread)?;
                self.serve_records(&info, offsets, limit as usize)
            }
            Request::PushLog {
                thread,
                log,
                service_key,
            } => {
                if matches!(self.inner.store.get_thread(&thread), Err(Error::ThreadNotFound)) {
                    // a service-key announcement lets a fresh replica join
                    let Some(sk) = service_key else {
                        return Err(Error::ThreadNotFound);
                    };
                    let key = ThreadKey::new(SymmetricKey::from_bytes(&sk)?, None);
                    self.inner
                        .store
                        .add_thread(ThreadInfo::new(thread, key))?;
                }
                let info = log.into_info()?;
                let lid = info.id;
                self.create_external_logs_if_not_exist(thread, vec![info])
                    .await?;
                debug!(thread = %thread.fmt_short(), log = %lid, peer = %peer, "received pushed log");
                let net = self.clone();
                self.inner.queue_get_records.call(peer, thread, move || async move {
                    net.update_records_from_peer(peer, thread).await?;
                    Ok(())
                });
                Ok(Response::Ok)
            }
            Request::PushRecord {
                thread,
                log,
                record,
            } => {
                let lid = PeerId::from_bytes(&log).map_err(|_| Error::InvalidLogKey)?;
                let service_key = self.inner.store.service_key(&thread)?;
                let rec = record.into_record(&service_key)?;

                if matches!(self.inner.store.get_log(&thread, &lid), Err(Error::LogNotFound)) {
                    // an unknown log announces itself through its records
                    let pub_key = rec.pub_key()?;
                    if pub_key.to_peer_id() != lid {
                        return Err(Error::InvalidLogKey);
                    }
                    let mut info = LogInfo::from_public(pub_key);
                    info.addrs.push(p2p_addr(peer));
                    self.create_external_logs_if_not_exist(thread, vec![info])
                        .await?;
                }
                self.add_record_inner(thread, lid, rec).await?;
                Ok(Response::Ok)
            }
            Request::ExchangeEdges { edges } => {
                let mut out = Vec::with_capacity(edges.len());
                for ThreadEdge { thread, edge } in edges {
                    match self.local_edge(&thread) {
                        Ok(local) => {
                            if local != edge {
                                self.schedule_pull(peer, thread);
                            }
                            out.push(ThreadEdge {
                                thread,
                                edge: local,
                            });
                        }
                        // threads we do not carry are left out of the reply
                        Err(err) if err.is_not_found() => {}
                        Err(err) => return Err(err),
                    }
                }
                Ok(Response::Edges { edges: out })
            }
        }
    }

    fn check_service_key(&self, id: &ThreadId, proof: &[u8]) -> Result<()> {
        let service_key = self.inner.store.service_key(id)?;
        if service_key.as_bytes().as_slice() != proof {
            return Err(Error::Unauthorized);
        }
        Ok(())
    }

    fn serve_records(
        &self,
        info: &ThreadInfo,
        offsets: Vec<LogOffset>,
        limit: usize,
    ) -> Result<Response> {
        let limit = limit.min(self.inner.config.max_pull_limit);
        let mut requested: HashMap<PeerId, Option<Cid>> = HashMap::new();
        for off in offsets {
            if let Ok(lid) = PeerId::from_bytes(&off.log) {
                requested.insert(lid, off.offset);
            }
        }
        let mut logs = Vec::with_capacity(info.logs.len());
        for lg in &info.logs {
            let offset = requested.get(&lg.id).copied().flatten();
            let records = self.get_local_records(&info.id, &lg.id, offset, limit)?;
            let mut wire = Vec::with_capacity(records.len());
            for rec in &records {
                wire.push(WireRecord::from_record(rec, &*self.inner.blocks)?);
            }
            logs.push(LogRecords {
                log: lg.id.to_bytes(),
                records: wire,
            });
        }
        Ok(Response::Records { logs })
    }

    /// Walks the log from its head back to `offset` (or genesis), returning
    /// at most `limit` records in chronological order. When the limit is
    /// reached first, the caller is responsible for the remaining walk.
    pub(crate) fn get_local_records(
        &self,
        tid: &ThreadId,
        lid: &PeerId,
        offset: Option<Cid>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        if let Some(off) = offset {
            // an offset we do not know about restarts the caller from scratch
            if !self.is_known(&off)? {
                return Ok(Vec::new());
            }
        }
        let lg = self.inner.store.get_log(tid, lid)?;
        let service_key = self.inner.store.service_key(tid)?;

        let mut records = VecDeque::new();
        let mut cursor = lg.head;
        while records.len() < limit {
            let Some(c) = cursor else { break };
            if Some(c) == offset {
                break;
            }
            // invariant: heads and their ancestry are always in the block store
            let rec = codec::get_record(&*self.inner.blocks, c, &service_key)?;
            cursor = rec.prev();
            records.push_front(rec);
        }
        Ok(records.into())
    }

    // ---- outbound ------------------------------------------------------

    pub(crate) async fn rpc_get_logs(&self, peer: PeerId, tid: ThreadId) -> Result<Vec<LogInfo>> {
        let service_key = self.inner.store.service_key(&tid)?;
        let request = Request::GetLogs {
            thread: tid,
            service_key: service_key.as_bytes().to_vec(),
        };
        match proto::rpc(&*self.inner.host, &peer, &request).await? {
            Response::Logs { logs } => {
                debug!(thread = %tid.fmt_short(), peer = %peer, "received {} logs", logs.len());
                logs.into_iter().map(WireLog::into_info).collect()
            }
            other => Err(unexpected_response(&other)),
        }
    }

    pub(crate) async fn rpc_get_records(
        &self,
        peer: PeerId,
        tid: ThreadId,
        offsets: Vec<(PeerId, Option<Cid>)>,
        limit: usize,
    ) -> Result<Vec<(PeerId, Vec<Record>)>> {
        let service_key = self.inner.store.service_key(&tid)?;
        let request = Request::GetRecords {
            thread: tid,
            service_key: service_key.as_bytes().to_vec(),
            offsets: offsets
                .into_iter()
                .map(|(log, offset)| LogOffset {
                    log: log.to_bytes(),
                    offset,
                })
                .collect(),
            limit: limit as u64,
        };
        match proto::rpc(&*self.inner.host, &peer, &request).await? {
            Response::Records { logs } => {
                let mut out = Vec::with_capacity(logs.len());
                for lr in logs {
                    let lid = PeerId::from_bytes(&lr.log).map_err(|_| Error::InvalidLogKey)?;
                    let records = lr
                        .records
                        .into_iter()
                        .map(|w| w.into_record(&service_key))
                        .collect::<Result<Vec<_>>>()?;
                    out.push((lid, records));
                }
                Ok(out)
            }
            other => Err(unexpected_response(&other)),
        }
    }

    /// Queries all peers in parallel; for each log the longest returned
    /// chain wins (shorter ones are its prefixes by chain linearity).
    pub(crate) async fn get_records_from_peers(
        &self,
        peers: &[PeerId],
        tid: ThreadId,
        offsets: Vec<(PeerId, Option<Cid>)>,
        limit: usize,
    ) -> HashMap<PeerId, Vec<Record>> {
        let futs = peers.iter().map(|peer| {
            let net = self.clone();
            let offsets = offsets.clone();
            let peer = *peer;
            async move { (peer, net.rpc_get_records(peer, tid, offsets, limit).await) }
        });
        let mut best: HashMap<PeerId, Vec<Record>> = HashMap::new();
        for (peer, result) in futures::future::join_all(futs).await {
            match result {
                Ok(logs) => {
                    for (lid, records) in logs {
                        let entry = best.entry(lid).or_default();
                        if records.len() > entry.len() {
                            *entry = records;
                        }
                    }
                }
                Err(err) => warn!(peer = %peer, thread = %tid.fmt_short(), "getting records failed: {err}"),
            }
        }
        best
    }

    pub(crate) async fn push_log_to(
        &self,
        peer: PeerId,
        tid: ThreadId,
        log: &LogInfo,
        service_key: Option<&SymmetricKey>,
    ) -> Result<()> {
        let request = Request::PushLog {
            thread: tid,
            log: WireLog::from_info(log),
            service_key: service_key.map(|k| k.as_bytes().to_vec()),
        };
        match proto::rpc(&*self.inner.host, &peer, &request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }

    pub(crate) async fn push_record_to(
        &self,
        peer: PeerId,
        tid: ThreadId,
        lid: PeerId,
        record: WireRecord,
    ) -> Result<()> {
        let request = Request::PushRecord {
            thread: tid,
            log: lid.to_bytes(),
            record,
        };
        match proto::rpc(&*self.inner.host, &peer, &request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Best-effort fan-out of a record to every peer involved in the
    /// thread; remote failures are logged, never surfaced.
    pub(crate) async fn push_record(&self, tid: ThreadId, lid: PeerId, rec: &Record) {
        let info = match self.inner.store.get_thread(&tid) {
            Ok(info) => info,
            Err(err) => {
                warn!(thread = %tid.fmt_short(), "pushing record: {err}");
                return;
            }
        };
        let mut addrs = Vec::new();
        for lg in &info.logs {
            addrs.extend(lg.addrs.iter().cloned());
        }
        let peers = self.unique_peers(&addrs);
        if peers.is_empty() {
            return;
        }
        let wire = match WireRecord::from_record(rec, &*self.inner.blocks) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(record = %rec.cid(), "hydrating record for push failed: {err}");
                return;
            }
        };
        let futs = peers.into_iter().map(|peer| {
            let net = self.clone();
            let wire = wire.clone();
            async move {
                if let Err(err) = net.push_record_to(peer, tid, lid, wire).await {
                    debug!(peer = %peer, "pushing record failed: {err}");
                }
            }
        });
        futures::future::join_all(futs).await;
    }

    /// Compares log-head edges with `peer` and schedules pulls for every
    /// divergent thread. The remote does the same with our edges.
    pub(crate) async fn exchange_edges(&self, peer: PeerId, threads: &[ThreadId]) -> Result<()> {
        let mut edges = Vec::with_capacity(threads.len());
        for tid in threads {
            match self.local_edge(tid) {
                Ok(edge) => edges.push(ThreadEdge { thread: *tid, edge }),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        if edges.is_empty() {
            return Ok(());
        }
        let request = Request::ExchangeEdges {
            edges: edges.clone(),
        };
        match proto::rpc(&*self.inner.host, &peer, &request).await? {
            Response::Edges { edges: remote } => {
                let remote: HashMap<ThreadId, u64> =
                    remote.into_iter().map(|e| (e.thread, e.edge)).collect();
                for local in edges {
                    if let Some(r) = remote.get(&local.thread) {
                        if *r != local.edge {
                            self.schedule_pull(peer, local.thread);
                        }
                    }
                }
                Ok(())
            }
            other => Err(unexpected_response(&other)),
        }
    }

    /// Order-independent hash of the thread's current log heads.
    pub(crate) fn local_edge(&self, tid: &ThreadId) -> Result<u64> {
        let info = self.inner.store.get_thread(tid)?;
        let heads: Vec<_> = info.logs.iter().map(|lg| (lg.id, lg.head)).collect();
        Ok(proto::logs_edge(&heads))
    }

    fn schedule_pull(&self, peer: PeerId, tid: ThreadId) {
        let net = self.clone();
        self.inner.queue_get_records.call(peer, tid, move || async move {
            net.update_records_from_peer(peer, tid).await?;
            Ok(())
        });
    }
}

fn unexpected_response(res: &Response) -> Error {
    Error::Other(anyhow::anyhow!("unexpected response: {res:?}"))
}
