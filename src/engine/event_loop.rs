// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The network loop: one task owning the UDP socket, the timer wheel, the
//! peer table, every transaction and every in-flight request. All frame
//! and timer work happens here; anything slow leaves as a worker task and
//! returns as a message.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheScope, cache_lookup, cache_save, cache_save_hint},
    cfg::config::Config,
    crypto::{KeyCheck, KeyStore, OutboundKey, RollingSecret, check_key, open_body, seal_body},
    dialplan::Dialplan,
    engine::{
        EngineHandle, EngineMsg, MappingSummary, ResponseBody,
        sched::{Sched, TimerKind},
        transaction::{
            DEFAULT_RETRANS, DEFAULT_RETRANS_TIMER_MS, MIN_RETRANS_TIMER_MS, Transaction,
            TransactionSummary, TransactionTable, TransFlags, TxPacket,
        },
        workers::{
            self, Mapping, PrecacheTarget, QueryState, strip_duplicate_root,
        },
    },
    models::{
        Cause, CLEAR_PREFIX_LEN, Command, DUNDI_VERSION, Eid, FrameHeader, HEADER_LEN,
        HintFlags, IeBuilder, IeId, MAX_EID_STACK, MAX_PACKET_SIZE, ParsedIes, parse_ies,
        show::{FrameDir, show_frame},
    },
    peer::{Peer, PeerRegistry, has_permission},
    request::{
        EntityInfo, JobSpec, LookupJob, LookupMode, LookupReply, LookupResult, Request,
        RequestError, RequestSummary, avoid_crc32, merge_result, sort_results,
        ttl_budget_ms, MAX_RESULTS,
    },
    store::{FAMILY_CACHE, FAMILY_DPEERS, KvStore, Store},
};

const SECRET_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Settings distilled from the config at startup.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub local_eid: Eid,
    pub autokill_ms: u64,
    pub authdebug: bool,
    pub storehistory: bool,
    pub default_expiration: u32,
    pub identity: EntityInfo,
    pub ipaddr: String,
}

enum Wake {
    Cancelled,
    Msg(Option<Box<EngineMsg>>),
    Packet(usize, SocketAddr),
    SocketError(std::io::Error),
    Timer,
}

pub(crate) struct Core {
    socket: UdpSocket,
    rx: mpsc::Receiver<EngineMsg>,
    handle: EngineHandle,
    cancel: CancellationToken,
    settings: Settings,
    dialplan: Arc<dyn Dialplan>,
    store: Store,
    keystore: Option<KeyStore>,
    secret: RollingSecret,
    peers: PeerRegistry,
    trans: TransactionTable,
    requests: HashMap<u64, Request>,
    next_request: u64,
    mappings: Vec<Mapping>,
    sched: Sched,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: UdpSocket,
        rx: mpsc::Receiver<EngineMsg>,
        handle: EngineHandle,
        cancel: CancellationToken,
        config: &Config,
        local_eid: Eid,
        dialplan: Arc<dyn Dialplan>,
        store: Store,
    ) -> Self {
        let g = &config.general;
        let ipaddr = g.ipaddr.clone().unwrap_or_else(|| {
            socket
                .local_addr()
                .map(|a| a.ip().to_string())
                .unwrap_or_default()
        });
        let settings = Settings {
            local_eid,
            autokill_ms: g.autokill.timeout_ms() as u64,
            authdebug: g.authdebug,
            storehistory: g.storehistory,
            default_expiration: g.default_expiration,
            identity: EntityInfo {
                dept: g.department.clone(),
                org: g.organization.clone(),
                locality: g.locality.clone(),
                stateprov: g.stateprov.clone(),
                country: g.country.clone(),
                email: g.email.clone(),
                phone: g.phone.clone(),
                ipaddr: ipaddr.clone(),
            },
            ipaddr,
        };
        let keystore = g.keydir.as_ref().map(KeyStore::new);
        let secret = RollingSecret::load(&store, &g.secretpath);

        let mut mappings = Vec::new();
        for (dcontext, maps) in &config.mappings {
            for map in maps {
                mappings.push(Mapping::from_config(dcontext, map));
            }
        }

        let mut core = Core {
            socket,
            rx,
            handle,
            cancel,
            settings,
            dialplan,
            store,
            keystore,
            secret,
            peers: PeerRegistry::default(),
            trans: TransactionTable::default(),
            requests: HashMap::new(),
            next_request: 0,
            mappings,
            sched: Sched::default(),
        };

        for (eid, pcfg) in &config.peers {
            let mut peer = Peer::from_config(*eid, pcfg, core.settings.local_eid);
            if peer.dynamic
                && let Some(expire) = peer.hydrate_addr(&core.store)
            {
                let token = core.sched.schedule(
                    Duration::from_secs(expire + 10),
                    TimerKind::RegisterExpire { peer: *eid },
                );
                peer.register_expire_timer = Some(token);
            }
            core.peers.upsert(peer);
        }
        let eids = core.peers.eids();
        for eid in eids {
            let register = core.peers.get(&eid).is_some_and(|p| p.register);
            if register {
                let token = core
                    .sched
                    .schedule(Duration::from_secs(2), TimerKind::Register { peer: eid });
                if let Some(p) = core.peers.get_mut(&eid) {
                    p.register_timer = Some(token);
                }
            }
            core.qualify_peer(eid, true);
        }
        core.sched
            .schedule(SECRET_CHECK_INTERVAL, TimerKind::SecretCheck);
        core
    }

    pub(crate) async fn run(mut self) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE + 1];
        loop {
            let deadline = self.sched.next_deadline();
            let sleep_at =
                deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Cancelled,
                msg = self.rx.recv() => Wake::Msg(msg.map(Box::new)),
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((len, addr)) => Wake::Packet(len, addr),
                    Err(e) => Wake::SocketError(e),
                },
                _ = tokio::time::sleep_until(sleep_at.into()), if deadline.is_some() => {
                    Wake::Timer
                },
            };
            match wake {
                Wake::Cancelled => break,
                Wake::Msg(None) => break,
                Wake::Msg(Some(msg)) => self.handle_msg(*msg),
                Wake::Packet(len, addr) => {
                    let frame = buf[..len].to_vec();
                    self.handle_datagram(&frame, addr);
                },
                Wake::SocketError(e) => warn!("socket error: {e}"),
                Wake::Timer => {
                    for (_, kind) in self.sched.pop_due(Instant::now()) {
                        self.fire_timer(kind);
                    }
                },
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Engine messages

    fn handle_msg(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::Submit(job) => self.handle_submit(job),
            EngineMsg::SendPrecache {
                request,
                trans,
                generation,
                answers,
                hmd,
                expiration,
            } => self.handle_send_precache(request, trans, generation, answers, hmd, expiration),
            EngineMsg::WorkerDone {
                trans,
                generation,
                cmd,
                body,
            } => self.handle_worker_done(trans, generation, cmd, body),
            EngineMsg::Peers(reply) => {
                let _ = reply.send(self.peers.summaries());
            },
            EngineMsg::Transactions(reply) => {
                let _ = reply.send(
                    self.trans
                        .iter()
                        .map(|t| TransactionSummary {
                            addr: t.addr,
                            strans: t.id,
                            dtrans: t.dtrans,
                            oseqno: t.oseqno,
                            iseqno: t.iseqno,
                            aseqno: t.aseqno,
                        })
                        .collect(),
                );
            },
            EngineMsg::Requests(reply) => {
                let _ = reply.send(
                    self.requests
                        .values()
                        .filter(|r| r.mode == LookupMode::Lookup)
                        .map(|r| RequestSummary {
                            number: r.number.clone(),
                            dcontext: r.dcontext.clone(),
                            root_eid: r.root_eid,
                            max: MAX_RESULTS,
                            respcount: r.results.len(),
                        })
                        .collect(),
                );
            },
            EngineMsg::Mappings(reply) => {
                let _ = reply.send(
                    self.mappings
                        .iter()
                        .map(|m| MappingSummary {
                            dcontext: m.dcontext.clone(),
                            lcontext: m.lcontext.clone(),
                            weight: m.weight,
                            tech: m.tech,
                            dest: m.dest.clone(),
                            options: m.options.to_string(),
                        })
                        .collect(),
                );
            },
            EngineMsg::FlushCache(reply) => {
                self.store.deltree(FAMILY_CACHE, None);
                let _ = reply.send(());
            },
            EngineMsg::FlushStats(reply) => {
                for peer in self.peers.iter_mut() {
                    peer.history.clear();
                    peer.avgms = 0;
                }
                let _ = reply.send(());
            },
        }
    }

    fn handle_submit(&mut self, job: LookupJob) {
        let LookupJob { spec, done } = job;
        let root_eid = spec.avoid.last().copied().unwrap_or_else(Eid::zero);
        let crc32 = avoid_crc32(&spec.avoid);

        if spec.mode == LookupMode::Lookup {
            let dup = self.requests.values_mut().find(|r| {
                r.mode == LookupMode::Lookup
                    && r.dcontext.eq_ignore_ascii_case(&spec.dcontext)
                    && r.number.eq_ignore_ascii_case(&spec.number)
                    && (r.root_eid == root_eid || r.crc32 == crc32)
            });
            if let Some(pending) = dup {
                if !spec.avoid.is_empty() && pending.root_eid == root_eid {
                    debug!(
                        number = %spec.number,
                        context = %spec.dcontext,
                        root = %root_eid,
                        "duplicate request pending"
                    );
                    let _ = done.send(Err(RequestError::DuplicatePending));
                } else {
                    debug!(
                        number = %spec.number,
                        context = %spec.dcontext,
                        "waiting for similar request"
                    );
                    pending.waiters.push(LookupJob { spec, done });
                }
                return;
            }
            debug!(
                number = %spec.number,
                context = %spec.dcontext,
                root = %root_eid,
                crc = format!("{crc32:08x}"),
                "registering request"
            );
        }

        self.next_request += 1;
        let id = self.next_request;
        self.requests.insert(id, Request {
            id,
            number: spec.number.clone(),
            dcontext: spec.dcontext.clone(),
            mode: spec.mode,
            query_eid: spec.query_eid,
            root_eid,
            crc32,
            cbypass: spec.cbypass,
            results: Vec::new(),
            entity: None,
            respcount: 0,
            hmd: spec.hmd.clone(),
            expiration: spec.expiration,
            trans: Vec::new(),
            deadline_timer: None,
            done: Some(done),
            waiters: Vec::new(),
        });

        match spec.mode {
            LookupMode::Lookup | LookupMode::EidQuery => self.start_query_request(id, &spec),
            LookupMode::Precache => self.start_precache_request(id, &spec),
        }
    }

    fn start_query_request(&mut self, id: u64, spec: &JobSpec) {
        let mut order: u16 = if spec.mode == LookupMode::EidQuery { 9999 } else { 0 };
        if spec.mode == LookupMode::EidQuery {
            let mut foundcache = false;
            let mut skipped = 0u16;
            self.build_transactions(id, spec, order, &mut foundcache, &mut skipped);
        } else {
            loop {
                let mut foundcache = false;
                let mut skipped = 0u16;
                self.build_transactions(id, spec, order, &mut foundcache, &mut skipped);
                let has_trans = self
                    .requests
                    .get(&id)
                    .is_some_and(|r| !r.trans.is_empty());
                if skipped != 0 && !foundcache && !has_trans {
                    order = skipped;
                } else {
                    break;
                }
            }
        }

        if spec.ttl == 0 {
            // Nobody may be asked; report only that the hop budget is gone.
            if let Some(req) = self.requests.get_mut(&id) {
                req.hmd.flags.insert(HintFlags::TTL_EXPIRED);
                req.results.clear();
                req.expiration = spec.expiration;
                for tid in req.trans.clone() {
                    self.destroy_trans(tid, false);
                }
            }
            if self.requests.contains_key(&id) {
                self.complete_request(id);
            }
            return;
        }

        let no_trans = self
            .requests
            .get(&id)
            .is_none_or(|r| r.trans.is_empty());
        if no_trans {
            self.complete_request(id);
            return;
        }

        self.optimize_transactions(id, order);

        for tid in self
            .requests
            .get(&id)
            .map(|r| r.trans.clone())
            .unwrap_or_default()
        {
            match spec.mode {
                LookupMode::EidQuery => self.send_query(tid),
                _ => self.send_discover(tid),
            }
        }

        if let Some(req) = self.requests.get_mut(&id)
            && !req.trans.is_empty()
        {
            let token = self.sched.schedule(
                Duration::from_millis(ttl_budget_ms(spec.ttl)),
                TimerKind::RequestDeadline { request: id },
            );
            req.deadline_timer = Some(token);
        } else if self.requests.contains_key(&id) {
            self.complete_request(id);
        }
    }

    fn start_precache_request(&mut self, id: u64, spec: &JobSpec) {
        let maps: Vec<Mapping> = self
            .mappings
            .iter()
            .filter(|m| m.dcontext.eq_ignore_ascii_case(&spec.dcontext))
            .cloned()
            .collect();
        if maps.is_empty() {
            if let Some(mut req) = self.requests.remove(&id)
                && let Some(done) = req.done.take()
            {
                let _ = done.send(Err(RequestError::UnsupportedContext));
            }
            return;
        }

        let mut foundcache = false;
        let mut skipped = 0u16;
        self.build_transactions(id, spec, 0, &mut foundcache, &mut skipped);
        self.optimize_transactions(id, 0);

        let targets: Vec<PrecacheTarget> = self
            .requests
            .get(&id)
            .map(|r| r.trans.clone())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|tid| {
                self.trans.get(tid).map(|t| PrecacheTarget {
                    trans: tid,
                    generation: t.generation,
                    them_eid: t.them_eid,
                    us_eid: t.us_eid,
                    ttl: t.ttl,
                })
            })
            .collect();

        if targets.is_empty() {
            self.complete_request(id);
            return;
        }

        if let Some(req) = self.requests.get_mut(&id) {
            let token = self.sched.schedule(
                Duration::from_millis(ttl_budget_ms(spec.ttl)),
                TimerKind::RequestDeadline { request: id },
            );
            req.deadline_timer = Some(token);
        }

        tokio::spawn(workers::precache_push_worker(
            self.handle.clone(),
            self.dialplan.clone(),
            id,
            spec.number.clone(),
            spec.dcontext.clone(),
            maps,
            targets,
            self.secret.current().to_string(),
            self.settings.ipaddr.clone(),
        ));
    }

    /// Walks the peer table for one order class, consulting the cache
    /// first and appending transactions for eligible, reachable peers not
    /// on the avoid stack.
    fn build_transactions(
        &mut self,
        id: u64,
        spec: &JobSpec,
        order: u16,
        foundcache: &mut bool,
        skipped: &mut u16,
    ) {
        struct Candidate {
            eid: Eid,
            us_eid: Eid,
            order: u8,
            allowconnect: bool,
        }
        let precache_routes = spec.mode == LookupMode::Precache || spec.push_routes;
        let nocache = spec.cbypass || spec.mode == LookupMode::Precache;
        let candidates: Vec<Candidate> = self
            .peers
            .iter()
            .filter_map(|p| {
                let (pass, allowconnect) = if precache_routes {
                    (
                        has_permission(&p.permit, &spec.dcontext)
                            && p.pcmodel.contains(crate::peer::Model::OUTBOUND),
                        true,
                    )
                } else {
                    (
                        has_permission(&p.include, &spec.dcontext),
                        p.model.contains(crate::peer::Model::OUTBOUND),
                    )
                };
                if !pass || spec.skip == Some(p.eid) {
                    return None;
                }
                Some(Candidate {
                    eid: p.eid,
                    us_eid: p.us_eid,
                    order: p.order,
                    allowconnect,
                })
            })
            .collect();

        let store = self.store.clone();
        for c in candidates {
            if c.order as u16 > order {
                if *skipped == 0 || (c.order as u16) < *skipped {
                    *skipped = c.order as u16;
                }
                continue;
            }
            let mut found = false;
            if !nocache
                && let Some(req) = self.requests.get_mut(&id)
            {
                let scope = CacheScope {
                    number: &spec.number,
                    dcontext: &spec.dcontext,
                    root_eid: req.root_eid,
                    crc32: req.crc32,
                };
                found = cache_lookup(
                    &store,
                    &c.eid,
                    scope,
                    &mut req.results,
                    &mut req.hmd,
                    &mut req.expiration,
                );
            }
            if !found {
                let mut avoided = false;
                for (x, av) in spec.avoid.iter().enumerate() {
                    if *av == c.eid || *av == c.us_eid {
                        // A non-direct hop on the stack affects our answer.
                        if !spec.avoid_direct.get(x).copied().unwrap_or(false)
                            && let Some(req) = self.requests.get_mut(&id)
                        {
                            req.hmd.flags.remove(HintFlags::UNAFFECTED);
                        }
                        avoided = true;
                        break;
                    }
                }
                if c.allowconnect {
                    if !avoided && (!spec.block_empty || !c.us_eid.is_zero()) {
                        self.append_transaction(id, c.eid, spec.ttl, &spec.avoid);
                    } else {
                        debug!(peer = %c.eid, "avoiding peer in transaction");
                    }
                }
            }
            *foundcache |= found;
        }
    }

    fn append_transaction(&mut self, id: u64, peer_eid: Eid, ttl: u16, avoid: &[Eid]) {
        let Some(req) = self.requests.get(&id) else {
            return;
        };
        let reachable = self.peers.get(&peer_eid).is_some_and(Peer::reachable);
        if !reachable {
            return;
        }
        if req.number.is_empty() {
            debug!(peer = %peer_eid, context = %req.dcontext, "will query peer for entity");
        } else {
            debug!(peer = %peer_eid, number = %req.number, context = %req.dcontext,
                   "will query peer");
        }
        let Some(tid) = self.create_for_peer(peer_eid) else {
            return;
        };
        if let Some(t) = self.trans.get_mut(tid) {
            t.parent = Some(id);
            t.ttl = ttl;
            t.eids = avoid.iter().copied().take(MAX_EID_STACK).collect();
        }
        if let Some(req) = self.requests.get_mut(&id) {
            req.trans.push(tid);
        }
    }

    /// Trims needless hops out of the network: every reachable peer we
    /// could ask ourselves is pushed onto each transaction's stack so the
    /// receiver will not ask them again, keeping the true root at the
    /// bottom.
    fn optimize_transactions(&mut self, id: u64, order: u16) {
        let Some(req) = self.requests.get(&id) else {
            return;
        };
        let dcontext = req.dcontext.clone();
        let tids = req.trans.clone();
        let peer_list: Vec<(Eid, u8)> = self
            .peers
            .iter()
            .filter(|p| has_permission(&p.include, &dcontext))
            .map(|p| (p.eid, p.order))
            .collect();
        for tid in tids {
            let Some(t) = self.trans.get_mut(tid) else {
                continue;
            };
            let (tmp, mut needpush) = match t.eids.pop() {
                Some(root) => (root, true),
                None => (t.us_eid, false),
            };
            for (peid, porder) in &peer_list {
                if *peid == t.them_eid || (*porder as u16) > order || tmp == *peid {
                    continue;
                }
                if !t.eids.contains(peid)
                    && t.eids.len() < MAX_EID_STACK - usize::from(needpush)
                {
                    t.eids.push(*peid);
                    needpush = true;
                }
            }
            if needpush {
                t.eids.push(tmp);
            }
        }
    }

    fn send_discover(&mut self, tid: u16) {
        let Some(t) = self.trans.get(tid) else {
            return;
        };
        let Some(req) = t.parent.and_then(|rid| self.requests.get(&rid)) else {
            warn!("tried to discover a transaction with no parent");
            return;
        };
        let us_eid = t.us_eid;
        let eids = t.eids.clone();
        let ttl = t.ttl;
        let (number, dcontext, cbypass) =
            (req.number.clone(), req.dcontext.clone(), req.cbypass);
        let ied = (|| -> Result<IeBuilder> {
            let mut ied = IeBuilder::new();
            ied.short(IeId::Version, DUNDI_VERSION)?;
            if !us_eid.is_zero() {
                ied.eid(IeId::EidDirect, &us_eid)?;
            }
            for eid in &eids {
                self.append_eid_appropriately(&mut ied, &dcontext, eid, &us_eid)?;
            }
            ied.str(IeId::CalledNumber, &number)?;
            ied.str(IeId::CalledContext, &dcontext)?;
            ied.short(IeId::Ttl, ttl)?;
            if cbypass {
                ied.empty(IeId::CacheBypass)?;
            }
            Ok(ied)
        })();
        match ied {
            Ok(ied) => {
                self.arm_autokill(tid);
                self.send_frame(tid, Command::DpDiscover, false, Some(&ied));
            },
            Err(e) => warn!("dropping discover frame: {e}"),
        }
    }

    fn send_query(&mut self, tid: u16) {
        let Some(t) = self.trans.get(tid) else {
            return;
        };
        let Some(req) = t.parent.and_then(|rid| self.requests.get(&rid)) else {
            warn!("tried to query a transaction with no parent");
            return;
        };
        let us_eid = t.us_eid;
        let eids = t.eids.clone();
        let ttl = t.ttl;
        let dcontext = req.dcontext.clone();
        let query_eid = req.query_eid.unwrap_or_else(Eid::zero);
        let ied = (|| -> Result<IeBuilder> {
            let mut ied = IeBuilder::new();
            ied.short(IeId::Version, DUNDI_VERSION)?;
            if !us_eid.is_zero() {
                ied.eid(IeId::Eid, &us_eid)?;
            }
            for eid in &eids {
                ied.eid(IeId::Eid, eid)?;
            }
            ied.eid(IeId::ReqEid, &query_eid)?;
            ied.str(IeId::CalledContext, &dcontext)?;
            ied.short(IeId::Ttl, ttl)?;
            Ok(ied)
        })();
        match ied {
            Ok(ied) => {
                self.arm_autokill(tid);
                self.send_frame(tid, Command::EidQuery, false, Some(&ied));
            },
            Err(e) => warn!("dropping query frame: {e}"),
        }
    }

    /// Peers directly reachable through us are tagged EID_DIRECT so the
    /// receiver knows the hop does not taint its answer.
    fn append_eid_appropriately(
        &self,
        ied: &mut IeBuilder,
        dcontext: &str,
        eid: &Eid,
        us: &Eid,
    ) -> Result<()> {
        if eid == us {
            ied.eid(IeId::EidDirect, eid)?;
            return Ok(());
        }
        let direct = self
            .peers
            .get(eid)
            .is_some_and(|p| has_permission(&p.include, dcontext));
        ied.eid(if direct { IeId::EidDirect } else { IeId::Eid }, eid)?;
        Ok(())
    }

    fn handle_send_precache(
        &mut self,
        request: u64,
        tid: u16,
        generation: u64,
        answers: Vec<LookupResult>,
        hmd: crate::request::HintMeta,
        expiration: u32,
    ) {
        if self.trans.get_mut_gen(tid, generation).is_none() {
            return;
        }
        if answers.is_empty() {
            // Nothing to send.
            self.destroy_trans(tid, false);
            return;
        }
        if let Some(req) = self.requests.get_mut(&request) {
            req.respcount += answers.len();
            if expiration < req.expiration {
                req.expiration = expiration;
            }
        }
        let Some(t) = self.trans.get(tid) else {
            return;
        };
        let us_eid = t.us_eid;
        let eids = t.eids.clone();
        let ttl = t.ttl;
        let (number, dcontext) = match self.requests.get(&request) {
            Some(r) => (r.number.clone(), r.dcontext.clone()),
            None => return,
        };
        let ied = (|| -> Result<IeBuilder> {
            let mut ied = IeBuilder::new();
            ied.short(IeId::Version, DUNDI_VERSION)?;
            if !us_eid.is_zero() {
                ied.eid(IeId::Eid, &us_eid)?;
            }
            for eid in &eids {
                ied.eid(IeId::Eid, eid)?;
            }
            ied.str(IeId::CalledNumber, &number)?;
            ied.str(IeId::CalledContext, &dcontext)?;
            ied.short(IeId::Ttl, ttl)?;
            for a in &answers {
                ied.answer(&a.eid, a.tech.wire(), a.flags, a.weight, &a.dest)?;
            }
            ied.hint(hmd.flags, &hmd.exten)?;
            ied.short(IeId::Expiration, expiration.min(u16::MAX as u32) as u16)?;
            Ok(ied)
        })();
        match ied {
            Ok(ied) => {
                self.arm_autokill(tid);
                self.send_frame(tid, Command::PrecacheRq, false, Some(&ied));
            },
            Err(e) => warn!("dropping precache frame: {e}"),
        }
    }

    fn handle_worker_done(
        &mut self,
        tid: u16,
        generation: u64,
        cmd: Command,
        body: ResponseBody,
    ) {
        if self.trans.get_mut_gen(tid, generation).is_none() {
            debug!("our transaction went away");
            return;
        }
        let ied = (|| -> Result<IeBuilder> {
            let mut ied = IeBuilder::new();
            if let Some((cause, desc)) = &body.cause {
                ied.cause(*cause, desc)?;
            }
            for a in &body.answers {
                ied.answer(&a.eid, a.tech.wire(), a.flags, a.weight, &a.dest)?;
            }
            if let Some(entity) = &body.entity {
                ied.str(IeId::Department, &entity.dept)?;
                ied.str(IeId::Organization, &entity.org)?;
                ied.str(IeId::Locality, &entity.locality)?;
                ied.str(IeId::StateProv, &entity.stateprov)?;
                ied.str(IeId::Country, &entity.country)?;
                ied.str(IeId::Email, &entity.email)?;
                ied.str(IeId::Phone, &entity.phone)?;
                if !entity.ipaddr.is_empty() {
                    ied.str(IeId::IpAddr, &entity.ipaddr)?;
                }
            }
            if let Some(hmd) = &body.hmd {
                ied.hint(hmd.flags, &hmd.exten)?;
            }
            if let Some(expiration) = body.expiration {
                ied.short(IeId::Expiration, expiration)?;
            }
            Ok(ied)
        })();
        match ied {
            Ok(ied) => self.send_frame(tid, cmd, true, Some(&ied)),
            Err(e) => warn!("dropping response frame: {e}"),
        }
    }

    fn complete_request(&mut self, id: u64) {
        let Some(mut req) = self.requests.remove(&id) else {
            return;
        };
        if let Some(token) = req.deadline_timer.take() {
            self.sched.cancel(token);
        }
        let mut results = std::mem::take(&mut req.results);
        sort_results(&mut results);
        let reply = LookupReply {
            results,
            entity: req.entity.take(),
            hmd: std::mem::take(&mut req.hmd),
            expiration: req.expiration,
            found_answers: req.respcount,
        };
        if let Some(done) = req.done.take() {
            let _ = done.send(Ok(reply));
        }
        for waiter in req.waiters.drain(..) {
            self.handle_submit(waiter);
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Transactions

    fn create_for_peer(&mut self, peer_eid: Eid) -> Option<u16> {
        let peer = self.peers.get(&peer_eid)?;
        let addr = peer.addr?;
        let id = self.trans.alloc_id()?;
        let generation = self.trans.next_generation();
        let mut t = Transaction::new(id, generation, addr);
        if self.settings.storehistory {
            t.flags.insert(TransFlags::STORE_HIST);
        }
        Self::apply_peer(&mut t, peer, self.settings.autokill_ms);
        if !peer.outbound_key.as_ref().is_some_and(|k| k.sent_full) {
            t.flags.insert(TransFlags::SEND_FULLKEY);
        }
        self.trans.insert(t);
        Some(id)
    }

    fn create_inbound(&mut self, addr: SocketAddr, dtrans: u16) -> Option<u16> {
        let id = self.trans.alloc_id()?;
        let generation = self.trans.next_generation();
        let mut t = Transaction::new(id, generation, addr);
        t.dtrans = dtrans;
        if self.settings.storehistory {
            t.flags.insert(TransFlags::STORE_HIST);
        }
        t.autokill_ms = self.settings.autokill_ms;
        self.trans.insert(t);
        Some(id)
    }

    fn apply_peer(t: &mut Transaction, peer: &Peer, global_autokill_ms: u64) {
        if let Some(addr) = peer.addr {
            t.addr = addr;
        }
        t.us_eid = peer.us_eid;
        t.them_eid = peer.eid;
        if peer.inkey.is_some() {
            t.flags.insert(TransFlags::ENCRYPT);
        }
        if peer.maxms > 0 {
            t.autokill_ms = peer.maxms as u64;
            t.retrans_timer_ms = DEFAULT_RETRANS_TIMER_MS;
            if peer.lastms > 1 {
                t.retrans_timer_ms =
                    ((peer.lastms as u64) * 2).max(MIN_RETRANS_TIMER_MS);
            }
            t.retrans_timer_ms = t.retrans_timer_ms.min(DEFAULT_RETRANS_TIMER_MS);
        } else {
            t.autokill_ms = global_autokill_ms;
        }
    }

    fn arm_autokill(&mut self, tid: u16) {
        let Some(t) = self.trans.get(tid) else {
            return;
        };
        if t.autokill_ms == 0 {
            return;
        }
        let token = self.sched.schedule(
            Duration::from_millis(t.autokill_ms),
            TimerKind::Autokill {
                trans: tid,
                generation: t.generation,
            },
        );
        if let Some(t) = self.trans.get_mut(tid) {
            t.autokill_timer = Some(token);
        }
    }

    fn destroy_trans(&mut self, tid: u16, from_timeout: bool) {
        let Some(trans) = self.trans.remove(tid) else {
            return;
        };
        for p in &trans.packets {
            self.sched.cancel(p.retrans_timer);
        }
        if let Some(token) = trans.autokill_timer {
            self.sched.cancel(token);
        }

        if trans
            .flags
            .intersects(TransFlags::IS_REG | TransFlags::IS_QUAL | TransFlags::STORE_HIST)
        {
            let query = trans
                .parent
                .and_then(|rid| self.requests.get(&rid))
                .filter(|r| !r.number.is_empty())
                .map(|r| format!("{}@{}", r.number, r.dcontext));
            let elapsed_ms = trans.start.elapsed().as_millis().max(1) as u32;
            for peer in self.peers.iter_mut() {
                if peer.reg_trans == Some(tid) {
                    peer.reg_trans = None;
                }
                if peer.qual_trans == Some(tid) {
                    if from_timeout {
                        if peer.lastms > -1 {
                            warn!(peer = %peer.eid, "peer has become UNREACHABLE");
                        }
                        peer.lastms = -1;
                    } else if let Some(tx) = peer.qual_tx.take() {
                        let ms = (tx.elapsed().as_millis().max(1) as u32) as i32;
                        let maxms = peer.maxms as i32;
                        if ms < maxms {
                            if peer.lastms >= maxms || peer.lastms < 0 {
                                info!(peer = %peer.eid, ms, "peer has become REACHABLE");
                            }
                        } else if peer.lastms < maxms {
                            warn!(peer = %peer.eid, ms, "peer has become TOO LAGGED");
                        }
                        peer.lastms = ms;
                    }
                    peer.qual_trans = None;
                }
                if trans.flags.contains(TransFlags::STORE_HIST)
                    && peer.eid == trans.them_eid
                    && let Some(q) = &query
                {
                    peer.record_lookup(q.clone(), elapsed_ms);
                }
            }
        }

        if let Some(rid) = trans.parent {
            let drained = match self.requests.get_mut(&rid) {
                Some(req) => {
                    req.trans.retain(|t| *t != tid);
                    req.trans.is_empty()
                },
                None => false,
            };
            if drained {
                self.complete_request(rid);
            }
        }
    }

    fn ack_trans(&mut self, tid: u16, iseqno: u8) -> bool {
        let Some(t) = self.trans.get_mut(tid) else {
            return false;
        };
        let Some(idx) = t
            .packets
            .iter()
            .position(|p| p.oseqno.wrapping_add(1) == iseqno)
        else {
            return false;
        };
        let pkt = t.packets.remove(idx);
        t.lasttrans = Some(pkt.buf);
        let autokill = t.autokill_timer.take();
        self.sched.cancel(pkt.retrans_timer);
        if let Some(token) = autokill {
            self.sched.cancel(token);
        }
        true
    }

    // ────────────────────────────────────────────────────────────────────
    // Send path

    fn xmit(&self, buf: &[u8], addr: SocketAddr, dir: FrameDir) {
        show_frame(buf, dir, &addr);
        if let Err(e) = self.socket.try_send_to(buf, addr) {
            warn!(%addr, "failed to transmit: {e}");
        }
    }

    /// Sends a stateless INVALID for a frame that matches no transaction.
    /// An INVALID itself is never answered with another INVALID.
    fn send_reject(&self, hdr: &FrameHeader, addr: SocketAddr) {
        if Command::from_raw(hdr.command_raw()) == Some(Command::Invalid) {
            return;
        }
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&hdr.dtrans.get().to_be_bytes());
        buf.extend_from_slice(&hdr.strans.get().to_be_bytes());
        buf.push(hdr.oseqno);
        buf.push(hdr.iseqno);
        buf.push(Command::Invalid.raw());
        buf.push(0);
        self.xmit(&buf, addr, FrameDir::Tx);
    }

    fn send_ack(&mut self, tid: u16, final_: bool) {
        self.send_frame(tid, Command::Ack, final_, None);
    }

    fn send_frame(
        &mut self,
        tid: u16,
        cmd: Command,
        final_: bool,
        ied: Option<&IeBuilder>,
    ) {
        let Some(t) = self.trans.get_mut(tid) else {
            return;
        };
        let mut cmdresp = cmd.raw();
        if final_ {
            cmdresp |= crate::models::header::FLAG_FINAL;
            t.flags.insert(TransFlags::FINAL);
        }
        let mut datagram =
            Vec::with_capacity(HEADER_LEN + ied.map_or(0, IeBuilder::len));
        datagram.extend_from_slice(&t.id.to_be_bytes());
        datagram.extend_from_slice(&t.dtrans.to_be_bytes());
        datagram.push(t.iseqno);
        datagram.push(t.oseqno);
        datagram.push(cmdresp);
        datagram.push(0);
        if let Some(ied) = ied {
            datagram.extend_from_slice(ied.as_slice());
        }
        let pkt_oseqno = t.oseqno;
        if cmd != Command::Ack {
            t.oseqno = t.oseqno.wrapping_add(1);
        }
        t.aseqno = t.iseqno;
        let addr = t.addr;
        let generation = t.generation;
        let retrans_ms = t.retrans_timer_ms;
        let encrypt = t.flags.contains(TransFlags::ENCRYPT) && cmd.encryptable();

        let datagram = if encrypt {
            self.xmit_preview(&datagram, addr);
            match self.encrypt_frame(tid, &datagram) {
                Ok(d) => d,
                Err(e) => {
                    let them = self
                        .trans
                        .get(tid)
                        .map(|t| t.them_eid)
                        .unwrap_or_else(Eid::zero);
                    warn!(peer = %them, "failed to send packet: {e:#}");
                    return;
                },
            }
        } else {
            datagram
        };
        let datagram = Bytes::from(datagram);
        if cmd != Command::Ack {
            let token = self.sched.schedule(
                Duration::from_millis(retrans_ms),
                TimerKind::Retransmit {
                    trans: tid,
                    generation,
                    oseqno: pkt_oseqno,
                },
            );
            if let Some(t) = self.trans.get_mut(tid) {
                t.packets.push(TxPacket {
                    oseqno: pkt_oseqno,
                    buf: datagram.clone(),
                    retries_left: DEFAULT_RETRANS,
                    retrans_timer: token,
                });
            }
        }
        self.xmit(&datagram, addr, FrameDir::Tx);
    }

    fn xmit_preview(&self, buf: &[u8], addr: SocketAddr) {
        show_frame(buf, FrameDir::EncTx, &addr);
    }

    /// Re-frames a built datagram inside an ENCRYPT record. The first
    /// frame of a dialog carries the key reference: the full wrapped key
    /// and signature when the peer has never confirmed it (or after an
    /// ENCREJ), the key CRC otherwise.
    fn encrypt_frame(&mut self, tid: u16, datagram: &[u8]) -> Result<Vec<u8>> {
        let (first, us_eid, them_eid, send_fullkey) = {
            let t = self.trans.get(tid).context("transaction gone")?;
            (
                datagram[4] == 0 && datagram[5] == 0,
                t.us_eid,
                t.them_eid,
                t.flags.contains(TransFlags::SEND_FULLKEY),
            )
        };
        let mut ied = IeBuilder::new();
        if first {
            let keystore = self
                .keystore
                .as_ref()
                .context("no key directory configured")?
                .clone();
            let peer = self
                .peers
                .get_mut(&them_eid)
                .context("peer unknown for encrypted dialog")?;
            let (inkey, outkey) = match (&peer.inkey, &peer.outkey) {
                (Some(i), Some(o)) => (i.clone(), o.clone()),
                _ => bail!("peer has no key pair configured"),
            };
            if !peer.outbound_key.as_ref().is_some_and(|k| !k.expired()) {
                peer.outbound_key = Some(OutboundKey::establish(&keystore, &inkey, &outkey)?);
            }
            let send_full = send_fullkey
                || !peer.outbound_key.as_ref().is_some_and(|k| k.sent_full);
            let key = peer
                .outbound_key
                .as_mut()
                .context("no outbound key")?;
            ied.eid(IeId::Eid, &us_eid)?;
            if send_full {
                ied.raw(IeId::SharedKey, &key.wrapped[..128])?;
                ied.raw(IeId::Signature, &key.wrapped[128..])?;
            } else {
                ied.int(IeId::KeyCrc32, key.keycrc32)?;
            }
            let cipher = key.cipher.clone();
            key.sent_full = true;
            if let Some(t) = self.trans.get_mut(tid) {
                if send_full {
                    t.flags.insert(TransFlags::SEND_FULLKEY);
                }
                t.cipher = Some(cipher);
            }
        }
        let cipher = self
            .trans
            .get(tid)
            .and_then(|t| t.cipher.clone())
            .context("no session cipher for encrypted dialog")?;
        let (iv, ciphertext) = seal_body(&cipher, &datagram[CLEAR_PREFIX_LEN..])?;
        ied.encdata(&iv, &ciphertext)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ied.len());
        out.extend_from_slice(&datagram[..CLEAR_PREFIX_LEN]);
        out.push(Command::Encrypt.raw());
        out.push(0);
        out.extend_from_slice(ied.as_slice());
        Ok(out)
    }

    // ────────────────────────────────────────────────────────────────────
    // Inbound path

    fn handle_datagram(&mut self, buf: &[u8], addr: SocketAddr) {
        if buf.len() < HEADER_LEN {
            warn!(len = buf.len(), "midget packet received");
            return;
        }
        let Ok(hdr) = FrameHeader::parse(buf) else {
            return;
        };
        if hdr.reserved_bit() {
            // Reserved for future extension; drop silently.
            return;
        }
        let hdr = *hdr;
        show_frame(buf, FrameDir::Rx, &addr);
        self.handle_frame(&hdr, &buf[HEADER_LEN..], addr);
    }

    fn handle_frame(&mut self, hdr: &FrameHeader, payload: &[u8], addr: SocketAddr) {
        let cmd = Command::from_raw(hdr.command_raw());
        let tid = match self
            .trans
            .find_for_frame(addr, hdr.src_trans(), hdr.dst_trans())
        {
            Some(t) => t.id,
            None => {
                let opens = cmd.is_some_and(Command::opens_transaction);
                if opens && hdr.src_trans() != 0 {
                    match self.create_inbound(addr, hdr.src_trans()) {
                        Some(tid) => tid,
                        None => return,
                    }
                } else {
                    self.send_reject(hdr, addr);
                    return;
                }
            },
        };

        let (iseqno, oiseqno) = match self.trans.get(tid) {
            Some(t) => (t.iseqno, t.oiseqno),
            None => return,
        };

        if hdr.oseqno == iseqno {
            // Just what we were looking for. Anything but an ACK advances
            // the window.
            let acked = self.ack_trans(tid, hdr.iseqno);
            if acked
                && self
                    .trans
                    .get(tid)
                    .is_some_and(|t| t.flags.contains(TransFlags::FINAL))
            {
                self.destroy_trans(tid, false);
                return;
            }
            let mut effective_final = hdr.is_final();
            if cmd != Some(Command::Ack) {
                if let Some(t) = self.trans.get_mut(tid) {
                    t.oiseqno = t.iseqno;
                    t.iseqno = t.iseqno.wrapping_add(1);
                }
                effective_final = self.handle_command(tid, hdr, payload, false);
            }
            if let Some(t) = self.trans.get(tid) {
                if t.aseqno != t.iseqno {
                    self.send_ack(tid, effective_final);
                    if let Some(t) = self.trans.get_mut(tid) {
                        t.aseqno = t.iseqno;
                    }
                }
                if let Some(t) = self.trans.get_mut(tid) {
                    t.lasttrans = None;
                }
                if effective_final {
                    self.destroy_trans(tid, false);
                }
            }
        } else if hdr.oseqno == oiseqno {
            // A duplicate of the previous inbound frame: re-ACK without
            // reprocessing.
            self.send_ack(tid, false);
        } else {
            debug!("dropping packet out of window");
        }
    }

    /// Interprets one canonical command for a transaction, after optional
    /// decryption. Returns the effective FINAL disposition of the frame.
    fn handle_command(
        &mut self,
        tid: u16,
        hdr: &FrameHeader,
        payload: &[u8],
        encrypted: bool,
    ) -> bool {
        let final_ = hdr.is_final();
        let cmd = Command::from_raw(hdr.command_raw());
        let ies = match parse_ies(payload) {
            Ok(ies) => ies,
            Err(e) => {
                warn!("failed to parse information elements: {e}");
                return final_;
            },
        };
        debug!(
            cmd = cmd.map(Command::label).unwrap_or("?"),
            oseqno = hdr.oseqno,
            len = payload.len(),
            final_,
            "got canonical message"
        );

        match cmd {
            Some(c @ (Command::DpDiscover | Command::EidQuery | Command::PrecacheRq)) => {
                self.handle_inbound_query(tid, c, &ies, encrypted);
                final_
            },
            Some(Command::RegReq) => {
                self.handle_regreq(tid, &ies, encrypted);
                final_
            },
            Some(Command::DpResponse) => {
                self.handle_dpresponse(tid, &ies, encrypted, final_);
                final_
            },
            Some(Command::EidResponse) => {
                self.handle_eidresponse(tid, &ies, encrypted, final_);
                final_
            },
            Some(Command::RegResponse) => {
                self.handle_regresponse(tid, &ies, encrypted, final_);
                final_
            },
            Some(Command::Invalid) => {
                // Never replied to; the dialog is simply over.
                self.destroy_trans(tid, false);
                final_
            },
            Some(Command::Null | Command::PrecacheRp | Command::Cancel) => {
                if !final_ {
                    self.send_frame(tid, Command::Cancel, true, None);
                }
                final_
            },
            Some(Command::EncRej) => self.handle_encrej(tid, final_),
            Some(Command::Encrypt) => {
                self.handle_encrypt(tid, hdr, &ies, encrypted, final_)
            },
            Some(Command::Ack) => final_,
            Some(Command::Status) | Some(Command::Unknown) | None => {
                // A command we do not understand.
                if !final_ {
                    let mut ied = IeBuilder::new();
                    if ied.byte(IeId::UnknownCmd, hdr.command_raw()).is_ok() {
                        self.send_frame(
                            tid,
                            Command::Unknown,
                            hdr.oseqno == 0,
                            Some(&ied),
                        );
                    }
                }
                final_
            },
        }
    }

    fn handle_inbound_query(
        &mut self,
        tid: u16,
        cmd: Command,
        ies: &ParsedIes<'_>,
        encrypted: bool,
    ) {
        let resp = match cmd {
            Command::EidQuery => Command::EidResponse,
            Command::PrecacheRq => Command::PrecacheRp,
            _ => Command::DpResponse,
        };
        let first_eid = ies.eids.first().copied();
        let peer_info = first_eid.and_then(|e| self.peers.get(&e)).map(|p| {
            (
                p.eid,
                p.us_eid,
                p.inkey.is_some(),
                p.model,
                p.pcmodel,
                p.permit.clone(),
                p.include.clone(),
            )
        });
        let Some((peer_eid, us_eid, has_inkey, model, pcmodel, permit, include)) =
            peer_info
        else {
            if self.settings.authdebug {
                warn!(peer = ?first_eid, "unknown peer on inbound query");
            }
            self.send_cause(tid, resp, Cause::NoAuth, "");
            return;
        };
        if let Some(t) = self.trans.get_mut(tid) {
            t.us_eid = us_eid;
            t.them_eid = peer_eid;
        }
        let hasauth = if has_inkey { encrypted } else { true };
        if !hasauth {
            if self.settings.authdebug {
                warn!(peer = %peer_eid, "rejecting unencrypted inbound query");
            }
            self.send_cause(tid, resp, Cause::NoAuth, "Unencrypted responses not permitted");
            return;
        }
        let context = ies.called_context.unwrap_or("e164").to_string();

        if cmd == Command::EidQuery {
            self.answer_entity(tid, ies, &context);
            return;
        }

        let number = ies.called_number.unwrap_or("");
        if number.is_empty() {
            self.send_cause(tid, resp, Cause::General, "Invalid or missing number/entity");
            return;
        }
        let authorized = match cmd {
            Command::DpDiscover => {
                model.contains(crate::peer::Model::INBOUND)
                    && has_permission(&permit, &context)
            },
            Command::PrecacheRq => {
                pcmodel.contains(crate::peer::Model::INBOUND)
                    && has_permission(&include, &context)
            },
            _ => false,
        };
        if !authorized {
            if self.settings.authdebug {
                warn!(peer = %peer_eid, context = %context, "permission to context denied");
            }
            self.send_cause(tid, resp, Cause::NoAuth, "Permission to context denied");
            return;
        }
        let handled = match cmd {
            Command::DpDiscover => self.answer_query(tid, ies, &context),
            _ => self.prop_precache(tid, ies, &context),
        };
        if !handled {
            // There is no such context on this side.
            self.send_cause(tid, resp, Cause::NoAuth, "Unsupported DUNDI Context");
        }
    }

    fn query_state(&self, tid: u16, ies: &ParsedIes<'_>, context: &str) -> Option<QueryState> {
        let t = self.trans.get(tid)?;
        let mut eids = ies.eids.clone();
        let mut directs = ies.eid_direct.clone();
        strip_duplicate_root(&mut eids, &mut directs);
        Some(QueryState {
            trans: tid,
            generation: t.generation,
            us_eid: t.us_eid,
            called_context: context.to_string(),
            called_number: ies.called_number.unwrap_or("").to_string(),
            eids,
            directs,
            ttl: ies.ttl.map(|t| t.saturating_sub(1)).unwrap_or(0),
            cbypass: ies.cbypass,
            maps: Vec::new(),
            secret: self.secret.current().to_string(),
            ipaddr: self.settings.ipaddr.clone(),
        })
    }

    fn answer_query(&mut self, tid: u16, ies: &ParsedIes<'_>, context: &str) -> bool {
        let maps: Vec<Mapping> = self
            .mappings
            .iter()
            .filter(|m| m.dcontext.eq_ignore_ascii_case(context))
            .cloned()
            .collect();
        if maps.is_empty() {
            return false;
        }
        let Some(mut st) = self.query_state(tid, ies, context) else {
            return false;
        };
        st.maps = maps;
        debug!(number = %st.called_number, context = %context, "answering query");
        tokio::spawn(workers::lookup_worker(
            self.handle.clone(),
            self.dialplan.clone(),
            st,
        ));
        true
    }

    fn answer_entity(&mut self, tid: u16, ies: &ParsedIes<'_>, context: &str) {
        let Some(st) = self.query_state(tid, ies, context) else {
            return;
        };
        let reqeid = ies.reqeid.unwrap_or_else(Eid::zero);
        debug!(target_eid = %reqeid, context = %context, "answering entity query");
        tokio::spawn(workers::query_worker(
            self.handle.clone(),
            st,
            reqeid,
            self.settings.identity.clone(),
        ));
    }

    fn prop_precache(&mut self, tid: u16, ies: &ParsedIes<'_>, context: &str) -> bool {
        // Accept the pushed answers into our cache first, whether or not
        // we can forward them anywhere.
        let them_eid = self
            .trans
            .get(tid)
            .map(|t| t.them_eid)
            .unwrap_or_else(Eid::zero);
        let number = ies.called_number.unwrap_or("").to_string();
        let mut rows: Vec<LookupResult> = Vec::new();
        let mut hmd = crate::request::HintMeta::assume_dont_ask();
        for ans in &ies.answers {
            let row = LookupResult {
                flags: ans.flags,
                weight: ans.weight,
                tech: crate::models::Tech::from_wire(ans.protocol),
                dest: ans.dest.to_string(),
                eid: ans.eid,
                expiration: ies
                    .expiration
                    .map(|e| e as u32)
                    .unwrap_or(crate::cache::DEFAULT_CACHE_TIME),
            };
            if rows.len() >= MAX_RESULTS && !rows.iter().any(|r| {
                r.tech == row.tech && r.dest == row.dest
            }) {
                warn!(number = %number, context = %context,
                      "dropping excessive answers in precache");
                continue;
            }
            if merge_result(&mut rows, MAX_RESULTS, row) {
                hmd.flags.remove(HintFlags::DONT_ASK);
            }
        }
        let scope = CacheScope {
            number: &number,
            dcontext: context,
            root_eid: Eid::zero(),
            crc32: 0,
        };
        let expiration = ies.expiration.map(|e| e as i64).unwrap_or(-1);
        let store = self.store.clone();
        cache_save(&store, &them_eid, scope, &rows, 0, false, expiration, true);
        if let Some(hint) = &ies.hint {
            cache_save_hint(&store, &them_eid, scope, hint.flags, hint.exten, expiration);
        }

        let maps: Vec<Mapping> = self
            .mappings
            .iter()
            .filter(|m| m.dcontext.eq_ignore_ascii_case(context))
            .cloned()
            .collect();
        if maps.is_empty() {
            return false;
        }
        let Some(st) = self.query_state(tid, ies, context) else {
            return false;
        };
        debug!(number = %number, context = %context, "forwarding precache");
        tokio::spawn(workers::precache_worker(self.handle.clone(), st));
        true
    }

    fn handle_regreq(&mut self, tid: u16, ies: &ParsedIes<'_>, encrypted: bool) {
        let first_eid = ies.eids.first().copied();
        let peer_ok = first_eid
            .and_then(|e| self.peers.get(&e))
            .map(|p| (p.eid, p.us_eid, p.inkey.is_some(), p.dynamic));
        let Some((peer_eid, us_eid, has_inkey, dynamic)) = peer_ok else {
            self.send_cause(tid, Command::RegResponse, Cause::NoAuth, "");
            return;
        };
        if !dynamic {
            if self.settings.authdebug {
                warn!(peer = %peer_eid, "register request from non-dynamic peer");
            }
            self.send_cause(tid, Command::RegResponse, Cause::NoAuth, "");
            return;
        }
        if let Some(t) = self.trans.get_mut(tid) {
            t.us_eid = us_eid;
            t.them_eid = peer_eid;
        }
        let hasauth = if has_inkey { encrypted } else { true };
        if !hasauth {
            return;
        }
        let addr = match self.trans.get(tid) {
            Some(t) => t.addr,
            None => return,
        };
        let expire = self.settings.default_expiration;
        let token = self.sched.schedule(
            Duration::from_secs(expire as u64 + 10),
            TimerKind::RegisterExpire { peer: peer_eid },
        );
        let mut needqual = false;
        if let Some(peer) = self.peers.get_mut(&peer_eid) {
            if let Some(old) = peer.register_expire_timer.replace(token) {
                self.sched.cancel(old);
            }
            if peer.addr != Some(addr) {
                info!(peer = %peer_eid, %addr, "registered dynamic peer");
                needqual = true;
            }
            peer.addr = Some(addr);
        }
        self.store.put(
            FAMILY_DPEERS,
            &peer_eid.to_string(),
            &format!("{}:{}:{expire}", addr.ip(), addr.port()),
        );
        let mut ied = IeBuilder::new();
        if ied
            .short(IeId::Expiration, expire.min(u16::MAX as u32) as u16)
            .is_ok()
        {
            self.send_frame(tid, Command::RegResponse, true, Some(&ied));
        }
        if needqual {
            self.qualify_peer(peer_eid, true);
        }
    }

    fn handle_dpresponse(
        &mut self,
        tid: u16,
        ies: &ParsedIes<'_>,
        encrypted: bool,
        final_: bool,
    ) {
        let success = ies.cause.is_none_or(|c| c < 1);
        if !success {
            if self.settings.authdebug {
                warn!(
                    cause = ies.cause,
                    desc = ies.cause_desc.unwrap_or(""),
                    "negative response"
                );
            }
            if !final_ {
                self.send_frame(tid, Command::Cancel, true, None);
            }
            return;
        }
        debug!(answers = ies.answers.len(), "response looks like success");
        let authpass = match self.trans.get(tid) {
            Some(t) => {
                if t.flags.contains(TransFlags::ENCRYPT) {
                    encrypted
                } else {
                    true
                }
            },
            None => return,
        };
        if !authpass {
            return;
        }
        let (parent, them_eid) = match self.trans.get(tid) {
            Some(t) => (t.parent, t.them_eid),
            None => return,
        };
        if let Some(rid) = parent
            && let Some(req) = self.requests.get_mut(&rid)
            && req.mode != LookupMode::EidQuery
        {
            let start = req.results.len();
            for ans in &ies.answers {
                if req.results.len() >= MAX_RESULTS
                    && !req
                        .results
                        .iter()
                        .any(|r| r.tech.wire() == ans.protocol && r.dest == ans.dest)
                {
                    warn!(number = %req.number, context = %req.dcontext,
                          "dropping excessive answers to request");
                    continue;
                }
                let row = LookupResult {
                    flags: ans.flags,
                    weight: ans.weight,
                    tech: crate::models::Tech::from_wire(ans.protocol),
                    dest: ans.dest.to_string(),
                    eid: ans.eid,
                    expiration: ies
                        .expiration
                        .filter(|e| *e > 0)
                        .map(|e| e as u32)
                        .unwrap_or(crate::cache::DEFAULT_CACHE_TIME),
                };
                if merge_result(&mut req.results, MAX_RESULTS, row) {
                    req.hmd.flags.remove(HintFlags::DONT_ASK);
                }
            }
            let unaffected = ies
                .hint
                .is_some_and(|h| h.flags.contains(HintFlags::UNAFFECTED));
            let scope = CacheScope {
                number: &req.number.clone(),
                dcontext: &req.dcontext.clone(),
                root_eid: req.root_eid,
                crc32: req.crc32,
            };
            let expiration = ies.expiration.map(|e| e as i64).unwrap_or(-1);
            let store = self.store.clone();
            cache_save(
                &store, &them_eid, scope, &req.results, start, unaffected, expiration,
                false,
            );
            if let Some(hint) = &ies.hint {
                cache_save_hint(&store, &them_eid, scope, hint.flags, hint.exten, expiration);
                if hint.flags.contains(HintFlags::TTL_EXPIRED) {
                    req.hmd.flags.insert(HintFlags::TTL_EXPIRED);
                }
                if hint.flags.contains(HintFlags::DONT_ASK) {
                    if hint.exten.len() > req.hmd.exten.len() {
                        req.hmd.exten = hint.exten.to_string();
                    }
                } else {
                    req.hmd.flags.remove(HintFlags::DONT_ASK);
                }
            }
            if let Some(exp) = ies.expiration
                && exp > 0
                && req.expiration > exp as u32
            {
                req.expiration = exp as u32;
            }
        }
        // Close the dialog if the peer left it open.
        if !final_ {
            self.send_frame(tid, Command::Cancel, true, None);
        }
    }

    fn handle_eidresponse(
        &mut self,
        tid: u16,
        ies: &ParsedIes<'_>,
        encrypted: bool,
        final_: bool,
    ) {
        let success = ies.cause.is_none_or(|c| c < 1);
        if success {
            let authpass = match self.trans.get(tid) {
                Some(t) => {
                    if t.flags.contains(TransFlags::ENCRYPT) {
                        encrypted
                    } else {
                        true
                    }
                },
                None => return,
            };
            if authpass {
                let (parent, them_eid, addr) = match self.trans.get(tid) {
                    Some(t) => (t.parent, t.them_eid, t.addr),
                    None => return,
                };
                if let Some(rid) = parent
                    && let Some(req) = self.requests.get_mut(&rid)
                    && req.mode == LookupMode::EidQuery
                    && ies.q_org.is_some()
                {
                    if req.respcount == 0 {
                        req.respcount += 1;
                        let mut entity = EntityInfo {
                            dept: ies.q_dept.unwrap_or("").to_string(),
                            org: ies.q_org.unwrap_or("").to_string(),
                            locality: ies.q_locality.unwrap_or("").to_string(),
                            stateprov: ies.q_stateprov.unwrap_or("").to_string(),
                            country: ies.q_country.unwrap_or("").to_string(),
                            email: ies.q_email.unwrap_or("").to_string(),
                            phone: ies.q_phone.unwrap_or("").to_string(),
                            ipaddr: ies.q_ipaddr.unwrap_or("").to_string(),
                        };
                        if Some(them_eid) == req.query_eid {
                            // The entity itself answered; its address is
                            // authoritative.
                            entity.ipaddr = addr.ip().to_string();
                        }
                        req.entity = Some(entity);
                    }
                    if let Some(hint) = &ies.hint
                        && hint.flags.contains(HintFlags::TTL_EXPIRED)
                    {
                        req.hmd.flags.insert(HintFlags::TTL_EXPIRED);
                    }
                }
            }
        }
        if !final_ {
            self.send_frame(tid, Command::Cancel, true, None);
        }
    }

    fn handle_regresponse(
        &mut self,
        tid: u16,
        ies: &ParsedIes<'_>,
        encrypted: bool,
        final_: bool,
    ) {
        let success = ies.cause.is_none_or(|c| c < 1);
        if success {
            let (hasauth, us_eid, them_eid) = match self.trans.get(tid) {
                Some(t) => (
                    if t.flags.contains(TransFlags::ENCRYPT) {
                        encrypted
                    } else {
                        true
                    },
                    t.us_eid,
                    t.them_eid,
                ),
                None => return,
            };
            if !hasauth {
                warn!("response to register not authorized");
                if !final_ {
                    let mut ied = IeBuilder::new();
                    if ied
                        .cause(Cause::NoAuth, "Improper signature in answer")
                        .is_ok()
                    {
                        self.send_frame(tid, Command::Cancel, true, Some(&ied));
                    }
                }
                return;
            }
            info!(us = %us_eid, to = %them_eid, "registered");
        } else if self.settings.authdebug {
            warn!(
                cause = ies.cause,
                desc = ies.cause_desc.unwrap_or(""),
                "registration refused"
            );
        }
        if !final_ {
            self.send_frame(tid, Command::Cancel, true, None);
        }
    }

    fn handle_encrej(&mut self, tid: u16, final_: bool) -> bool {
        let (gave_key, lasttrans, them_eid) = match self.trans.get(tid) {
            Some(t) => (
                t.flags.contains(TransFlags::SEND_FULLKEY),
                t.lasttrans.clone(),
                t.them_eid,
            ),
            None => return final_,
        };
        let key_material = self
            .peers
            .get(&them_eid)
            .and_then(|p| p.outbound_key.as_ref())
            .map(|k| k.wrapped);
        let (Some(lasttrans), Some(wrapped)) = (lasttrans, key_material) else {
            // No really, it's over at this point.
            if !final_ {
                self.send_frame(tid, Command::Cancel, true, None);
            }
            return final_;
        };
        if gave_key {
            // A full key was already rejected once; do not loop.
            if !final_ {
                self.send_frame(tid, Command::Cancel, true, None);
            }
            return final_;
        }
        if let Some(t) = self.trans.get_mut(tid) {
            t.flags.insert(TransFlags::SEND_FULLKEY);
        }
        if !final_ {
            return final_;
        }
        // Acknowledge the rejection, then rebuild the last transmission
        // with the full wrapped key on a fresh dialog.
        self.send_ack(tid, true);
        if let Some(t) = self.trans.get_mut(tid) {
            t.aseqno = t.iseqno;
        }
        let Some(new_id) = self.trans.alloc_id() else {
            return final_;
        };
        self.trans.rekey(tid, new_id);
        // Everything naming the old dialog follows it onto the new id.
        if let Some(rid) = self.trans.get(new_id).and_then(|t| t.parent)
            && let Some(req) = self.requests.get_mut(&rid)
        {
            for t in req.trans.iter_mut() {
                if *t == tid {
                    *t = new_id;
                }
            }
        }
        for peer in self.peers.iter_mut() {
            if peer.reg_trans == Some(tid) {
                peer.reg_trans = Some(new_id);
            }
        }
        let resend_final = FrameHeader::parse(&lasttrans)
            .map(|h| h.is_final())
            .unwrap_or(false);
        let rebuilt = (|| -> Result<IeBuilder> {
            let old = parse_ies(&lasttrans[HEADER_LEN..])
                .ok()
                .context("stored frame unparsable")?;
            let us_eid = self
                .trans
                .get(new_id)
                .map(|t| t.us_eid)
                .context("transaction gone")?;
            let mut ied = IeBuilder::new();
            ied.eid(IeId::Eid, &us_eid)?;
            ied.raw(IeId::SharedKey, &wrapped[..128])?;
            ied.raw(IeId::Signature, &wrapped[128..])?;
            if let Some(block) = &old.encblock {
                ied.encdata(&block.iv, block.data)?;
            }
            Ok(ied)
        })();
        match rebuilt {
            Ok(ied) => {
                self.send_frame(new_id, Command::Encrypt, resend_final, Some(&ied));
                if let Some(peer) = self.peers.get_mut(&them_eid)
                    && let Some(key) = peer.outbound_key.as_mut()
                {
                    key.sent_full = true;
                }
            },
            Err(e) => warn!("unable to rebuild encrypted frame: {e:#}"),
        }
        // The final bit was consumed here; the dialog lives on.
        false
    }

    fn handle_encrypt(
        &mut self,
        tid: u16,
        hdr: &FrameHeader,
        ies: &ParsedIes<'_>,
        encrypted: bool,
        final_: bool,
    ) -> bool {
        if !encrypted {
            let first_turn = self
                .trans
                .get(tid)
                .is_some_and(|t| t.iseqno == 1 && t.oseqno == 0);
            if first_turn && !self.install_session(tid, ies) {
                if !final_ {
                    self.send_frame(tid, Command::EncRej, true, None);
                }
                return final_;
            }
            let can_decrypt = self
                .trans
                .get(tid)
                .is_some_and(|t| t.flags.contains(TransFlags::ENCRYPT));
            if can_decrypt
                && let Some(block) = &ies.encblock
            {
                let cipher = self.trans.get(tid).and_then(|t| t.cipher.clone());
                if let Some(cipher) = cipher {
                    match open_body(&cipher, &block.iv, block.data) {
                        Ok(body) if body.len() >= 2 => {
                            let mut inner = Vec::with_capacity(
                                CLEAR_PREFIX_LEN + body.len(),
                            );
                            inner.extend_from_slice(&hdr.strans.get().to_be_bytes());
                            inner.extend_from_slice(&hdr.dtrans.get().to_be_bytes());
                            inner.push(hdr.iseqno);
                            inner.push(hdr.oseqno);
                            inner.extend_from_slice(&body);
                            let addr = self
                                .trans
                                .get(tid)
                                .map(|t| t.addr);
                            if let Ok(inner_hdr) = FrameHeader::parse(&inner) {
                                let inner_hdr = *inner_hdr;
                                if let Some(addr) = addr {
                                    show_frame(&inner, FrameDir::EncRx, &addr);
                                }
                                let inner_final = self.handle_command(
                                    tid,
                                    &inner_hdr,
                                    &inner[HEADER_LEN..],
                                    true,
                                );
                                // Carry the inner FINAL disposition back out.
                                return final_ || inner_final;
                            }
                        },
                        Ok(_) => debug!("decrypted frame too short"),
                        Err(e) => debug!("ouch, decrypt failed: {e}"),
                    }
                }
            }
        }
        if !final_ {
            if let Some(t) = self.trans.get_mut(tid) {
                t.flags.remove(TransFlags::ENCRYPT);
            }
            self.send_frame(tid, Command::EncRej, true, None);
        }
        final_
    }

    /// Validates the key reference on the opening encrypted turn and binds
    /// the negotiated session to the transaction.
    fn install_session(&mut self, tid: u16, ies: &ParsedIes<'_>) -> bool {
        let Some(keystore) = self.keystore.clone() else {
            return false;
        };
        let Some(peer_eid) = ies.eids.first().copied() else {
            return false;
        };
        if ies.keycrc32.is_none() && (ies.shared_key.is_none() || ies.signature.is_none())
        {
            return false;
        }
        let Some(peer) = self.peers.get_mut(&peer_eid) else {
            return false;
        };
        let (Some(inkey), Some(outkey)) = (peer.inkey.clone(), peer.outkey.clone())
        else {
            return false;
        };
        let check = check_key(
            peer.inbound_key.as_ref(),
            ies.shared_key,
            ies.signature,
            ies.keycrc32,
            &keystore,
            &inkey,
            &outkey,
            &peer_eid,
        );
        let cipher = match check {
            Ok(KeyCheck::Cached) => peer
                .inbound_key
                .as_ref()
                .map(|k| k.cipher.clone()),
            Ok(KeyCheck::Installed(key)) => {
                let cipher = key.cipher.clone();
                peer.inbound_key = Some(*key);
                Some(cipher)
            },
            Ok(KeyCheck::Reject) => None,
            Err(e) => {
                warn!(peer = %peer_eid, "key check failed: {e:#}");
                None
            },
        };
        let Some(cipher) = cipher else {
            if self.settings.authdebug {
                warn!(peer = %peer_eid, "rejecting encrypted dialog, key did not validate");
            }
            return false;
        };
        let (peer_snapshot, autokill) = {
            let Some(peer) = self.peers.get(&peer_eid) else {
                return false;
            };
            (
                (
                    peer.us_eid,
                    peer.eid,
                    peer.inkey.is_some(),
                    peer.maxms,
                    peer.lastms,
                ),
                self.settings.autokill_ms,
            )
        };
        if let Some(t) = self.trans.get_mut(tid) {
            let (us_eid, them_eid, has_inkey, maxms, lastms) = peer_snapshot;
            t.us_eid = us_eid;
            t.them_eid = them_eid;
            if has_inkey {
                t.flags.insert(TransFlags::ENCRYPT);
            }
            if maxms > 0 {
                t.autokill_ms = maxms as u64;
                t.retrans_timer_ms = DEFAULT_RETRANS_TIMER_MS;
                if lastms > 1 {
                    t.retrans_timer_ms =
                        ((lastms as u64) * 2).max(MIN_RETRANS_TIMER_MS);
                }
                t.retrans_timer_ms = t.retrans_timer_ms.min(DEFAULT_RETRANS_TIMER_MS);
            } else {
                t.autokill_ms = autokill;
            }
            t.cipher = Some(cipher);
        }
        true
    }

    fn send_cause(&mut self, tid: u16, resp: Command, cause: Cause, desc: &str) {
        let mut ied = IeBuilder::new();
        if ied.cause(cause, desc).is_ok() {
            self.send_frame(tid, resp, true, Some(&ied));
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Timers

    fn fire_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Retransmit {
                trans,
                generation,
                oseqno,
            } => self.fire_retransmit(trans, generation, oseqno),
            TimerKind::Autokill { trans, generation } => {
                if let Some(t) = self.trans.get_mut_gen(trans, generation) {
                    t.autokill_timer = None;
                    let them = t.them_eid;
                    warn!(peer = %them, "transaction took too long to ACK, destroying");
                    self.destroy_trans(trans, false);
                }
            },
            TimerKind::RequestDeadline { request } => {
                let tids = match self.requests.get_mut(&request) {
                    Some(req) => {
                        req.deadline_timer = None;
                        std::mem::take(&mut req.trans)
                    },
                    None => return,
                };
                for tid in tids {
                    if let Some(t) = self.trans.get_mut(tid) {
                        t.parent = None;
                        self.send_frame(tid, Command::Cancel, true, None);
                    }
                }
                self.complete_request(request);
            },
            TimerKind::Register { peer } => self.do_register(peer),
            TimerKind::RegisterExpire { peer } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    debug!(peer = %peer, "register expired");
                    p.register_expire_timer = None;
                    p.lastms = 0;
                    p.addr = None;
                }
            },
            TimerKind::Qualify { peer } => {
                if let Some(p) = self.peers.get_mut(&peer) {
                    p.qualify_timer = None;
                }
                self.qualify_peer(peer, false);
            },
            TimerKind::SecretCheck => {
                self.secret.check(&self.store);
                self.sched
                    .schedule(SECRET_CHECK_INTERVAL, TimerKind::SecretCheck);
            },
        }
    }

    fn fire_retransmit(&mut self, tid: u16, generation: u64, oseqno: u8) {
        let Some(t) = self.trans.get_mut_gen(tid, generation) else {
            return;
        };
        let Some(idx) = t.packets.iter().position(|p| p.oseqno == oseqno) else {
            return;
        };
        if t.packets[idx].retries_left == 0 {
            let quiet = t.flags.contains(TransFlags::IS_QUAL);
            let addr = t.addr;
            if !quiet {
                warn!(%addr, oseqno, call = tid, "max retries exceeded");
            }
            self.destroy_trans(tid, true);
            return;
        }
        t.packets[idx].retries_left -= 1;
        let buf = t.packets[idx].buf.clone();
        let addr = t.addr;
        let retrans_ms = t.retrans_timer_ms;
        let token = self.sched.schedule(
            Duration::from_millis(retrans_ms),
            TimerKind::Retransmit {
                trans: tid,
                generation,
                oseqno,
            },
        );
        if let Some(t) = self.trans.get_mut(tid)
            && let Some(pkt) = t.packets.iter_mut().find(|p| p.oseqno == oseqno)
        {
            pkt.retrans_timer = token;
        }
        self.xmit(&buf, addr, FrameDir::Tx);
    }

    fn do_register(&mut self, eid: Eid) {
        let Some(peer) = self.peers.get(&eid) else {
            return;
        };
        if !peer.register {
            return;
        }
        debug!(us = %peer.us_eid, to = %eid, "registering");
        let expire = self.settings.default_expiration;
        let token = self.sched.schedule(
            Duration::from_secs(expire as u64),
            TimerKind::Register { peer: eid },
        );
        let old_trans = {
            let Some(peer) = self.peers.get_mut(&eid) else {
                return;
            };
            peer.register_timer = Some(token);
            peer.reg_trans.take()
        };
        if let Some(old) = old_trans {
            self.destroy_trans(old, false);
        }
        let Some(tid) = self.create_for_peer(eid) else {
            debug!(peer = %eid, "unable to create registration transaction");
            return;
        };
        let us_eid = match self.trans.get_mut(tid) {
            Some(t) => {
                t.flags.insert(TransFlags::IS_REG);
                t.us_eid
            },
            None => return,
        };
        if let Some(peer) = self.peers.get_mut(&eid) {
            peer.reg_trans = Some(tid);
        }
        let ied = (|| -> Result<IeBuilder> {
            let mut ied = IeBuilder::new();
            ied.short(IeId::Version, DUNDI_VERSION)?;
            ied.eid(IeId::Eid, &us_eid)?;
            ied.short(IeId::Expiration, expire.min(u16::MAX as u32) as u16)?;
            Ok(ied)
        })();
        if let Ok(ied) = ied {
            self.send_frame(tid, Command::RegReq, false, Some(&ied));
        }
    }

    fn qualify_peer(&mut self, eid: Eid, schedonly: bool) {
        let old = {
            let Some(peer) = self.peers.get_mut(&eid) else {
                return;
            };
            if let Some(token) = peer.qualify_timer.take() {
                self.sched.cancel(token);
            }
            peer.qual_trans.take()
        };
        if let Some(old) = old {
            self.destroy_trans(old, false);
        }
        let (maxms, lastms) = match self.peers.get(&eid) {
            Some(p) => (p.maxms, p.lastms),
            None => return,
        };
        if maxms == 0 {
            return;
        }
        let when = if schedonly {
            Duration::from_secs(5)
        } else if lastms < 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(60)
        };
        let token = self.sched.schedule(when, TimerKind::Qualify { peer: eid });
        if let Some(peer) = self.peers.get_mut(&eid) {
            peer.qualify_timer = Some(token);
        }
        if schedonly {
            return;
        }
        let Some(tid) = self.create_for_peer(eid) else {
            return;
        };
        if let Some(t) = self.trans.get_mut(tid) {
            t.flags.insert(TransFlags::IS_QUAL);
        }
        if let Some(peer) = self.peers.get_mut(&eid) {
            peer.qual_trans = Some(tid);
            peer.qual_tx = Some(Instant::now());
        }
        self.send_frame(tid, Command::Null, true, None);
    }
}
