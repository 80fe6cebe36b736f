// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The in-memory peer table: one record per remote entity, holding its
//! address, keys, permission lists, traffic models and liveness state.
//! The table is owned by the network loop; other tasks only ever see
//! snapshots.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use bitflags::bitflags;
use tracing::debug;

use crate::{
    cfg::{config::PeerConfig, enums::ModelKind},
    crypto::{InboundKey, OutboundKey},
    models::Eid,
    store::{FAMILY_DPEERS, KvStore, Store},
};

/// Latency ceiling applied when qualification is enabled without an
/// explicit limit.
pub const DEFAULT_MAXMS: u32 = 2000;

/// Number of recent lookups kept in a peer's timing history.
pub const TIMING_HISTORY: usize = 10;

bitflags! {
    /// Direction bits of a peer relationship.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Model: u8 {
        const INBOUND  = 1 << 0;
        const OUTBOUND = 1 << 1;
    }
}

impl From<ModelKind> for Model {
    fn from(kind: ModelKind) -> Self {
        match kind {
            ModelKind::None => Model::empty(),
            ModelKind::Inbound => Model::INBOUND,
            ModelKind::Outbound => Model::OUTBOUND,
            ModelKind::Symmetric => Model::INBOUND | Model::OUTBOUND,
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match (self.contains(Model::INBOUND), self.contains(Model::OUTBOUND)) {
            (true, true) => "Symmetric",
            (true, false) => "Inbound",
            (false, true) => "Outbound",
            (false, false) => "None",
        })
    }
}

/// One entry of an ordered permission list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub allow: bool,
    pub name: String,
}

impl Permission {
    /// Parses the config notation: a leading `!` denies.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('!') {
            Some(name) => Permission {
                allow: false,
                name: name.to_string(),
            },
            None => Permission {
                allow: true,
                name: raw.to_string(),
            },
        }
    }
}

/// Evaluates an ordered permission list for a context. The last matching
/// entry wins and `all` matches anything; an empty list denies.
pub fn has_permission(list: &[Permission], context: &str) -> bool {
    let mut res = false;
    for p in list {
        if p.name.eq_ignore_ascii_case("all") || p.name.eq_ignore_ascii_case(context) {
            res = p.allow;
        }
    }
    res
}

/// A remote peer. Scheduler tokens reference the network loop's timer
/// wheel; stale tokens are ignored when they fire.
#[derive(Debug)]
pub struct Peer {
    pub eid: Eid,
    pub addr: Option<SocketAddr>,
    pub us_eid: Eid,
    pub inkey: Option<String>,
    pub outkey: Option<String>,
    pub permit: Vec<Permission>,
    pub include: Vec<Permission>,
    pub model: Model,
    pub pcmodel: Model,
    pub order: u8,
    pub dynamic: bool,
    pub register: bool,
    /// 0 disables qualification.
    pub maxms: u32,
    /// Last measured round trip; negative means unreachable, 0 unknown.
    pub lastms: i32,

    /// Session key we generated for them.
    pub outbound_key: Option<OutboundKey>,
    /// Session key they negotiated towards us.
    pub inbound_key: Option<InboundKey>,

    pub register_timer: Option<u64>,
    pub register_expire_timer: Option<u64>,
    pub qualify_timer: Option<u64>,
    pub reg_trans: Option<u16>,
    pub qual_trans: Option<u16>,
    pub qual_tx: Option<Instant>,

    /// Ring of recent `(query, elapsed_ms)` samples, newest first.
    pub history: Vec<(String, u32)>,
    pub avgms: u32,
}

impl Peer {
    pub fn from_config(eid: Eid, cfg: &PeerConfig, us: Eid) -> Self {
        let addr = cfg.host.resolve().unwrap_or_else(|e| {
            debug!(peer = %eid, "{e:#}");
            None
        });
        Peer {
            eid,
            addr,
            us_eid: cfg.ustothem.unwrap_or(us),
            inkey: cfg.inkey.clone(),
            outkey: cfg.outkey.clone(),
            permit: cfg.permit.iter().map(|s| Permission::parse(s)).collect(),
            include: cfg.include.iter().map(|s| Permission::parse(s)).collect(),
            model: cfg.model.into(),
            pcmodel: cfg.precache.into(),
            order: cfg.order.rank(),
            dynamic: cfg.host.is_dynamic(),
            register: cfg.register,
            maxms: cfg.qualify.max_ms(),
            lastms: 0,
            outbound_key: None,
            inbound_key: None,
            register_timer: None,
            register_expire_timer: None,
            qualify_timer: None,
            reg_trans: None,
            qual_trans: None,
            qual_tx: None,
            history: Vec::new(),
            avgms: 0,
        }
    }

    /// A peer is consulted only when its address is known and, if
    /// qualification is on, its last measurement stayed under the ceiling.
    pub fn reachable(&self) -> bool {
        if self.addr.is_none() {
            return false;
        }
        if self.maxms > 0 && (self.lastms < 0 || self.lastms as u32 >= self.maxms) {
            return false;
        }
        true
    }

    /// Records one lookup timing sample and refreshes the running average.
    pub fn record_lookup(&mut self, query: String, ms: u32) {
        self.history.insert(0, (query, ms));
        self.history.truncate(TIMING_HISTORY);
        let total: u64 = self.history.iter().map(|(_, ms)| *ms as u64).sum();
        self.avgms = (total / self.history.len().max(1) as u64) as u32;
    }

    /// Restores a dynamic address persisted by an earlier registration.
    /// Returns the remaining registration lifetime when one was found.
    pub fn hydrate_addr(&mut self, store: &Store) -> Option<u64> {
        let data = store.get(FAMILY_DPEERS, &self.eid.to_string())?;
        let mut parts = data.splitn(3, ':');
        let ip = parts.next()?.parse().ok()?;
        let port: u16 = parts.next()?.parse().ok()?;
        let expire: u64 = parts.next()?.parse().ok()?;
        self.addr = Some(SocketAddr::new(ip, port));
        debug!(peer = %self.eid, addr = ?self.addr, "restored dynamic peer address");
        Some(expire)
    }
}

/// Introspection snapshot of one peer.
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub eid: Eid,
    pub addr: Option<SocketAddr>,
    pub model: String,
    pub dynamic: bool,
    pub order: u8,
    pub lastms: i32,
    pub maxms: u32,
    pub avgms: u32,
    pub registered: bool,
    pub history: Vec<(String, u32)>,
}

/// EID-keyed peer table.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<Eid, Peer>,
}

impl PeerRegistry {
    pub fn get(&self, eid: &Eid) -> Option<&Peer> {
        self.peers.get(eid)
    }

    pub fn get_mut(&mut self, eid: &Eid) -> Option<&mut Peer> {
        self.peers.get_mut(eid)
    }

    /// Inserts or replaces a peer's configured attributes. Timing state and
    /// scheduler tokens of an existing record survive until re-armed.
    pub fn upsert(&mut self, mut peer: Peer) -> &mut Peer {
        if let Some(old) = self.peers.remove(&peer.eid) {
            peer.lastms = old.lastms;
            peer.history = old.history;
            peer.avgms = old.avgms;
            peer.register_timer = old.register_timer;
            peer.register_expire_timer = old.register_expire_timer;
            peer.qualify_timer = old.qualify_timer;
            if peer.addr.is_none() {
                peer.addr = old.addr;
            }
        }
        self.peers.entry(peer.eid).insert_entry(peer).into_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn eids(&self) -> Vec<Eid> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        self.peers
            .values()
            .map(|p| PeerSummary {
                eid: p.eid,
                addr: p.addr,
                model: p.model.to_string(),
                dynamic: p.dynamic,
                order: p.order,
                lastms: p.lastms,
                maxms: p.maxms,
                avgms: p.avgms,
                registered: p.register,
                history: p.history.clone(),
            })
            .collect()
    }
}
