// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! User-visible requests: one lookup, entity query or precache run owning
//! a set of transactions fanned out to peers. The network loop drives the
//! transactions; callers await the completion channel.

use tokio::sync::oneshot;

use crate::{
    models::{AnswerFlags, Eid, HintFlags, Tech},
    utils::crc32,
};

/// Answers accumulated per request are capped here.
pub const MAX_RESULTS: usize = 64;

/// Grace added to the TTL budget of a request, ms.
pub const FLUFF_TIME_MS: u64 = 2000;
/// Budgeted wall-clock per TTL hop, ms.
pub const TTL_TIME_MS: u64 = 200;

/// Wall-clock budget for a request with the given hop budget.
pub fn ttl_budget_ms(ttl: u16) -> u64 {
    FLUFF_TIME_MS + ttl as u64 * TTL_TIME_MS
}

/// One weighted routing answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    pub flags: AnswerFlags,
    pub weight: u16,
    pub tech: Tech,
    pub dest: String,
    pub eid: Eid,
    /// Seconds the answer may be cached.
    pub expiration: u32,
}

/// Merges an answer into a result set: duplicates (same technology and
/// destination) keep the lower weight, fresh rows append up to `max`.
/// Returns true when the row was appended as new.
pub fn merge_result(rows: &mut Vec<LookupResult>, max: usize, new: LookupResult) -> bool {
    for row in rows.iter_mut() {
        if row.tech == new.tech && row.dest == new.dest {
            if new.weight < row.weight {
                row.weight = new.weight;
            }
            return false;
        }
    }
    if rows.len() >= max {
        return false;
    }
    rows.push(new);
    true
}

/// Stable weight sort applied to the rows handed back to the caller.
pub fn sort_results(rows: &mut [LookupResult]) {
    rows.sort_by_key(|r| r.weight);
}

/// Hint metadata accumulated for a request.
#[derive(Debug, Clone, Default)]
pub struct HintMeta {
    pub flags: HintFlags,
    /// Longest prefix nobody needs to be asked about.
    pub exten: String,
}

impl HintMeta {
    /// Server-side evaluation starts from "don't ask, unaffected".
    pub fn assume_dont_ask() -> Self {
        HintMeta {
            flags: HintFlags::DONT_ASK | HintFlags::UNAFFECTED,
            exten: String::new(),
        }
    }
}

/// Contact metadata answered to an entity query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityInfo {
    pub dept: String,
    pub org: String,
    pub locality: String,
    pub stateprov: String,
    pub country: String,
    pub email: String,
    pub phone: String,
    pub ipaddr: String,
}

/// Order-independent checksum over the avoid stack, excluding the root
/// entity at its bottom.
pub fn avoid_crc32(avoid: &[Eid]) -> u32 {
    let mut acrc32 = 0;
    if avoid.len() > 1 {
        for eid in &avoid[..avoid.len() - 1] {
            acrc32 ^= crc32(&eid.0);
        }
    }
    acrc32
}

/// What a request is resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Number discovery.
    Lookup,
    /// Entity contact query.
    EidQuery,
    /// Proactive precache push.
    Precache,
}

/// Errors surfaced to request callers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("duplicate request pending")]
    DuplicatePending,
    #[error("no mappings for the requested context")]
    UnsupportedContext,
    #[error("engine is shutting down")]
    EngineDown,
}

/// The completed outcome of a request.
#[derive(Debug, Default)]
pub struct LookupReply {
    pub results: Vec<LookupResult>,
    pub entity: Option<EntityInfo>,
    pub hmd: HintMeta,
    /// Minimum expiration seen across contributions.
    pub expiration: u32,
    /// Answers pushed out by a precache run.
    pub found_answers: usize,
}

/// What to resolve and under which constraints.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub number: String,
    pub dcontext: String,
    pub mode: LookupMode,
    pub query_eid: Option<Eid>,
    pub ttl: u16,
    pub cbypass: bool,
    /// Entities that must not be consulted, root last.
    pub avoid: Vec<Eid>,
    /// Whether each avoid entry was directly reachable by its sender.
    pub avoid_direct: Vec<bool>,
    /// A peer excluded from fan-out without being on the avoid stack.
    pub skip: Option<Eid>,
    /// Skip peers presenting a zero local identity.
    pub block_empty: bool,
    /// Select peers by precache eligibility instead of query eligibility.
    pub push_routes: bool,
    /// Hint state the request starts from.
    pub hmd: HintMeta,
    /// Expiration ceiling the request starts from.
    pub expiration: u32,
}

/// A request submitted to the network loop.
#[derive(Debug)]
pub struct LookupJob {
    pub spec: JobSpec,
    pub done: oneshot::Sender<Result<LookupReply, RequestError>>,
}

/// Engine-side state of one in-flight request.
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub number: String,
    pub dcontext: String,
    pub mode: LookupMode,
    pub query_eid: Option<Eid>,
    pub root_eid: Eid,
    pub crc32: u32,
    pub cbypass: bool,
    pub results: Vec<LookupResult>,
    pub entity: Option<EntityInfo>,
    /// Entity answers count towards completion the way rows do.
    pub respcount: usize,
    pub hmd: HintMeta,
    pub expiration: u32,
    /// Live child transaction ids.
    pub trans: Vec<u16>,
    pub deadline_timer: Option<u64>,
    pub done: Option<oneshot::Sender<Result<LookupReply, RequestError>>>,
    /// Duplicate jobs with a different root waiting for this one.
    pub waiters: Vec<LookupJob>,
}

/// Introspection snapshot of one request.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub number: String,
    pub dcontext: String,
    pub root_eid: Eid,
    pub max: usize,
    pub respcount: usize,
}
