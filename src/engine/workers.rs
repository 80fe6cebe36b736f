// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server-side evaluation runs off the network loop in short-lived tasks:
//! dialplan probes are host code of unknown latency, and answering a
//! discover may recurse into a full network lookup. Completions are posted
//! back to the loop as messages; a task never touches engine state
//! directly.

use std::sync::Arc;

use tracing::debug;

use crate::{
    cache::DEFAULT_CACHE_TIME,
    cfg::{config::MappingConfig, enums::MappingOption},
    dialplan::{Dialplan, TemplateVars, expand_template},
    engine::{EngineHandle, ResponseBody},
    models::{AnswerFlags, Cause, Command, Eid, Tech},
    request::{
        EntityInfo, HintMeta, JobSpec, LookupMode, LookupResult, MAX_RESULTS,
        RequestError,
    },
};

/// A dialplan exposure: the externally advertised context resolved by
/// probing a local context and answering with an expanded template.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub dcontext: String,
    pub lcontext: String,
    pub weight: u16,
    pub tech: Tech,
    pub dest: String,
    pub options: AnswerFlags,
}

impl Mapping {
    pub fn from_config(dcontext: &str, cfg: &MappingConfig) -> Self {
        let mut options = AnswerFlags::empty();
        for opt in &cfg.options {
            options |= match opt {
                MappingOption::NoUnsolicited => AnswerFlags::NOUNSOLICITED,
                MappingOption::NoComUnsolicit => AnswerFlags::NOCOMUNSOLICIT,
                MappingOption::Residential => AnswerFlags::RESIDENTIAL,
                MappingOption::Commercial => AnswerFlags::COMMERCIAL,
                MappingOption::Mobile => AnswerFlags::MOBILE,
                MappingOption::NoPartial => AnswerFlags::NOPARTIAL,
            };
        }
        Mapping {
            dcontext: dcontext.to_string(),
            lcontext: cfg.lcontext.clone(),
            weight: cfg.weight,
            tech: cfg.tech,
            dest: cfg.dest.clone(),
            options,
        }
    }
}

/// Evaluates one mapping against the local dialplan, appending an answer
/// when any probe fires and otherwise extending the don't-ask hint with
/// the shortest unmatchable prefix.
#[allow(clippy::too_many_arguments)]
pub fn lookup_local(
    dialplan: &dyn Dialplan,
    map: &Mapping,
    number: &str,
    us_eid: &Eid,
    secret: &str,
    ipaddr: &str,
    rows: &mut Vec<LookupResult>,
    hmd: &mut HintMeta,
) {
    if map.lcontext.is_empty() {
        return;
    }
    let mut flags = AnswerFlags::empty();
    if dialplan.exists(&map.lcontext, number) {
        flags |= AnswerFlags::EXISTS;
    }
    if dialplan.canmatch(&map.lcontext, number) {
        flags |= AnswerFlags::CANMATCH;
    }
    if dialplan.matchmore(&map.lcontext, number) {
        flags |= AnswerFlags::MATCHMORE;
    }
    if dialplan.ignore_pattern(&map.lcontext, number) {
        flags |= AnswerFlags::IGNOREPAT;
    }

    // Clearly we can't say "don't ask" anymore if we found anything.
    if !flags.is_empty() {
        hmd.flags.remove(crate::models::HintFlags::DONT_ASK);
    }
    if map.options.contains(AnswerFlags::NOPARTIAL) {
        flags.remove(AnswerFlags::MATCHMORE | AnswerFlags::CANMATCH);
    }
    if !flags.is_empty() {
        if rows.len() >= MAX_RESULTS {
            return;
        }
        flags |= AnswerFlags::from_wire(map.options.wire());
        let eid_str = us_eid.to_string();
        let dest = if flags.contains(AnswerFlags::EXISTS) {
            expand_template(
                &map.dest,
                TemplateVars {
                    number,
                    eid: &eid_str,
                    secret,
                    ipaddr,
                },
            )
        } else {
            String::new()
        };
        rows.push(LookupResult {
            flags,
            weight: map.weight,
            tech: map.tech,
            dest,
            eid: *us_eid,
            expiration: DEFAULT_CACHE_TIME,
        });
    } else {
        // Record the fewest digits of the number for which nothing can
        // match, to let downstream caches prune the whole subtree.
        for end in 1..=number.len() {
            let prefix = &number[..end];
            if !dialplan.canmatch(&map.lcontext, prefix) {
                if prefix.len() > hmd.exten.len() {
                    hmd.exten = prefix.to_string();
                }
                break;
            }
        }
    }
}

/// The state a server worker carries away from the loop: everything it
/// needs, copied, plus the (id, generation) pair naming its transaction.
#[derive(Debug)]
pub struct QueryState {
    pub trans: u16,
    pub generation: u64,
    pub us_eid: Eid,
    pub called_context: String,
    pub called_number: String,
    pub eids: Vec<Eid>,
    pub directs: Vec<bool>,
    /// Already decremented hop budget.
    pub ttl: u16,
    pub cbypass: bool,
    pub maps: Vec<Mapping>,
    pub secret: String,
    pub ipaddr: String,
}

/// The first stack entry authenticates and the last names the root; when
/// they are the same entity the authenticating copy is dropped before the
/// stack travels onward.
pub fn strip_duplicate_root(eids: &mut Vec<Eid>, directs: &mut Vec<bool>) {
    if eids.len() > 1 && eids.first() == eids.last() {
        eids.remove(0);
        if !directs.is_empty() {
            directs.remove(0);
        }
    }
}

/// Answers a DPDISCOVER: local mapping evaluation, then a recursive
/// network lookup unless a canonical (weight zero) local answer exists.
pub async fn lookup_worker(
    handle: EngineHandle,
    dialplan: Arc<dyn Dialplan>,
    st: QueryState,
) {
    debug!(
        number = %st.called_number,
        context = %st.called_context,
        "looking up on behalf of peer"
    );
    let mut rows = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    for map in &st.maps {
        lookup_local(
            dialplan.as_ref(),
            map,
            &st.called_number,
            &st.us_eid,
            &st.secret,
            &st.ipaddr,
            &mut rows,
            &mut hmd,
        );
    }
    let mut expiration = DEFAULT_CACHE_TIME;
    let mut cause = None;
    let canonical = rows.iter().map(|r| r.weight).min() == Some(0);
    if !canonical {
        // No canonical local result, keep looking over the network.
        let had_local = !rows.is_empty();
        match handle
            .submit(JobSpec {
                number: st.called_number.clone(),
                dcontext: st.called_context.clone(),
                mode: LookupMode::Lookup,
                query_eid: None,
                ttl: st.ttl,
                cbypass: st.cbypass,
                avoid: st.eids.clone(),
                avoid_direct: st.directs.clone(),
                skip: None,
                block_empty: true,
                push_routes: false,
                hmd: hmd.clone(),
                expiration,
            })
            .await
        {
            Ok(reply) => {
                for row in reply.results {
                    if rows.len() >= MAX_RESULTS {
                        break;
                    }
                    rows.push(row);
                }
                hmd = reply.hmd;
                expiration = reply.expiration;
            },
            Err(RequestError::DuplicatePending) if !had_local => {
                cause = Some((Cause::Duplicate, "Duplicate Request Pending".to_string()));
            },
            Err(_) => {},
        }
    }
    for row in &rows {
        if row.expiration > 0 && expiration > row.expiration {
            expiration = row.expiration;
        }
    }
    if !hmd.flags.contains(crate::models::HintFlags::DONT_ASK) {
        hmd.exten.clear();
    }
    handle
        .worker_done(st.trans, st.generation, Command::DpResponse, ResponseBody {
            answers: rows,
            hmd: Some(hmd),
            expiration: Some(expiration.min(u16::MAX as u32) as u16),
            entity: None,
            cause,
        })
        .await;
}

/// Answers an EIDQUERY: our own identity when the target is us, a
/// recursive query otherwise.
pub async fn query_worker(
    handle: EngineHandle,
    st: QueryState,
    reqeid: Eid,
    identity: EntityInfo,
) {
    let mut hmd = HintMeta::default();
    let entity = if st.us_eid == reqeid {
        debug!("neat, someone is looking for us");
        Some(identity)
    } else {
        match handle
            .submit(JobSpec {
                number: String::new(),
                dcontext: st.called_context.clone(),
                mode: LookupMode::EidQuery,
                query_eid: Some(reqeid),
                ttl: st.ttl,
                cbypass: false,
                avoid: st.eids.clone(),
                avoid_direct: st.directs.clone(),
                skip: None,
                block_empty: true,
                push_routes: false,
                hmd: hmd.clone(),
                expiration: DEFAULT_CACHE_TIME,
            })
            .await
        {
            Ok(reply) => {
                hmd = reply.hmd;
                reply.entity
            },
            Err(_) => None,
        }
    };
    handle
        .worker_done(st.trans, st.generation, Command::EidResponse, ResponseBody {
            answers: Vec::new(),
            hmd: Some(hmd),
            expiration: None,
            entity,
            cause: None,
        })
        .await;
}

/// Forwards an accepted precache push to our own subscribers, then
/// acknowledges it.
pub async fn precache_worker(handle: EngineHandle, st: QueryState) {
    debug!(
        number = %st.called_number,
        context = %st.called_context,
        "forwarding precache"
    );
    let _ = handle
        .precache_internal(
            st.called_context.clone(),
            st.called_number.clone(),
            st.ttl,
            st.eids.clone(),
        )
        .await;
    handle
        .worker_done(st.trans, st.generation, Command::PrecacheRp, ResponseBody {
            answers: Vec::new(),
            hmd: None,
            expiration: None,
            entity: None,
            cause: None,
        })
        .await;
}

/// One transaction of an outbound precache run.
#[derive(Debug, Clone)]
pub struct PrecacheTarget {
    pub trans: u16,
    pub generation: u64,
    pub them_eid: Eid,
    pub us_eid: Eid,
    pub ttl: u16,
}

/// Produces the answer set for each precache target and hands it to the
/// loop for transmission. Answers are evaluated per target because each
/// peer may see a different local identity, and a non-canonical local set
/// is topped up with a network lookup that skips the target itself.
#[allow(clippy::too_many_arguments)]
pub async fn precache_push_worker(
    handle: EngineHandle,
    dialplan: Arc<dyn Dialplan>,
    request: u64,
    number: String,
    dcontext: String,
    maps: Vec<Mapping>,
    targets: Vec<PrecacheTarget>,
    secret: String,
    ipaddr: String,
) {
    for target in targets {
        let mut rows = Vec::new();
        let mut hmd = HintMeta::assume_dont_ask();
        for map in &maps {
            lookup_local(
                dialplan.as_ref(),
                map,
                &number,
                &target.us_eid,
                &secret,
                &ipaddr,
                &mut rows,
                &mut hmd,
            );
        }
        let mut expiration = DEFAULT_CACHE_TIME;
        let canonical = rows.iter().map(|r| r.weight).min() == Some(0);
        if !canonical
            && let Ok(reply) = handle
                .submit(JobSpec {
                    number: number.clone(),
                    dcontext: dcontext.clone(),
                    mode: LookupMode::Lookup,
                    query_eid: None,
                    ttl: target.ttl,
                    cbypass: false,
                    avoid: Vec::new(),
                    avoid_direct: Vec::new(),
                    skip: Some(target.them_eid),
                    block_empty: true,
                    push_routes: true,
                    hmd: hmd.clone(),
                    expiration,
                })
                .await
        {
            for row in reply.results {
                if rows.len() >= MAX_RESULTS {
                    break;
                }
                rows.push(row);
            }
            hmd = reply.hmd;
            expiration = reply.expiration;
        }
        for row in &rows {
            if row.expiration > 0 && expiration > row.expiration {
                expiration = row.expiration;
            }
        }
        handle
            .send_precache(
                request,
                target.trans,
                target.generation,
                rows,
                hmd,
                expiration,
            )
            .await;
    }
}
