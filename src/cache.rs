// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Answer and hint caching. Rows live in the `dundi/cache` family keyed by
//! peer, number and context plus either the avoid-stack checksum or the
//! root entity, and carry their absolute expiry inside the value.

use tracing::debug;

use crate::{
    models::{AnswerFlags, Eid, HintFlags, Tech},
    request::{HintMeta, LookupResult, MAX_RESULTS, merge_result},
    store::{FAMILY_CACHE, KvStore, Store},
    utils::now_secs,
};

/// Default lifetime of cached answers, seconds.
pub const DEFAULT_CACHE_TIME: u32 = 3600;

/// The key components shared by every cache row of one request.
#[derive(Debug, Clone, Copy)]
pub struct CacheScope<'a> {
    pub number: &'a str,
    pub dcontext: &'a str,
    pub root_eid: Eid,
    pub crc32: u32,
}

/// Writes the two answer rows for a response: one keyed by the avoid-stack
/// checksum (zeroed when the answer is unaffected by it), one by the root
/// entity. Push-cached rows live ten seconds longer than the server said,
/// pull-cached rows ten seconds shorter.
#[allow(clippy::too_many_arguments)]
pub fn cache_save(
    store: &Store,
    peer_eid: &Eid,
    scope: CacheScope<'_>,
    rows: &[LookupResult],
    start: usize,
    unaffected: bool,
    expiration: i64,
    push: bool,
) {
    let mut expiration = if expiration < 1 {
        DEFAULT_CACHE_TIME as i64
    } else {
        expiration
    };
    if push {
        expiration += 10;
    } else {
        expiration -= 10;
    }
    let expiration = expiration.max(1) as u64;

    let peer_str = peer_eid.to_short();
    let crc = if unaffected { 0 } else { scope.crc32 };
    let key1 = format!("{peer_str}/{}/{}/e{crc:08x}", scope.number, scope.dcontext);
    let key2 = format!(
        "{peer_str}/{}/{}/r{}",
        scope.number,
        scope.dcontext,
        scope.root_eid.to_short()
    );

    let timeout = now_secs() + expiration;
    let mut data = format!("{timeout}|");
    for row in rows.iter().skip(start) {
        // A pipe inside a destination would corrupt the row format.
        if row.dest.contains('|') {
            continue;
        }
        data.push_str(&format!(
            "{}/{}/{}/{}/{}|",
            row.flags.bits(),
            row.weight,
            row.tech.wire(),
            row.dest,
            row.eid.to_short()
        ));
    }
    store.put(FAMILY_CACHE, &key1, &data);
    store.put(FAMILY_CACHE, &key2, &data);
}

/// Writes the two hint rows for a response carrying a DON'T ASK prefix.
pub fn cache_save_hint(
    store: &Store,
    peer_eid: &Eid,
    scope: CacheScope<'_>,
    flags: HintFlags,
    exten: &str,
    expiration: i64,
) {
    if !flags.contains(HintFlags::DONT_ASK) {
        return;
    }
    let expiration = if expiration < 0 {
        DEFAULT_CACHE_TIME as i64
    } else {
        expiration
    };
    let unaffected = flags.contains(HintFlags::UNAFFECTED);
    let peer_str = peer_eid.to_short();
    let crc = if unaffected { 0 } else { scope.crc32 };
    let key1 = format!("hint/{peer_str}/{exten}/{}/e{crc:08x}", scope.dcontext);
    let key2 = format!(
        "hint/{peer_str}/{exten}/{}/r{}",
        scope.dcontext,
        scope.root_eid.to_short()
    );
    let data = format!("{}|", now_secs() as i64 + expiration);
    debug!(key = %key1, "caching hint");
    store.put(FAMILY_CACHE, &key1, &data);
    debug!(key = %key2, "caching hint");
    store.put(FAMILY_CACHE, &key2, &data);
}

fn parse_row(segment: &str) -> Option<LookupResult> {
    // flags/weight/tech/dest/eid — the destination may itself contain
    // slashes, so the entity id is everything after the last one.
    let mut fields = segment.splitn(4, '/');
    let flags: u32 = fields.next()?.parse().ok()?;
    let weight: u16 = fields.next()?.parse().ok()?;
    let tech: u8 = fields.next()?.parse().ok()?;
    let rest = fields.next()?;
    let (dest, eid_str) = rest.rsplit_once('/')?;
    let eid = Eid::parse_short(eid_str).ok()?;
    Some(LookupResult {
        flags: AnswerFlags::from_bits_truncate(flags),
        weight,
        tech: Tech::from_wire(tech),
        dest: dest.to_string(),
        eid,
        expiration: 0,
    })
}

fn lookup_one(
    store: &Store,
    key: &str,
    rows: &mut Vec<LookupResult>,
    hmd: &mut HintMeta,
    low_expiration: &mut u32,
) -> bool {
    let Some(data) = store.get(FAMILY_CACHE, key) else {
        return false;
    };
    let Some((timeout, body)) = data.split_once('|') else {
        store.del(FAMILY_CACHE, key);
        return false;
    };
    let Ok(timeout) = timeout.parse::<u64>() else {
        store.del(FAMILY_CACHE, key);
        return false;
    };
    let now = now_secs();
    if timeout <= now {
        // Expired rows never hit; they are reaped on read.
        store.del(FAMILY_CACHE, key);
        return false;
    }
    let expiration = (timeout - now) as u32;
    debug!(key, expiration, "found cache row");
    for segment in body.split_terminator('|') {
        let Some(mut row) = parse_row(segment) else {
            continue;
        };
        row.expiration = expiration;
        if merge_result(rows, MAX_RESULTS, row) {
            hmd.flags.remove(HintFlags::DONT_ASK);
        }
    }
    if expiration < *low_expiration {
        *low_expiration = expiration;
    }
    true
}

/// Consults the cache for one peer's contribution to a request: the
/// crc-keyed row, the unaffected row and the root-keyed row, then, when no
/// answers exist at all, the hint rows over every prefix of the number.
/// Returns true when any live row was found.
pub fn cache_lookup(
    store: &Store,
    peer_eid: &Eid,
    scope: CacheScope<'_>,
    rows: &mut Vec<LookupResult>,
    hmd: &mut HintMeta,
    low_expiration: &mut u32,
) -> bool {
    let peer_str = peer_eid.to_short();
    let root_str = scope.root_eid.to_short();
    let mut res = false;
    for key in [
        format!(
            "{peer_str}/{}/{}/e{:08x}",
            scope.number, scope.dcontext, scope.crc32
        ),
        format!("{peer_str}/{}/{}/e{:08x}", scope.number, scope.dcontext, 0),
        format!("{peer_str}/{}/{}/r{root_str}", scope.number, scope.dcontext),
    ] {
        res |= lookup_one(store, &key, rows, hmd, low_expiration);
    }

    if rows.is_empty() {
        // A hint on any prefix of the number precludes asking this peer.
        let mut res2 = false;
        for end in 1..=scope.number.len() {
            if res2 {
                break;
            }
            let prefix = &scope.number[..end];
            for key in [
                format!(
                    "hint/{peer_str}/{prefix}/{}/e{:08x}",
                    scope.dcontext, scope.crc32
                ),
                format!("hint/{peer_str}/{prefix}/{}/e{:08x}", scope.dcontext, 0),
                format!("hint/{peer_str}/{prefix}/{}/r{root_str}", scope.dcontext),
            ] {
                res2 |= lookup_one(store, &key, rows, hmd, low_expiration);
            }
            if res2 && prefix.len() > hmd.exten.len() {
                hmd.exten = prefix.to_string();
            }
        }
        res |= res2;
    }

    res
}
