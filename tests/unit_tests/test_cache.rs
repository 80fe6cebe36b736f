// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::{
    cache::{CacheScope, cache_lookup, cache_save, cache_save_hint},
    models::{AnswerFlags, Eid, HintFlags, Tech},
    request::{HintMeta, LookupResult},
    store::{FAMILY_CACHE, KvStore, Store},
    utils::now_secs,
};

fn peer() -> Eid {
    "00:50:8b:ae:43:32".parse().expect("eid")
}

fn scope<'a>(number: &'a str) -> CacheScope<'a> {
    CacheScope {
        number,
        dcontext: "e164",
        root_eid: Eid::zero(),
        crc32: 0,
    }
}

fn row(dest: &str, weight: u16) -> LookupResult {
    LookupResult {
        flags: AnswerFlags::EXISTS,
        weight,
        tech: Tech::Iax2,
        dest: dest.to_string(),
        eid: peer(),
        expiration: 60,
    }
}

#[test]
fn save_then_lookup_returns_rows() {
    let store = Store::memory();
    let rows = vec![row("guest@example", 100), row("backup@example", 200)];
    cache_save(&store, &peer(), scope("555"), &rows, 0, false, 60, false);

    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    assert!(cache_lookup(&store, &peer(), scope("555"), &mut out, &mut hmd, &mut low));
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].dest, "guest@example");
    assert_eq!(out[0].weight, 100);
    assert_eq!(out[0].tech, Tech::Iax2);
    assert_eq!(out[0].eid, peer());
    assert!(out[0].flags.contains(AnswerFlags::EXISTS));
    // A cached answer means "don't ask" no longer holds.
    assert!(!hmd.flags.contains(HintFlags::DONT_ASK));
    // Pull rows live 10 s less than the server granted.
    assert!(low <= 50);
}

#[test]
fn expired_rows_are_deleted_on_read() {
    let store = Store::memory();
    let key = format!("{}/555/e164/e{:08x}", peer().to_short(), 0);
    store.put(
        FAMILY_CACHE,
        &key,
        &format!("{}|1/100/1/guest@example/{}|", now_secs() - 5, peer().to_short()),
    );

    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    assert!(!cache_lookup(&store, &peer(), scope("555"), &mut out, &mut hmd, &mut low));
    assert!(out.is_empty());
    assert_eq!(store.get(FAMILY_CACHE, &key), None, "reaped on read");
}

#[test]
fn push_rows_get_ten_extra_seconds() {
    let store = Store::memory();
    cache_save(&store, &peer(), scope("555"), &[row("a@b", 1)], 0, false, 60, true);
    let key = format!("{}/555/e164/e{:08x}", peer().to_short(), 0);
    let value = store.get(FAMILY_CACHE, &key).expect("row");
    let (timeout, _) = value.split_once('|').expect("format");
    let timeout: u64 = timeout.parse().expect("epoch");
    let lifetime = timeout - now_secs();
    assert!((68..=70).contains(&lifetime), "push lifetime was {lifetime}");
}

#[test]
fn unaffected_rows_key_on_zero_crc() {
    let store = Store::memory();
    let s = CacheScope {
        number: "555",
        dcontext: "e164",
        root_eid: Eid::zero(),
        crc32: 0xabcdef01,
    };
    cache_save(&store, &peer(), s, &[row("a@b", 1)], 0, true, 60, false);
    let zero_key = format!("{}/555/e164/e{:08x}", peer().to_short(), 0);
    assert!(store.get(FAMILY_CACHE, &zero_key).is_some());
    // Any other requester finds it through the zero-crc key.
    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    let other = CacheScope {
        number: "555",
        dcontext: "e164",
        root_eid: Eid::zero(),
        crc32: 0x11111111,
    };
    assert!(cache_lookup(&store, &peer(), other, &mut out, &mut hmd, &mut low));
    assert_eq!(out.len(), 1);
}

#[test]
fn pipe_in_destination_is_not_cached() {
    let store = Store::memory();
    cache_save(
        &store,
        &peer(),
        scope("555"),
        &[row("bad|dest", 1), row("good@dest", 2)],
        0,
        false,
        60,
        false,
    );
    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    cache_lookup(&store, &peer(), scope("555"), &mut out, &mut hmd, &mut low);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].dest, "good@dest");
}

#[test]
fn hint_prefix_prunes_lookups() {
    let store = Store::memory();
    cache_save_hint(
        &store,
        &peer(),
        scope("415"),
        HintFlags::DONT_ASK,
        "415",
        60,
    );
    // Any longer number under the prefix hits the hint row.
    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    assert!(cache_lookup(
        &store,
        &peer(),
        scope("4155551212"),
        &mut out,
        &mut hmd,
        &mut low
    ));
    assert!(out.is_empty());
    assert_eq!(hmd.exten, "415");
}

#[test]
fn hints_without_dont_ask_are_not_cached() {
    let store = Store::memory();
    cache_save_hint(
        &store,
        &peer(),
        scope("415"),
        HintFlags::TTL_EXPIRED,
        "415",
        60,
    );
    let mut out = Vec::new();
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    assert!(!cache_lookup(
        &store,
        &peer(),
        scope("4155551212"),
        &mut out,
        &mut hmd,
        &mut low
    ));
}

#[test]
fn duplicate_rows_keep_min_weight_across_keys() {
    let store = Store::memory();
    // The same destination cached under two different weights; the merged
    // view must keep the lower one.
    cache_save(&store, &peer(), scope("555"), &[row("a@b", 90)], 0, false, 60, false);
    let mut out = vec![row("a@b", 200)];
    let mut hmd = HintMeta::assume_dont_ask();
    let mut low = 3600;
    cache_lookup(&store, &peer(), scope("555"), &mut out, &mut hmd, &mut low);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].weight, 90);
}
