// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fs;

use dundi_rs::store::{KvStore, Store};

#[test]
fn memory_store_basics() {
    let store = Store::memory();
    assert_eq!(store.get("dundi/cache", "k"), None);
    store.put("dundi/cache", "k", "v");
    assert_eq!(store.get("dundi/cache", "k").as_deref(), Some("v"));
    store.put("dundi/cache", "k", "v2");
    assert_eq!(store.get("dundi/cache", "k").as_deref(), Some("v2"));
    store.del("dundi/cache", "k");
    assert_eq!(store.get("dundi/cache", "k"), None);
}

#[test]
fn families_are_disjoint() {
    let store = Store::memory();
    store.put("dundi/cache", "k", "cache");
    store.put("dundi/dpeers", "k", "peer");
    assert_eq!(store.get("dundi/cache", "k").as_deref(), Some("cache"));
    assert_eq!(store.get("dundi/dpeers", "k").as_deref(), Some("peer"));
    store.deltree("dundi/cache", None);
    assert_eq!(store.get("dundi/cache", "k"), None);
    assert_eq!(store.get("dundi/dpeers", "k").as_deref(), Some("peer"));
}

#[test]
fn deltree_honours_subtree_prefixes() {
    let store = Store::memory();
    store.put("dundi/cache", "hint/AA/415/e164/e0", "1|");
    store.put("dundi/cache", "hint/AA/510/e164/e0", "1|");
    store.put("dundi/cache", "AA/555/e164/e0", "1|");
    store.deltree("dundi/cache", Some("hint/AA/415"));
    assert_eq!(store.get("dundi/cache", "hint/AA/415/e164/e0"), None);
    assert!(store.get("dundi/cache", "hint/AA/510/e164/e0").is_some());
    assert!(store.get("dundi/cache", "AA/555/e164/e0").is_some());
}

#[test]
fn json_file_store_survives_reopen() {
    let path = std::env::temp_dir().join(format!(
        "dundi-store-{}.json",
        std::process::id()
    ));
    let _ = fs::remove_file(&path);
    {
        let store = Store::json_file(&path).expect("open");
        store.put("dundi/dpeers", "00:50:8b:ae:43:32", "10.1.2.3:4520:60");
        store.put("dundi/cache", "k", "v");
        store.del("dundi/cache", "k");
    }
    let store = Store::json_file(&path).expect("reopen");
    assert_eq!(
        store.get("dundi/dpeers", "00:50:8b:ae:43:32").as_deref(),
        Some("10.1.2.3:4520:60")
    );
    assert_eq!(store.get("dundi/cache", "k"), None);
    let _ = fs::remove_file(&path);
}
