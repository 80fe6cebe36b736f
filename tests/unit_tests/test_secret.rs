// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::{
    crypto::RollingSecret,
    store::{KvStore, Store},
    utils::now_secs,
};

#[test]
fn fresh_start_mints_and_persists_a_secret() {
    let store = Store::memory();
    let secret = RollingSecret::load(&store, "dundi");
    assert!(!secret.current().is_empty());
    // No separators that would corrupt dial strings.
    for c in [';', '/', ':', '@'] {
        assert!(!secret.current().contains(c), "secret contains '{c}'");
    }
    assert_eq!(
        store.get("dundi", "secret").as_deref(),
        Some(secret.current())
    );
    let expiry: u64 = store
        .get("dundi", "secretexpiry")
        .expect("expiry persisted")
        .parse()
        .expect("epoch");
    assert!(expiry > now_secs());
}

#[test]
fn valid_secret_survives_a_restart() {
    let store = Store::memory();
    let first = RollingSecret::load(&store, "dundi");
    let second = RollingSecret::load(&store, "dundi");
    assert_eq!(first.current(), second.current());
}

#[test]
fn stale_secret_rotates_on_load_keeping_the_old_one() {
    let store = Store::memory();
    store.put("dundi", "secret", "oldsecret");
    store.put("dundi", "secretexpiry", &(now_secs() - 10).to_string());
    let secret = RollingSecret::load(&store, "dundi");
    assert_ne!(secret.current(), "oldsecret");
    // The superseded secret is demoted to the prev slot.
    let stored = store.get("dundi", "secret").expect("stored");
    let (prev, current) = stored.split_once(';').expect("pair");
    assert_eq!(prev, "oldsecret");
    assert_eq!(current, secret.current());
}

#[test]
fn ancient_secret_is_dropped_entirely() {
    let store = Store::memory();
    store.put("dundi", "secret", "ancient");
    store.put("dundi", "secretexpiry", &(now_secs() - 100_000).to_string());
    let secret = RollingSecret::load(&store, "dundi");
    let stored = store.get("dundi", "secret").expect("stored");
    assert_eq!(stored, secret.current());
    assert!(!stored.contains(';'));
}

#[test]
fn check_is_a_noop_inside_the_lifetime() {
    let store = Store::memory();
    let mut secret = RollingSecret::load(&store, "dundi");
    let before = secret.current().to_string();
    secret.check(&store);
    assert_eq!(secret.current(), before);
}
