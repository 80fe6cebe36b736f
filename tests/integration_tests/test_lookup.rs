// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dundi_rs::{
    LookupOptions,
    models::{AnswerFlags, HintFlags, Tech},
    store::{FAMILY_CACHE, KvStore},
};
use serial_test::serial;

use crate::integration_tests::common::{
    A_EID, B_EID, eid, spawn_client, spawn_server,
};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[tokio::test]
#[serial]
async fn cache_hit_answers_without_asking_anyone() {
    // The peer address points nowhere; a cache hit must answer anyway.
    let (engine, store) =
        spawn_client(A_EID, B_EID, "127.0.0.1:1".parse().expect("addr")).await;
    let key = format!("{}/555/e164/e{:08x}", eid(B_EID).to_short(), 0);
    store.put(
        FAMILY_CACHE,
        &key,
        &format!("{}|1/100/1/guest@example/{}|", now_secs() + 60, eid(B_EID).to_short()),
    );

    let start = Instant::now();
    let results = engine.lookup("555", Some("e164"), false).await.expect("lookup");
    assert!(start.elapsed() < Duration::from_millis(500), "no fan-out expected");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].weight, 100);
    assert_eq!(results[0].tech, Tech::Iax2);
    assert_eq!(results[0].dest, "guest@example");
    assert!(results[0].flags.contains(AnswerFlags::EXISTS));
    engine.stop().await;
}

#[tokio::test]
#[serial]
async fn discover_resolves_against_a_peer() {
    let server = spawn_server(B_EID, A_EID, &["555"]).await;
    let (client, store) = spawn_client(A_EID, B_EID, server.local_addr()).await;

    let results = client.lookup("555", None, false).await.expect("lookup");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].weight, 50);
    assert_eq!(results[0].tech, Tech::Iax2);
    assert_eq!(results[0].dest, "guest@555");
    assert_eq!(results[0].eid, eid(B_EID));
    assert!(results[0].flags.contains(AnswerFlags::EXISTS));

    // The response was cached under the answering peer.
    let key = format!("{}/555/e164/e{:08x}", eid(B_EID).to_short(), 0);
    assert!(
        store.get(FAMILY_CACHE, &key).is_some(),
        "answer cache row missing"
    );

    // A repeat lookup is served from cache, fast.
    let start = Instant::now();
    let again = client.lookup("555", None, false).await.expect("repeat");
    assert!(start.elapsed() < Duration::from_millis(500));
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].dest, "guest@555");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn unmatchable_numbers_come_back_with_a_hint() {
    let server = spawn_server(B_EID, A_EID, &["555"]).await;
    let (client, store) = spawn_client(A_EID, B_EID, server.local_addr()).await;

    let reply = client
        .lookup_with(LookupOptions {
            number: "9115551212".to_string(),
            context: None,
            ..Default::default()
        })
        .await
        .expect("lookup");
    assert!(reply.results.is_empty());

    // The don't-ask hint for the shortest unmatchable prefix was cached,
    // so the next lookup under it consults nobody.
    let hint_key = format!("hint/{}/9/e164/e{:08x}", eid(B_EID).to_short(), 0);
    assert!(store.get(FAMILY_CACHE, &hint_key).is_some(), "hint row missing");

    let start = Instant::now();
    let reply = client
        .lookup_with(LookupOptions {
            number: "9999".to_string(),
            context: None,
            ..Default::default()
        })
        .await
        .expect("pruned lookup");
    assert!(reply.results.is_empty());
    assert!(start.elapsed() < Duration::from_millis(500), "hint must prune fan-out");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn zero_ttl_never_emits_and_flags_expiry() {
    let server = spawn_server(B_EID, A_EID, &["555"]).await;
    let (client, _store) = spawn_client(A_EID, B_EID, server.local_addr()).await;

    let start = Instant::now();
    let reply = client
        .lookup_with(LookupOptions {
            number: "555".to_string(),
            context: None,
            ttl: Some(0),
            ..Default::default()
        })
        .await
        .expect("lookup");
    assert!(reply.results.is_empty());
    assert!(reply.hmd.flags.contains(HintFlags::TTL_EXPIRED));
    assert!(start.elapsed() < Duration::from_millis(500));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn avoided_peers_are_never_consulted() {
    let server = spawn_server(B_EID, A_EID, &["555"]).await;
    let (client, _store) = spawn_client(A_EID, B_EID, server.local_addr()).await;

    let start = Instant::now();
    let reply = client
        .lookup_with(LookupOptions {
            number: "555".to_string(),
            context: None,
            avoid: vec![eid(B_EID)],
            ..Default::default()
        })
        .await
        .expect("lookup");
    assert!(
        reply.results.is_empty(),
        "the only mapped peer was on the avoid stack"
    );
    assert!(start.elapsed() < Duration::from_millis(500), "nothing to wait for");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn entity_query_returns_identity_metadata() {
    use std::sync::Arc;

    use dundi_rs::{Engine, StaticDialplan, Store};

    use crate::integration_tests::common::{base_config, inbound_peer, outbound_peer};

    let mut b_cfg = base_config(B_EID);
    b_cfg.general.organization = "Example Corp".to_string();
    b_cfg.general.locality = "San Francisco".to_string();
    b_cfg.general.email = "voip@example.com".to_string();
    b_cfg.peers.insert(eid(A_EID), inbound_peer());
    let server = Engine::spawn(b_cfg, Arc::new(StaticDialplan::new()), Store::memory())
        .await
        .expect("spawn server");

    let mut a_cfg = base_config(A_EID);
    a_cfg.peers.insert(eid(B_EID), outbound_peer(server.local_addr()));
    let client = Engine::spawn(a_cfg, Arc::new(StaticDialplan::new()), Store::memory())
        .await
        .expect("spawn client");

    let info = client
        .query_eid(eid(B_EID), None)
        .await
        .expect("query")
        .expect("entity info");
    assert_eq!(info.org, "Example Corp");
    assert_eq!(info.locality, "San Francisco");
    assert_eq!(info.email, "voip@example.com");
    // The entity answered for itself, so its address is authoritative.
    assert_eq!(info.ipaddr, "127.0.0.1");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn unreachable_peer_times_out_inside_the_ttl_budget() {
    // Nothing listens on this port; the request must die by budget, not
    // hang on retransmissions.
    let (client, _store) =
        spawn_client(A_EID, B_EID, "127.0.0.1:9".parse().expect("addr")).await;
    let start = Instant::now();
    let results = client
        .lookup_with(LookupOptions {
            number: "555".to_string(),
            context: None,
            ttl: Some(1),
            ..Default::default()
        })
        .await
        .expect("lookup");
    let elapsed = start.elapsed();
    assert!(results.results.is_empty());
    // Budget for TTL 1 is 2000 + 200 ms.
    assert!(elapsed >= Duration::from_millis(2000), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(6), "budget overrun: {elapsed:?}");
    client.stop().await;
}

#[tokio::test]
#[serial]
async fn cache_bypass_skips_reads_but_still_writes() {
    let server = spawn_server(B_EID, A_EID, &["555"]).await;
    let (client, store) = spawn_client(A_EID, B_EID, server.local_addr()).await;

    // Poison the cache; a bypass lookup must ignore it and re-ask.
    let key = format!("{}/555/e164/e{:08x}", eid(B_EID).to_short(), 0);
    store.put(
        FAMILY_CACHE,
        &key,
        &format!("{}|1/7/2/stale@row/{}|", now_secs() + 60, eid(B_EID).to_short()),
    );

    let results = client.lookup("555", None, true).await.expect("lookup");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].dest, "guest@555", "bypass must not serve the stale row");

    // The fresh response replaced the poisoned row.
    let value = store.get(FAMILY_CACHE, &key).expect("rewritten");
    assert!(value.contains("guest@555"), "cache not refreshed: {value}");

    client.stop().await;
    server.stop().await;
}
