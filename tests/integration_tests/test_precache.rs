// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use dundi_rs::{
    Engine, StaticDialplan, Store,
    cfg::enums::ModelKind,
    store::{FAMILY_CACHE, KvStore},
};
use serial_test::serial;

use crate::integration_tests::common::{
    A_EID, B_EID, base_config, eid, mapping, inbound_peer, outbound_peer,
};

#[tokio::test]
#[serial]
async fn precache_pushes_answers_into_subscriber_caches() {
    // B subscribes to A's pushes.
    let mut b_cfg = base_config(B_EID);
    let mut a_at_b = inbound_peer();
    a_at_b.model = ModelKind::None;
    a_at_b.precache = ModelKind::Inbound;
    a_at_b.include = vec!["e164".to_string()];
    a_at_b.permit = Vec::new();
    b_cfg.peers.insert(eid(A_EID), a_at_b);
    let b_store = Store::memory();
    let server = Engine::spawn(b_cfg, Arc::new(StaticDialplan::new()), b_store.clone())
        .await
        .expect("spawn subscriber");

    // A maps e164 and pushes it to B.
    let mut a_cfg = base_config(A_EID);
    a_cfg.mappings.insert(
        "e164".to_string(),
        vec![mapping("local", 50, "guest@${NUMBER}")],
    );
    let mut b_at_a = outbound_peer(server.local_addr());
    b_at_a.model = ModelKind::None;
    b_at_a.precache = ModelKind::Outbound;
    b_at_a.include = Vec::new();
    b_at_a.permit = vec!["e164".to_string()];
    a_cfg.peers.insert(eid(B_EID), b_at_a);
    let mut plan = StaticDialplan::new();
    plan.add_extension("local", "555");
    let client = Engine::spawn(a_cfg, Arc::new(plan), Store::memory())
        .await
        .expect("spawn pusher");

    client.precache("e164", "555").await.expect("enqueue");
    tokio::time::sleep(Duration::from_millis(2000)).await;

    // The push landed in B's cache, keyed by the pushing peer.
    let key = format!("{}/555/e164/e{:08x}", eid(A_EID).to_short(), 0);
    let value = b_store.get(FAMILY_CACHE, &key).expect("pushed cache row");
    assert!(value.contains("guest@555"), "unexpected row: {value}");

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn startup_seeds_the_queue_from_mapped_extensions() {
    let mut a_cfg = base_config(A_EID);
    a_cfg.mappings.insert(
        "e164".to_string(),
        vec![mapping("local", 50, "guest@${NUMBER}")],
    );
    // An outbound precache peer that is not reachable; the queue still
    // fills from the dialplan walk.
    let mut b_at_a = outbound_peer("127.0.0.1:9".parse().expect("addr"));
    b_at_a.model = ModelKind::None;
    b_at_a.precache = ModelKind::Outbound;
    b_at_a.permit = vec!["e164".to_string()];
    a_cfg.peers.insert(eid(B_EID), b_at_a);
    let mut plan = StaticDialplan::new();
    plan.add_extension("local", "555");
    plan.add_extension("local", "556");
    let client = Engine::spawn(a_cfg, Arc::new(plan), Store::memory())
        .await
        .expect("spawn");

    // The seeded runs complete (the peer never answers, so they die by
    // budget) and re-time themselves from the answers' expiration.
    tokio::time::sleep(Duration::from_millis(4000)).await;
    let entries = client.precache_entries().await.expect("entries");
    let mut known: Vec<&str> = entries.iter().map(|e| e.number.as_str()).collect();
    known.sort();
    assert_eq!(known, vec!["555", "556"], "queue not re-seeded");
    for e in &entries {
        assert!(e.due_in > Duration::from_secs(60), "due too soon: {:?}", e.due_in);
    }
    client.stop().await;
}
