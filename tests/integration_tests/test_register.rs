// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use dundi_rs::{
    Engine, StaticDialplan, Store,
    cfg::{config::HostSetting, enums::ModelKind},
    store::{FAMILY_DPEERS, KvStore},
};
use serial_test::serial;

use crate::integration_tests::common::{
    A_EID, B_EID, base_config, eid, inbound_peer, outbound_peer,
};

#[tokio::test]
#[serial]
async fn dynamic_peer_registers_and_is_persisted() {
    // B is the registrar: it knows A as a dynamic peer.
    let mut b_cfg = base_config(B_EID);
    let mut a_at_b = inbound_peer();
    a_at_b.host = HostSetting("dynamic".to_string());
    b_cfg.peers.insert(eid(A_EID), a_at_b);
    let b_store = Store::memory();
    let server = Engine::spawn(b_cfg, Arc::new(StaticDialplan::new()), b_store.clone())
        .await
        .expect("spawn registrar");

    // A registers to B.
    let mut a_cfg = base_config(A_EID);
    let mut b_at_a = outbound_peer(server.local_addr());
    b_at_a.register = true;
    a_cfg.peers.insert(eid(B_EID), b_at_a);
    let client = Engine::spawn(a_cfg, Arc::new(StaticDialplan::new()), Store::memory())
        .await
        .expect("spawn registrant");

    // Registration fires two seconds after startup.
    tokio::time::sleep(Duration::from_millis(3500)).await;

    let value = b_store
        .get(FAMILY_DPEERS, A_EID)
        .expect("dynamic registration persisted");
    let mut parts = value.rsplitn(2, ':');
    let expire: u32 = parts.next().expect("expire").parse().expect("number");
    assert_eq!(expire, 60);
    let addr = parts.next().expect("addr");
    assert_eq!(addr, client.local_addr().to_string());

    // The registrar's view of the peer now carries the learned address.
    let peers = server.peer_summaries().await.expect("summaries");
    let a = peers
        .iter()
        .find(|p| p.eid == eid(A_EID))
        .expect("peer known");
    assert_eq!(a.addr, Some(client.local_addr()));
    assert!(a.dynamic);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn registered_address_hydrates_on_restart() {
    // Persist a registration, then bring a registrar up on the same store.
    let store = Store::memory();
    store.put(FAMILY_DPEERS, A_EID, "127.0.0.1:14520:60");

    let mut cfg = base_config(B_EID);
    cfg.peers.insert(eid(A_EID), inbound_peer());
    let server = Engine::spawn(cfg, Arc::new(StaticDialplan::new()), store)
        .await
        .expect("spawn");

    let peers = server.peer_summaries().await.expect("summaries");
    let a = peers
        .iter()
        .find(|p| p.eid == eid(A_EID))
        .expect("peer known");
    assert_eq!(
        a.addr,
        Some("127.0.0.1:14520".parse().expect("addr")),
        "address not restored from the store"
    );
    server.stop().await;
}

#[tokio::test]
#[serial]
async fn unknown_registrants_are_refused() {
    // B knows nobody; a registering A gets NOAUTH and nothing persists.
    let b_cfg = base_config(B_EID);
    let b_store = Store::memory();
    let server = Engine::spawn(b_cfg, Arc::new(StaticDialplan::new()), b_store.clone())
        .await
        .expect("spawn registrar");

    let mut a_cfg = base_config(A_EID);
    let mut b_at_a = outbound_peer(server.local_addr());
    b_at_a.register = true;
    b_at_a.model = ModelKind::Outbound;
    a_cfg.peers.insert(eid(B_EID), b_at_a);
    let client = Engine::spawn(a_cfg, Arc::new(StaticDialplan::new()), Store::memory())
        .await
        .expect("spawn registrant");

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(b_store.get(FAMILY_DPEERS, A_EID), None);

    client.stop().await;
    server.stop().await;
}
