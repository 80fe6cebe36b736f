// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc};

use dundi_rs::{
    Eid, Engine, StaticDialplan, Store,
    cfg::{
        config::{Config, HostSetting, MappingConfig, PeerConfig},
        enums::ModelKind,
    },
    models::Tech,
};

pub const A_EID: &str = "00:aa:aa:aa:aa:01";
pub const B_EID: &str = "00:bb:bb:bb:bb:02";

pub fn eid(s: &str) -> Eid {
    s.parse().expect("valid eid")
}

/// A config bound to an ephemeral loopback port, with a short TTL so test
/// budgets stay in the low seconds.
pub fn base_config(entity: &str) -> Config {
    let mut cfg = Config::default();
    cfg.general.bindaddr = "127.0.0.1".parse().expect("loopback");
    cfg.general.port = 0;
    cfg.general.entityid = Some(eid(entity));
    cfg.general.ttl = 2;
    cfg
}

pub fn mapping(lcontext: &str, weight: u16, dest: &str) -> MappingConfig {
    MappingConfig {
        lcontext: lcontext.to_string(),
        weight,
        tech: Tech::Iax2,
        dest: dest.to_string(),
        options: Vec::new(),
    }
}

pub fn outbound_peer(addr: SocketAddr) -> PeerConfig {
    PeerConfig {
        host: HostSetting(addr.to_string()),
        model: ModelKind::Outbound,
        include: vec!["e164".to_string()],
        ..Default::default()
    }
}

pub fn inbound_peer() -> PeerConfig {
    PeerConfig {
        host: HostSetting("dynamic".to_string()),
        model: ModelKind::Inbound,
        permit: vec!["e164".to_string()],
        ..Default::default()
    }
}

/// Spawns a responder that maps `e164` onto a static dialplan holding the
/// given extensions, permitting queries from `from`.
pub async fn spawn_server(entity: &str, from: &str, extens: &[&str]) -> Engine {
    let mut cfg = base_config(entity);
    cfg.mappings.insert(
        "e164".to_string(),
        vec![mapping("local", 50, "guest@${NUMBER}")],
    );
    cfg.peers.insert(eid(from), inbound_peer());
    let mut plan = StaticDialplan::new();
    for e in extens {
        plan.add_extension("local", e);
    }
    Engine::spawn(cfg, Arc::new(plan), Store::memory())
        .await
        .expect("spawn server")
}

/// Spawns a querier with one outbound peer.
pub async fn spawn_client(
    entity: &str,
    peer: &str,
    peer_addr: SocketAddr,
) -> (Engine, Store) {
    let mut cfg = base_config(entity);
    cfg.peers.insert(eid(peer), outbound_peer(peer_addr));
    let store = Store::memory();
    let engine = Engine::spawn(cfg, Arc::new(StaticDialplan::new()), store.clone())
        .await
        .expect("spawn client");
    (engine, store)
}
