// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::{
    cfg::{config::PeerConfig, enums::ModelKind},
    models::Eid,
    peer::{Model, Peer, Permission, has_permission},
};

fn perms(raw: &[&str]) -> Vec<Permission> {
    raw.iter().map(|s| Permission::parse(s)).collect()
}

#[test]
fn last_matching_entry_wins() {
    let list = perms(&["all", "!priv"]);
    assert!(has_permission(&list, "e164"));
    assert!(!has_permission(&list, "priv"));

    // Re-allowing later overrides an earlier deny.
    let list = perms(&["!priv", "priv"]);
    assert!(has_permission(&list, "priv"));
}

#[test]
fn empty_list_denies() {
    assert!(!has_permission(&[], "e164"));
}

#[test]
fn all_matches_anything_case_insensitively() {
    let list = perms(&["ALL"]);
    assert!(has_permission(&list, "e164"));
    let list = perms(&["E164"]);
    assert!(has_permission(&list, "e164"));
}

#[test]
fn model_conversion() {
    assert_eq!(Model::from(ModelKind::None), Model::empty());
    assert_eq!(Model::from(ModelKind::Inbound), Model::INBOUND);
    assert_eq!(Model::from(ModelKind::Outbound), Model::OUTBOUND);
    assert_eq!(
        Model::from(ModelKind::Symmetric),
        Model::INBOUND | Model::OUTBOUND
    );
    assert_eq!(Model::from(ModelKind::Symmetric).to_string(), "Symmetric");
}

fn peer_with(host: &str, qualify_ms: u32) -> Peer {
    let cfg = PeerConfig {
        host: serde_yaml::from_str(&format!("\"{host}\"")).expect("host"),
        model: ModelKind::Outbound,
        qualify: if qualify_ms > 0 {
            serde_yaml::from_str(&qualify_ms.to_string()).expect("qualify")
        } else {
            Default::default()
        },
        ..Default::default()
    };
    let eid: Eid = "00:50:8b:ae:43:32".parse().expect("eid");
    let us: Eid = "00:11:22:33:44:55".parse().expect("eid");
    Peer::from_config(eid, &cfg, us)
}

#[test]
fn dynamic_peers_start_unaddressed() {
    let peer = peer_with("dynamic", 0);
    assert!(peer.dynamic);
    assert!(peer.addr.is_none());
    assert!(!peer.reachable());
}

#[test]
fn static_peers_resolve_with_default_port() {
    let peer = peer_with("127.0.0.1", 0);
    assert!(!peer.dynamic);
    let addr = peer.addr.expect("resolved");
    assert_eq!(addr.port(), 4520);
    assert!(peer.reachable());
}

#[test]
fn qualify_gates_reachability() {
    let mut peer = peer_with("127.0.0.1:4520", 500);
    assert_eq!(peer.maxms, 500);
    // Unknown latency still counts as reachable.
    peer.lastms = 0;
    assert!(peer.reachable());
    peer.lastms = 120;
    assert!(peer.reachable());
    peer.lastms = 500;
    assert!(!peer.reachable(), "at the ceiling is too slow");
    peer.lastms = -1;
    assert!(!peer.reachable(), "unreachable after timeout");
}

#[test]
fn history_ring_holds_ten_and_averages() {
    let mut peer = peer_with("127.0.0.1:4520", 0);
    for x in 0..12u32 {
        peer.record_lookup(format!("55{x}@e164"), 100 + x);
    }
    assert_eq!(peer.history.len(), 10);
    // Newest sample first, oldest two dropped.
    assert_eq!(peer.history[0].0, "5511@e164");
    assert_eq!(peer.history[9].0, "552@e164");
    let expected: u32 = (102..=111).sum::<u32>() / 10;
    assert_eq!(peer.avgms, expected);
}
