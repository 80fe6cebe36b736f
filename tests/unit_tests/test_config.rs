// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::{
    cfg::{
        config::Config,
        enums::{ModelKind, PeerOrder},
    },
    models::Tech,
};

const FULL_CONFIG: &str = r#"
general:
  port: 4520
  bindaddr: 0.0.0.0
  entityid: "00:11:22:33:44:55"
  ttl: 32
  autokill: 2000
  authdebug: true
  storehistory: true
  tos: lowdelay
  department: Engineering
  organization: Example Corp
  locality: San Francisco
  stateprov: CA
  country: US
  email: voip@example.com
  phone: "+14155550100"
mappings:
  e164:
    - lcontext: local-e164
      weight: 0
      tech: IAX2
      dest: "priv:${SECRET}@${IPADDR}/${NUMBER}"
      options: [nounsolicited, nopartial]
peers:
  "00:50:8b:ae:43:32":
    host: 203.0.113.5:4520
    inkey: peer_pub
    outkey: our_priv
    ustothem: "00:11:22:33:44:55"
    include: [e164, "!internal"]
    permit: [e164]
    register: true
    order: secondary
    qualify: yes
    model: symmetric
    precache: none
  "00:50:8b:ae:43:33":
    host: dynamic
    permit: [all]
    model: inbound
dialplan:
  local-e164:
    - "4155551212"
"#;

#[test]
fn full_config_parses() {
    let mut cfg: Config = serde_yaml::from_str(FULL_CONFIG).expect("yaml");
    cfg.validate_and_normalize().expect("valid");

    assert_eq!(cfg.general.ttl, 32);
    assert_eq!(cfg.general.autokill.timeout_ms(), 2000);
    assert!(cfg.general.authdebug);
    assert_eq!(cfg.general.tos.bits(), 0x10);
    assert_eq!(cfg.general.organization, "Example Corp");

    let maps = cfg.mappings.get("e164").expect("mapping");
    assert_eq!(maps.len(), 1);
    assert_eq!(maps[0].lcontext, "local-e164");
    assert_eq!(maps[0].weight, 0);
    assert_eq!(maps[0].tech, Tech::Iax2);

    assert_eq!(cfg.peers.len(), 2);
    let peer = cfg
        .peers
        .get(&"00:50:8b:ae:43:32".parse().expect("eid"))
        .expect("peer");
    assert_eq!(peer.order, PeerOrder::Secondary);
    assert_eq!(peer.model, ModelKind::Symmetric);
    assert!(peer.register);
    assert_eq!(peer.qualify.max_ms(), 2000);
    assert_eq!(peer.include, vec!["e164", "!internal"]);
    let dynamic = cfg
        .peers
        .get(&"00:50:8b:ae:43:33".parse().expect("eid"))
        .expect("peer");
    assert!(dynamic.host.is_dynamic());
}

#[test]
fn modelless_peers_are_discarded() {
    let yaml = r#"
general: {}
peers:
  "00:50:8b:ae:43:32":
    host: dynamic
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
    cfg.validate_and_normalize().expect("valid");
    assert!(cfg.peers.is_empty());
}

#[test]
fn conflicting_models_are_discarded() {
    let yaml = r#"
general: {}
peers:
  "00:50:8b:ae:43:32":
    host: dynamic
    model: inbound
    precache: outbound
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
    cfg.validate_and_normalize().expect("valid");
    assert!(cfg.peers.is_empty());
}

#[test]
fn out_of_range_settings_are_rejected() {
    let yaml = r#"
general:
  ttl: 0
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
    assert!(cfg.validate_and_normalize().is_err());

    let yaml = r#"
general: {}
mappings:
  e164:
    - lcontext: local
      weight: 60000
      tech: SIP
      dest: "sip:${NUMBER}@example"
"#;
    let mut cfg: Config = serde_yaml::from_str(yaml).expect("yaml");
    assert!(cfg.validate_and_normalize().is_err());
}

#[test]
fn invalid_entity_id_fails_parse() {
    let yaml = r#"
general:
  entityid: "not-an-eid"
"#;
    assert!(serde_yaml::from_str::<Config>(yaml).is_err());
}
