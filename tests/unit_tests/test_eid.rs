// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::models::Eid;

#[test]
fn long_form_round_trip() {
    let eid: Eid = "00:50:8b:ae:43:32".parse().expect("valid eid");
    assert_eq!(eid.0, [0x00, 0x50, 0x8b, 0xae, 0x43, 0x32]);
    assert_eq!(eid.to_string(), "00:50:8b:ae:43:32");
}

#[test]
fn short_form_round_trip() {
    let eid: Eid = "00:50:8b:ae:43:32".parse().expect("valid eid");
    assert_eq!(eid.to_short(), "00508BAE4332");
    assert_eq!(Eid::parse_short("00508BAE4332").expect("short form"), eid);
    assert_eq!(Eid::parse_short("00508bae4332").expect("lower hex"), eid);
}

#[test]
fn rejects_malformed_text() {
    assert!("00:50:8b:ae:43".parse::<Eid>().is_err());
    assert!("00:50:8b:ae:43:32:11".parse::<Eid>().is_err());
    assert!("zz:50:8b:ae:43:32".parse::<Eid>().is_err());
    assert!("00508BAE43".parse::<Eid>().is_err());
    assert!(Eid::parse_short("00508BAE43").is_err());
    assert!(Eid::parse_short("00508BAE4332FF").is_err());
}

#[test]
fn zero_eid_is_reserved() {
    assert!(Eid::zero().is_zero());
    assert!(!"00:00:00:00:00:01".parse::<Eid>().expect("eid").is_zero());
}

#[test]
fn generated_eids_are_locally_administered_unicast() {
    for _ in 0..32 {
        let eid = Eid::generate();
        assert!(!eid.is_zero());
        assert_eq!(eid.0[0] & 0x02, 0x02, "locally administered bit");
        assert_eq!(eid.0[0] & 0x01, 0x00, "unicast bit");
    }
}
