// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dundi_rs::models::{
    AnswerFlags, Cause, Eid, FrameHeader, HEADER_LEN, HintFlags, IeBuilder, IeError,
    IeId, parse_ies,
};
use hex_literal::hex;

fn eid(last: u8) -> Eid {
    Eid([0x00, 0x50, 0x8b, 0xae, 0x43, last])
}

#[test]
fn header_parses_big_endian_fields() {
    let raw = hex!("7f fe 0012 03 04 81 00");
    let hdr = FrameHeader::parse(&raw).expect("header");
    assert_eq!(hdr.src_trans(), 0x7ffe);
    assert_eq!(hdr.dst_trans(), 0x0012);
    assert_eq!(hdr.iseqno, 3);
    assert_eq!(hdr.oseqno, 4);
    assert!(hdr.is_final());
    assert_eq!(hdr.command_raw(), 1);
    assert!(!hdr.reserved_bit());
    assert!(!hdr.retransmitted());
}

#[test]
fn header_reserved_and_retransmit_bits() {
    let raw = hex!("8001 8002 00 00 01 00");
    let hdr = FrameHeader::parse(&raw).expect("header");
    assert!(hdr.reserved_bit());
    assert!(hdr.retransmitted());
    assert_eq!(hdr.src_trans(), 1);
    assert_eq!(hdr.dst_trans(), 2);
}

#[test]
fn full_frame_round_trip() {
    let mut ied = IeBuilder::new();
    ied.short(IeId::Version, 1).expect("version");
    ied.eid(IeId::EidDirect, &eid(1)).expect("us");
    ied.eid(IeId::Eid, &eid(2)).expect("stack");
    ied.str(IeId::CalledNumber, "4155551212").expect("number");
    ied.str(IeId::CalledContext, "e164").expect("context");
    ied.short(IeId::Ttl, 31).expect("ttl");
    ied.answer(
        &eid(3),
        1,
        AnswerFlags::EXISTS | AnswerFlags::MOBILE,
        400,
        "guest@example/4155551212",
    )
    .expect("answer");
    ied.hint(HintFlags::DONT_ASK, "415").expect("hint");
    ied.short(IeId::Expiration, 3600).expect("expiration");
    ied.int(IeId::KeyCrc32, 0xdeadbeef).expect("crc");
    ied.cause(Cause::Success, "").expect("cause");
    ied.empty(IeId::CacheBypass).expect("cbypass");

    let ies = parse_ies(ied.as_slice()).expect("parse");
    assert_eq!(ies.version, Some(1));
    assert_eq!(ies.eids, vec![eid(1), eid(2)]);
    assert_eq!(ies.eid_direct, vec![true, false]);
    assert_eq!(ies.called_number, Some("4155551212"));
    assert_eq!(ies.called_context, Some("e164"));
    assert_eq!(ies.ttl, Some(31));
    assert_eq!(ies.answers.len(), 1);
    let ans = &ies.answers[0];
    assert_eq!(ans.eid, eid(3));
    assert_eq!(ans.protocol, 1);
    assert_eq!(ans.flags, AnswerFlags::EXISTS | AnswerFlags::MOBILE);
    assert_eq!(ans.weight, 400);
    assert_eq!(ans.dest, "guest@example/4155551212");
    let hint = ies.hint.expect("hint");
    assert_eq!(hint.flags, HintFlags::DONT_ASK);
    assert_eq!(hint.exten, "415");
    assert_eq!(ies.expiration, Some(3600));
    assert_eq!(ies.keycrc32, Some(0xdeadbeef));
    assert_eq!(ies.cause, Some(0));
    assert!(ies.cbypass);
}

#[test]
fn unknown_ies_are_skipped_without_corrupting_later_ones() {
    let mut buf = Vec::new();
    // An element with an id nobody assigned.
    buf.extend_from_slice(&[200, 3, 1, 2, 3]);
    let mut ied = IeBuilder::new();
    ied.short(IeId::Ttl, 7).expect("ttl");
    buf.extend_from_slice(ied.as_slice());
    let ies = parse_ies(&buf).expect("parse");
    assert_eq!(ies.ttl, Some(7));
}

#[test]
fn truncated_element_fails_the_frame() {
    // Claims 10 value bytes but only 2 remain.
    let buf = [6u8, 10, 0, 1];
    assert_eq!(parse_ies(&buf), Err(IeError::Truncated));
}

#[test]
fn encdata_consumes_the_remainder() {
    let iv = [0xaau8; 16];
    let ciphertext = vec![0x55u8; 320];
    let mut ied = IeBuilder::new();
    ied.encdata(&iv, &ciphertext).expect("encdata");
    // The declared length byte cannot express 336 bytes, the parser must
    // take the remainder of the frame regardless.
    let ies = parse_ies(ied.as_slice()).expect("parse");
    let block = ies.encblock.expect("encblock");
    assert_eq!(block.iv, iv);
    assert_eq!(block.data, &ciphertext[..]);
}

#[test]
fn builder_rejects_overflowing_datagram() {
    let mut ied = IeBuilder::new();
    let chunk = [0u8; 255];
    loop {
        match ied.raw(IeId::SharedKey, &chunk) {
            Ok(()) => continue,
            Err(IeError::Overflow(name, _)) => {
                assert_eq!(name, "SHAREDKEY");
                break;
            },
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(ied.len() <= IeBuilder::CAPACITY);
    assert!(ied.len() + HEADER_LEN <= 8192);
}

#[test]
fn oversized_string_value_is_refused() {
    let mut ied = IeBuilder::new();
    let long = "9".repeat(300);
    assert!(matches!(
        ied.str(IeId::CalledNumber, &long),
        Err(IeError::ValueTooLong(300))
    ));
}

#[test]
fn answer_cap_per_frame_is_enforced() {
    let mut ied = IeBuilder::new();
    for x in 0..110u16 {
        ied.answer(&eid(9), 2, AnswerFlags::EXISTS, x, "sip:x@y")
            .expect("answer");
    }
    let ies = parse_ies(ied.as_slice()).expect("parse");
    assert_eq!(ies.answers.len(), 100);
}
