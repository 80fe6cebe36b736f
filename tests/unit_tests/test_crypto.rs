// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf};

use dundi_rs::{
    crypto::{
        KeyCheck, KeyStore, OutboundKey, SessionCipher, check_key, open_body, seal_body,
    },
    models::Eid,
};
use rand_core::OsRng;
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding},
};

fn temp_keydir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "dundi-keys-{tag}-{}",
        std::process::id()
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create keydir");
    dir
}

fn write_keypair(dir: &PathBuf, name: &str) -> RsaPrivateKey {
    let private = RsaPrivateKey::new(&mut OsRng, 1024).expect("generate key");
    let public = private.to_public_key();
    fs::write(
        dir.join(format!("{name}.key")),
        private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("encode private")
            .as_bytes(),
    )
    .expect("write private");
    fs::write(
        dir.join(format!("{name}.pub")),
        public
            .to_public_key_pem(LineEnding::LF)
            .expect("encode public"),
    )
    .expect("write public");
    private
}

#[test]
fn record_round_trip() {
    let cipher = SessionCipher::new(&[7u8; 16]);
    let body: Vec<u8> = (0..2000u16).map(|x| (x % 251) as u8).collect();
    let (iv, ciphertext) = seal_body(&cipher, &body).expect("seal");
    assert_eq!(ciphertext.len() % 16, 0);
    let opened = open_body(&cipher, &iv, &ciphertext).expect("open");
    assert_eq!(opened, body);
}

#[test]
fn wrong_key_never_silently_corrupts() {
    let cipher = SessionCipher::new(&[7u8; 16]);
    let other = SessionCipher::new(&[8u8; 16]);
    let body = b"02e164\x00415555".to_vec();
    let (iv, ciphertext) = seal_body(&cipher, &body).expect("seal");
    assert!(open_body(&other, &iv, &ciphertext).is_err());
}

#[test]
fn open_rejects_ragged_ciphertext() {
    let cipher = SessionCipher::new(&[7u8; 16]);
    assert!(open_body(&cipher, &[0u8; 16], &[1, 2, 3]).is_err());
    assert!(open_body(&cipher, &[0u8; 16], &[]).is_err());
}

#[test]
fn cbc_chains_blocks() {
    let cipher = SessionCipher::new(&[1u8; 16]);
    let iv = [9u8; 16];
    let plain = [0u8; 48];
    let ct = cipher.cbc_encrypt(&iv, &plain);
    // Identical plaintext blocks must not produce identical ciphertext.
    assert_ne!(ct[0..16], ct[16..32]);
    assert_ne!(ct[16..32], ct[32..48]);
    assert_eq!(cipher.cbc_decrypt(&iv, &ct), plain);
}

#[test]
fn key_exchange_validates_and_installs() {
    let dir = temp_keydir("exchange");
    // "alice" wraps a session key for "bob": encrypted with bob's public
    // key, signed with alice's private key.
    write_keypair(&dir, "alice");
    write_keypair(&dir, "bob");
    let keystore = KeyStore::new(&dir);
    let alice_eid: Eid = "00:11:22:33:44:55".parse().expect("eid");

    let outbound =
        OutboundKey::establish(&keystore, "bob", "alice").expect("establish");

    // Bob's side: no cached key, full material offered.
    let check = check_key(
        None,
        Some(outbound.shared_key()),
        Some(outbound.signature()),
        None,
        &keystore,
        "alice",
        "bob",
        &alice_eid,
    )
    .expect("check");
    let installed = match check {
        KeyCheck::Installed(key) => key,
        other => panic!("expected install, got {other:?}"),
    };
    assert_eq!(installed.keycrc32, outbound.keycrc32);

    // Both ends must hold the same raw key: a record sealed by the sender
    // opens with the receiver's contexts.
    let (iv, ct) = seal_body(&outbound.cipher, b"ping").expect("seal");
    assert_eq!(open_body(&installed.cipher, &iv, &ct).expect("open"), b"ping");

    // Fast path: the CRC alone authorizes the cached contexts.
    let check = check_key(
        Some(&installed),
        None,
        None,
        Some(outbound.keycrc32),
        &keystore,
        "alice",
        "bob",
        &alice_eid,
    )
    .expect("check");
    assert!(matches!(check, KeyCheck::Cached));

    // A stale CRC with no material to validate is a rejection.
    let check = check_key(
        Some(&installed),
        None,
        None,
        Some(outbound.keycrc32 ^ 1),
        &keystore,
        "alice",
        "bob",
        &alice_eid,
    )
    .expect("check");
    assert!(matches!(check, KeyCheck::Reject));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn tampered_key_material_is_rejected() {
    let dir = temp_keydir("tamper");
    write_keypair(&dir, "alice");
    write_keypair(&dir, "bob");
    let keystore = KeyStore::new(&dir);
    let alice_eid: Eid = "00:11:22:33:44:55".parse().expect("eid");

    let outbound =
        OutboundKey::establish(&keystore, "bob", "alice").expect("establish");
    let mut bad_key = [0u8; 128];
    bad_key.copy_from_slice(outbound.shared_key());
    bad_key[0] ^= 0xff;

    let check = check_key(
        None,
        Some(&bad_key),
        Some(outbound.signature()),
        None,
        &keystore,
        "alice",
        "bob",
        &alice_eid,
    )
    .expect("check");
    assert!(matches!(check, KeyCheck::Reject));

    let _ = fs::remove_dir_all(&dir);
}
