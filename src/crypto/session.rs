// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use aes::{
    Aes128,
    cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray},
};
use anyhow::{Context, Result, bail};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use rand::RngExt;
use tracing::debug;

use crate::{
    crypto::keys::{self, KeyStore},
    models::{AES_BLOCK_LEN, Eid, MAX_PACKET_SIZE, RSA_BLOCK_LEN},
    utils::crc32,
};

/// Lifetime of a per-peer AES session key.
pub const KEY_EXPIRE: Duration = Duration::from_secs(3600);

/// AES-128 contexts for one session key, usable in both directions.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Aes128,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher")
    }
}

impl SessionCipher {
    pub fn new(key: &[u8; AES_BLOCK_LEN]) -> Self {
        SessionCipher {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// CBC-encrypts `plain` (length must be a multiple of 16) under `iv`.
    pub fn cbc_encrypt(&self, iv: &[u8; AES_BLOCK_LEN], plain: &[u8]) -> Vec<u8> {
        debug_assert_eq!(plain.len() % AES_BLOCK_LEN, 0);
        let mut out = Vec::with_capacity(plain.len());
        let mut chain = *iv;
        for block in plain.chunks_exact(AES_BLOCK_LEN) {
            for (c, p) in chain.iter_mut().zip(block) {
                *c ^= p;
            }
            let mut buf = GenericArray::clone_from_slice(&chain);
            self.cipher.encrypt_block(&mut buf);
            chain.copy_from_slice(&buf);
            out.extend_from_slice(&buf);
        }
        out
    }

    /// CBC-decrypts `ciphertext` (length must be a multiple of 16).
    pub fn cbc_decrypt(&self, iv: &[u8; AES_BLOCK_LEN], ciphertext: &[u8]) -> Vec<u8> {
        debug_assert_eq!(ciphertext.len() % AES_BLOCK_LEN, 0);
        let mut out = Vec::with_capacity(ciphertext.len());
        let mut chain = *iv;
        for block in ciphertext.chunks_exact(AES_BLOCK_LEN) {
            let mut buf = GenericArray::clone_from_slice(block);
            self.cipher.decrypt_block(&mut buf);
            for (b, c) in buf.iter_mut().zip(&chain) {
                *b ^= c;
            }
            chain.copy_from_slice(block);
            out.extend_from_slice(&buf);
        }
        out
    }
}

/// Compresses and encrypts a frame body (everything after the 6-byte clear
/// header prefix), returning the fresh IV and the ciphertext for ENCDATA.
pub fn seal_body(
    cipher: &SessionCipher,
    body: &[u8],
) -> Result<([u8; AES_BLOCK_LEN], Vec<u8>)> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body).context("compression failed")?;
    let mut compressed = enc.finish().context("compression failed")?;
    // Zero-pad to the AES block size.
    let padded = compressed.len().div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN;
    compressed.resize(padded, 0);
    let mut iv = [0u8; AES_BLOCK_LEN];
    rand::rng().fill(&mut iv);
    let ciphertext = cipher.cbc_encrypt(&iv, &compressed);
    Ok((iv, ciphertext))
}

/// Decrypts and inflates an ENCDATA record back into a frame body. The
/// inflate output is hard-capped at the frame MTU so a hostile stream
/// cannot balloon.
pub fn open_body(
    cipher: &SessionCipher,
    iv: &[u8; AES_BLOCK_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_LEN != 0 {
        bail!("invalid encrypted data length {}", ciphertext.len());
    }
    let padded = cipher.cbc_decrypt(iv, ciphertext);
    let mut body = Vec::new();
    let mut dec = ZlibDecoder::new(&padded[..]).take(MAX_PACKET_SIZE as u64 + 1);
    dec.read_to_end(&mut body).context("uncompress failed")?;
    if body.len() > MAX_PACKET_SIZE {
        bail!("decompressed frame exceeds {MAX_PACKET_SIZE} bytes");
    }
    Ok(body)
}

/// The session key we generated for a peer: the RSA-wrapped and signed key
/// material we transmit, its CRC fast-path tag, and the AES contexts bound
/// to the raw key.
#[derive(Debug, Clone)]
pub struct OutboundKey {
    /// `enc(key)[0..128] ∥ sign(enc(key))[128..256]`, ready for the
    /// SHAREDKEY and SIGNATURE elements.
    pub wrapped: [u8; RSA_BLOCK_LEN * 2],
    /// CRC-32 over the encrypted half, advertised via KEYCRC32.
    pub keycrc32: u32,
    pub cipher: SessionCipher,
    pub sent_full: bool,
    expires_at: Instant,
}

impl OutboundKey {
    /// Generates a fresh random session key for a peer, wrapping it with
    /// their public key and signing with our private key.
    pub fn establish(keystore: &KeyStore, inkey: &str, outkey: &str) -> Result<Self> {
        let their_public = keystore.public(inkey)?;
        let our_private = keystore.private(outkey)?;
        let mut key = [0u8; AES_BLOCK_LEN];
        rand::rng().fill(&mut key);
        let enc = keys::encrypt_block(&their_public, &key)?;
        let sig = keys::sign_block(&our_private, &enc)?;
        let mut wrapped = [0u8; RSA_BLOCK_LEN * 2];
        wrapped[..RSA_BLOCK_LEN].copy_from_slice(&enc);
        wrapped[RSA_BLOCK_LEN..].copy_from_slice(&sig);
        Ok(OutboundKey {
            wrapped,
            keycrc32: crc32(&enc),
            cipher: SessionCipher::new(&key),
            sent_full: false,
            expires_at: Instant::now() + KEY_EXPIRE,
        })
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn shared_key(&self) -> &[u8] {
        &self.wrapped[..RSA_BLOCK_LEN]
    }

    pub fn signature(&self) -> &[u8] {
        &self.wrapped[RSA_BLOCK_LEN..]
    }
}

/// The session key a peer negotiated towards us.
#[derive(Debug, Clone)]
pub struct InboundKey {
    pub wrapped: [u8; RSA_BLOCK_LEN * 2],
    pub keycrc32: u32,
    pub cipher: SessionCipher,
}

/// Outcome of validating inbound key material.
#[derive(Debug)]
pub enum KeyCheck {
    /// The cached session key still applies.
    Cached,
    /// A fresh key passed signature and decryption; install it.
    Installed(Box<InboundKey>),
    /// Nothing matched and nothing validated.
    Reject,
}

/// Validates the key reference carried by the first encrypted frame of a
/// dialog: either a KEYCRC32 matching the cached key, or a full
/// SHAREDKEY+SIGNATURE pair checked against the peer's public key and
/// unwrapped with our private key.
#[allow(clippy::too_many_arguments)]
pub fn check_key(
    current: Option<&InboundKey>,
    newkey: Option<&[u8]>,
    newsig: Option<&[u8]>,
    keycrc32: Option<u32>,
    keystore: &KeyStore,
    inkey: &str,
    outkey: &str,
    peer: &Eid,
) -> Result<KeyCheck> {
    if let Some(cached) = current {
        if let Some(crc) = keycrc32 {
            debug!(expected = format!("{:08x}", cached.keycrc32),
                   got = format!("{crc:08x}"), "key crc fast path");
            if cached.keycrc32 == crc {
                return Ok(KeyCheck::Cached);
            }
        }
    }
    let (Some(newkey), Some(newsig)) = (newkey, newsig) else {
        return Ok(KeyCheck::Reject);
    };
    if let Some(cached) = current {
        if &cached.wrapped[..RSA_BLOCK_LEN] == newkey
            && &cached.wrapped[RSA_BLOCK_LEN..] == newsig
        {
            return Ok(KeyCheck::Cached);
        }
    }
    let their_public = keystore
        .public(inkey)
        .with_context(|| format!("unable to find key to verify shared key from '{peer}'"))?;
    let our_private = keystore
        .private(outkey)
        .with_context(|| format!("unable to find key to decode shared key from '{peer}'"))?;
    if !keys::verify_block(&their_public, newkey, newsig) {
        return Ok(KeyCheck::Reject);
    }
    let raw = keys::decrypt_block(&our_private, newkey)?;
    let key: [u8; AES_BLOCK_LEN] = match raw.try_into() {
        Ok(k) => k,
        Err(r) => {
            debug!(len = r.len(), "key decoded to the wrong size");
            return Ok(KeyCheck::Reject);
        },
    };
    debug!(%peer, "new key combo passed signature and decrypt");
    let mut wrapped = [0u8; RSA_BLOCK_LEN * 2];
    wrapped[..RSA_BLOCK_LEN].copy_from_slice(newkey);
    wrapped[RSA_BLOCK_LEN..].copy_from_slice(newsig);
    Ok(KeyCheck::Installed(Box::new(InboundKey {
        wrapped,
        keycrc32: crc32(newkey),
        cipher: SessionCipher::new(&key),
    })))
}
