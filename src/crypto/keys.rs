// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::PathBuf};

use anyhow::{Context, Result, bail};
use rand_core::OsRng;
use rsa::{
    Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
};
use sha2::{Digest, Sha256};

use crate::models::RSA_BLOCK_LEN;

/// Loads named RSA keys from a directory: `<name>.pub` holds a peer's
/// public key, `<name>.key` our private key, both PEM (PKCS#8 or PKCS#1).
/// All keys are 1024-bit so that encrypted blocks and signatures are
/// exactly [`RSA_BLOCK_LEN`] bytes on the wire.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        KeyStore { dir: dir.into() }
    }

    pub fn public(&self, name: &str) -> Result<RsaPublicKey> {
        let path = self.dir.join(format!("{name}.pub"));
        let pem = fs::read_to_string(&path)
            .with_context(|| format!("no such public key '{name}' at {path:?}"))?;
        RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .with_context(|| format!("failed to parse public key '{name}'"))
    }

    pub fn private(&self, name: &str) -> Result<RsaPrivateKey> {
        let path = self.dir.join(format!("{name}.key"));
        let pem = fs::read_to_string(&path)
            .with_context(|| format!("no such private key '{name}' at {path:?}"))?;
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .with_context(|| format!("failed to parse private key '{name}'"))
    }
}

/// RSA-encrypts a 16-byte AES session key into one 128-byte block.
pub fn encrypt_block(key: &RsaPublicKey, data: &[u8]) -> Result<[u8; RSA_BLOCK_LEN]> {
    let enc = key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .context("RSA encrypt failed")?;
    let block: [u8; RSA_BLOCK_LEN] = match enc.try_into() {
        Ok(b) => b,
        Err(e) => bail!("weird encrypt size ({} != {RSA_BLOCK_LEN})", e.len()),
    };
    Ok(block)
}

/// Decrypts a 128-byte block back into the session key bytes.
pub fn decrypt_block(key: &RsaPrivateKey, block: &[u8]) -> Result<Vec<u8>> {
    key.decrypt(Pkcs1v15Encrypt, block)
        .context("RSA decrypt failed")
}

/// Signs a 128-byte encrypted key block; the signature is itself 128 bytes.
pub fn sign_block(key: &RsaPrivateKey, data: &[u8]) -> Result<[u8; RSA_BLOCK_LEN]> {
    let digest = Sha256::digest(data);
    let sig = key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .context("failed to sign key")?;
    let block: [u8; RSA_BLOCK_LEN] = match sig.try_into() {
        Ok(b) => b,
        Err(e) => bail!("weird signature size ({} != {RSA_BLOCK_LEN})", e.len()),
    };
    Ok(block)
}

/// Verifies the signature over an encrypted key block.
pub fn verify_block(key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}
