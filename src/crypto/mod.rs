// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end security: RSA-wrapped AES-128 session keys, the encrypted
//! record codec, and the rolling shared secret.

/// RSA key loading and fixed-block operations.
pub mod keys;
/// Rolling shared secret for destination templates.
pub mod secret;
/// AES session keys and the encrypted record codec.
pub mod session;

pub use keys::KeyStore;
pub use secret::RollingSecret;
pub use session::{
    InboundKey, KEY_EXPIRE, KeyCheck, OutboundKey, SessionCipher, check_key, open_body,
    seal_body,
};
