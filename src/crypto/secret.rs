// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngExt;
use tracing::debug;

use crate::{
    store::{KvStore, Store},
    utils::now_secs,
};

/// How long one shared secret stays current before rotating to `prev`.
pub const SECRET_TIME: u64 = 3600;

/// The rolling shared secret exposed to destination templates as
/// `${SECRET}`. Persisted under the configured secret path as
/// `prev;current` plus a separate expiry key, so restarts keep honouring
/// secrets handed out before the rotation.
#[derive(Debug, Clone)]
pub struct RollingSecret {
    family: String,
    current: String,
    rotate_at: u64,
}

fn build_secret() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill(&mut raw);
    let mut secret = STANDARD.encode(raw);
    // The secret travels inside colon/at separated dial strings.
    secret = secret.replace([';', '/', ':', '@'], "+");
    secret
}

impl RollingSecret {
    /// Restores the secret pair from the store, keeping the current secret
    /// if it is still inside its lifetime and rotating otherwise.
    pub fn load(store: &Store, family: &str) -> Self {
        let mut current = None;
        let mut last = None;
        let mut rotate_at = 0;
        if let Some(expiry) = store.get(family, "secretexpiry")
            && let Ok(expired) = expiry.trim().parse::<u64>()
        {
            let stored = store.get(family, "secret").unwrap_or_default();
            let cur = match stored.split_once(';') {
                Some((_prev, c)) => c.to_string(),
                None => stored,
            };
            let now = now_secs();
            if now < expired {
                // Still valid; clamp a bogus far-future expiry.
                rotate_at = expired.min(now + SECRET_TIME);
                current = Some(cur);
            } else if now < expired + SECRET_TIME {
                // One rotation behind; the stored current becomes prev.
                last = Some(cur);
            }
        }
        let mut secret = RollingSecret {
            family: family.to_string(),
            current: String::new(),
            rotate_at,
        };
        match current {
            Some(cur) => secret.current = cur,
            None => secret.rotate(store, last),
        }
        secret
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    /// Rotates if the current secret's lifetime has elapsed.
    pub fn check(&mut self, store: &Store) {
        if now_secs() >= self.rotate_at {
            let old = self.current.clone();
            self.rotate(store, (!old.is_empty()).then_some(old));
        }
    }

    fn rotate(&mut self, store: &Store, old: Option<String>) {
        self.current = build_secret();
        self.rotate_at = now_secs() + SECRET_TIME;
        let value = match old {
            Some(old) => format!("{old};{}", self.current),
            None => self.current.clone(),
        };
        store.put(&self.family, "secret", &value);
        store.put(&self.family, "secretexpiry", &self.rotate_at.to_string());
        debug!(family = %self.family, "rotated shared secret");
    }
}
