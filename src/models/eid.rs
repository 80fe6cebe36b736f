// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, str::FromStr};

use rand::RngExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zerocopy::{FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::models::IeError;

/// A DUNDi Entity Identifier: six raw bytes, usually seeded from a MAC
/// address. The all-zero EID means "unknown / local".
///
/// Two canonical text forms exist on the management surface:
/// the long form `00:50:8b:ae:43:32` and the short form `00508BAE4332`
/// used inside cache keys.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    ZFromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct Eid(pub [u8; 6]);

impl Eid {
    pub const LEN: usize = 6;

    pub const fn zero() -> Self {
        Eid([0u8; 6])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Generates a random locally-administered EID for hosts without a
    /// configured `entityid`.
    pub fn generate() -> Self {
        let mut eid = [0u8; 6];
        rand::rng().fill(&mut eid);
        // Locally administered, unicast.
        eid[0] = (eid[0] | 0x02) & !0x01;
        Eid(eid)
    }

    /// Parses the short `XXXXXXXXXXXX` form used in cache keys.
    pub fn parse_short(s: &str) -> Result<Self, IeError> {
        let raw = hex::decode(s).map_err(|_| IeError::BadEid)?;
        let bytes: [u8; 6] = raw.try_into().map_err(|_| IeError::BadEid)?;
        Ok(Eid(bytes))
    }

    /// Short form: twelve upper-case hex digits, no separators.
    pub fn to_short(&self) -> String {
        let mut s = String::with_capacity(12);
        for b in &self.0 {
            s.push_str(&format!("{b:02X}"));
        }
        s
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, IeError> {
        let bytes: [u8; 6] = raw.try_into().map_err(|_| IeError::BadEid)?;
        Ok(Eid(bytes))
    }
}

impl FromStr for Eid {
    type Err = IeError;

    /// Parses the long `xx:xx:xx:xx:xx:xx` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut eid = [0u8; 6];
        let mut parts = s.split(':');
        for b in &mut eid {
            let part = parts.next().ok_or(IeError::BadEid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(IeError::BadEid);
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| IeError::BadEid)?;
        }
        if parts.next().is_some() {
            return Err(IeError::BadEid);
        }
        Ok(Eid(eid))
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for Eid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid entity id '{s}'")))
    }
}
