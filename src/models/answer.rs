// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Flags carried inside an ANSWER information element (16 wire bits).
    /// The `NOPARTIAL` bit is configuration-internal and never leaves the
    /// host.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AnswerFlags: u32 {
        const EXISTS         = 1 << 0;
        const MATCHMORE      = 1 << 1;
        const CANMATCH       = 1 << 2;
        const IGNOREPAT      = 1 << 3;
        const RESIDENTIAL    = 1 << 4;
        const COMMERCIAL     = 1 << 5;
        const MOBILE         = 1 << 6;
        const NOUNSOLICITED  = 1 << 7;
        const NOCOMUNSOLICIT = 1 << 8;
        const NOPARTIAL      = 1 << 17;
    }
}

impl AnswerFlags {
    pub fn wire(self) -> u16 {
        (self.bits() & 0xffff) as u16
    }

    pub fn from_wire(raw: u16) -> Self {
        AnswerFlags::from_bits_truncate(raw as u32)
    }
}

impl fmt::Display for AnswerFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (AnswerFlags::EXISTS, "EXISTS"),
            (AnswerFlags::MATCHMORE, "MATCHMORE"),
            (AnswerFlags::CANMATCH, "CANMATCH"),
            (AnswerFlags::IGNOREPAT, "IGNOREPAT"),
            (AnswerFlags::RESIDENTIAL, "RESIDENCE"),
            (AnswerFlags::COMMERCIAL, "COMMERCIAL"),
            (AnswerFlags::MOBILE, "MOBILE"),
            (AnswerFlags::NOUNSOLICITED, "NOUNSLCTD"),
            (AnswerFlags::NOCOMUNSOLICIT, "NOCOMUNSLTD"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

bitflags! {
    /// Flags carried inside a HINT information element.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct HintFlags: u16 {
        const TTL_EXPIRED = 1 << 0;
        const DONT_ASK    = 1 << 1;
        const UNAFFECTED  = 1 << 2;
    }
}

impl fmt::Display for HintFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (HintFlags::TTL_EXPIRED, "TTLEXPIRED"),
            (HintFlags::DONT_ASK, "DONTASK"),
            (HintFlags::UNAFFECTED, "UNAFFECTED"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// Routing technology named by an answer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tech {
    #[default]
    #[serde(rename = "None")]
    None,
    #[serde(rename = "IAX2", alias = "IAX", alias = "iax", alias = "iax2")]
    Iax2,
    #[serde(rename = "SIP", alias = "sip")]
    Sip,
    #[serde(rename = "H323", alias = "h323")]
    H323,
}

impl Tech {
    pub fn wire(self) -> u8 {
        match self {
            Tech::None => 0,
            Tech::Iax2 => 1,
            Tech::Sip => 2,
            Tech::H323 => 3,
        }
    }

    pub fn from_wire(raw: u8) -> Self {
        match raw {
            1 => Tech::Iax2,
            2 => Tech::Sip,
            3 => Tech::H323,
            _ => Tech::None,
        }
    }
}

impl fmt::Display for Tech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tech::None => "None",
            Tech::Iax2 => "IAX2",
            Tech::Sip => "SIP",
            Tech::H323 => "H323",
        })
    }
}
