// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

/// Boolean enumeration with string serialization support
///
/// Represents yes/no values with support for various string representations
/// including "Yes"/"No", "true"/"false", and "1"/"0".
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    #[serde(
        rename = "Yes",
        alias = "yes",
        alias = "YES",
        alias = "true",
        alias = "True",
        alias = "1"
    )]
    Yes,
    #[serde(
        rename = "No",
        alias = "no",
        alias = "NO",
        alias = "false",
        alias = "False",
        alias = "0"
    )]
    No,
}

impl fmt::Display for YesNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            YesNo::Yes => "Yes",
            YesNo::No => "No",
        })
    }
}

impl From<bool> for YesNo {
    fn from(b: bool) -> Self {
        if b { YesNo::Yes } else { YesNo::No }
    }
}

impl YesNo {
    pub fn as_bool(self) -> bool {
        matches!(self, YesNo::Yes)
    }
}

/// Peer consultation order class; lookups exhaust one class before
/// descending to the next.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerOrder {
    #[default]
    #[serde(rename = "primary", alias = "Primary")]
    Primary,
    #[serde(rename = "secondary", alias = "Secondary")]
    Secondary,
    #[serde(rename = "tertiary", alias = "Tertiary")]
    Tertiary,
    #[serde(rename = "quartiary", alias = "Quartiary")]
    Quartiary,
}

impl PeerOrder {
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PeerOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerOrder::Primary => "Primary",
            PeerOrder::Secondary => "Secondary",
            PeerOrder::Tertiary => "Tertiary",
            PeerOrder::Quartiary => "Quartiary",
        })
    }
}

/// Traffic model of a peer relationship, separately configurable for query
/// traffic (`model`) and precache traffic (`precache`).
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    #[default]
    #[serde(rename = "none", alias = "None")]
    None,
    #[serde(rename = "inbound", alias = "Inbound")]
    Inbound,
    #[serde(rename = "outbound", alias = "Outbound")]
    Outbound,
    #[serde(rename = "symmetric", alias = "Symmetric")]
    Symmetric,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelKind::None => "None",
            ModelKind::Inbound => "Inbound",
            ModelKind::Outbound => "Outbound",
            ModelKind::Symmetric => "Symmetric",
        })
    }
}

/// `qualify` accepts yes/no or an explicit latency ceiling in ms.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum QualifySetting {
    Flag(YesNo),
    MaxMs(u32),
}

impl Default for QualifySetting {
    fn default() -> Self {
        QualifySetting::Flag(YesNo::No)
    }
}

impl QualifySetting {
    /// Resolved latency ceiling in ms; 0 disables qualification.
    pub fn max_ms(self) -> u32 {
        match self {
            QualifySetting::Flag(YesNo::No) => 0,
            QualifySetting::Flag(YesNo::Yes) => crate::peer::DEFAULT_MAXMS,
            QualifySetting::MaxMs(ms) => ms,
        }
    }
}

/// `autokill` accepts yes/no or an explicit timeout in ms.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum AutokillSetting {
    Flag(YesNo),
    Ms(u32),
}

impl Default for AutokillSetting {
    fn default() -> Self {
        AutokillSetting::Flag(YesNo::No)
    }
}

impl AutokillSetting {
    pub fn timeout_ms(self) -> u32 {
        match self {
            AutokillSetting::Flag(YesNo::No) => 0,
            AutokillSetting::Flag(YesNo::Yes) => crate::peer::DEFAULT_MAXMS,
            AutokillSetting::Ms(ms) => ms,
        }
    }
}

/// Type-of-service marking for outbound datagrams.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(untagged)]
pub enum TosSetting {
    #[default]
    #[serde(skip)]
    Unset,
    Named(TosName),
    Value(u8),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TosName {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "lowdelay")]
    LowDelay,
    #[serde(rename = "throughput")]
    Throughput,
    #[serde(rename = "reliability")]
    Reliability,
    #[serde(rename = "mincost")]
    MinCost,
}

impl TosSetting {
    pub fn bits(self) -> u8 {
        match self {
            TosSetting::Unset | TosSetting::Named(TosName::None) => 0,
            TosSetting::Named(TosName::LowDelay) => 0x10,
            TosSetting::Named(TosName::Throughput) => 0x08,
            TosSetting::Named(TosName::Reliability) => 0x04,
            TosSetting::Named(TosName::MinCost) => 0x02,
            TosSetting::Value(v) => v,
        }
    }
}

/// Options a mapping may set; most map straight onto answer flag bits.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOption {
    #[serde(rename = "nounsolicited")]
    NoUnsolicited,
    #[serde(rename = "nocomunsolicit")]
    NoComUnsolicit,
    #[serde(rename = "residential")]
    Residential,
    #[serde(rename = "commercial")]
    Commercial,
    #[serde(rename = "mobile")]
    Mobile,
    #[serde(rename = "nopartial")]
    NoPartial,
}
