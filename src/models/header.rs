// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Result, bail};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16, Unaligned,
};

/// Full frame header length on the wire.
pub const HEADER_LEN: usize = 8;

/// Length of the header prefix that stays in the clear on encrypted frames
/// (transaction ids plus sequence numbers; the command byte travels inside
/// the encrypted record).
pub const CLEAR_PREFIX_LEN: usize = 6;

/// Largest datagram we will build or accept.
pub const MAX_PACKET_SIZE: usize = 8192;

/// High bit of `strans`: reserved, frames carrying it are dropped silently.
pub const FLAG_RESERVED: u16 = 0x8000;
/// High bit of `dtrans`: retransmission marker, debug only.
pub const FLAG_RETRANS: u16 = 0x8000;
/// High bit of `cmdresp`: FINAL.
pub const FLAG_FINAL: u8 = 0x80;
/// Response-class bit inside the 7-bit command space.
pub const FLAG_RESPONSE: u8 = 0x40;

/// Every DUNDi datagram starts with this header, network byte order.
#[repr(C)]
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    ZFromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct FrameHeader {
    /// Source transaction id (high bit reserved).
    pub strans: U16<BigEndian>,
    /// Destination transaction id (high bit marks a retransmit).
    pub dtrans: U16<BigEndian>,
    /// Next expected incoming sequence number.
    pub iseqno: u8,
    /// Outgoing sequence number of this frame.
    pub oseqno: u8,
    /// FINAL bit | 7-bit command.
    pub cmdresp: u8,
    /// Command specific flags.
    pub cmdflags: u8,
}

impl FrameHeader {
    pub fn src_trans(&self) -> u16 {
        self.strans.get() & !FLAG_RESERVED
    }

    pub fn dst_trans(&self) -> u16 {
        self.dtrans.get() & !FLAG_RETRANS
    }

    pub fn reserved_bit(&self) -> bool {
        self.strans.get() & FLAG_RESERVED != 0
    }

    pub fn retransmitted(&self) -> bool {
        self.dtrans.get() & FLAG_RETRANS != 0
    }

    pub fn is_final(&self) -> bool {
        self.cmdresp & FLAG_FINAL != 0
    }

    pub fn command_raw(&self) -> u8 {
        self.cmdresp & !FLAG_FINAL
    }

    pub fn parse(buf: &[u8]) -> Result<&Self> {
        let Ok((hdr, _)) = Self::ref_from_prefix(buf) else {
            bail!("short datagram ({} of {HEADER_LEN} min)", buf.len());
        };
        Ok(hdr)
    }
}

/// The DUNDi command set. The `0x40` bit marks response-class commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Ack = 0x40,
    DpDiscover = 1,
    DpResponse = 2 | 0x40,
    EidQuery = 3,
    EidResponse = 4 | 0x40,
    PrecacheRq = 5,
    PrecacheRp = 6 | 0x40,
    Invalid = 7 | 0x40,
    Unknown = 8 | 0x40,
    Null = 9,
    RegReq = 10,
    RegResponse = 11 | 0x40,
    Cancel = 12,
    Encrypt = 13,
    EncRej = 14 | 0x40,
    Status = 15,
}

impl Command {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x40 => Command::Ack,
            1 => Command::DpDiscover,
            x if x == 2 | 0x40 => Command::DpResponse,
            3 => Command::EidQuery,
            x if x == 4 | 0x40 => Command::EidResponse,
            5 => Command::PrecacheRq,
            x if x == 6 | 0x40 => Command::PrecacheRp,
            x if x == 7 | 0x40 => Command::Invalid,
            x if x == 8 | 0x40 => Command::Unknown,
            9 => Command::Null,
            10 => Command::RegReq,
            x if x == 11 | 0x40 => Command::RegResponse,
            12 => Command::Cancel,
            13 => Command::Encrypt,
            x if x == 14 | 0x40 => Command::EncRej,
            15 => Command::Status,
            _ => return None,
        })
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    pub fn is_response(self) -> bool {
        self.raw() & FLAG_RESPONSE != 0
    }

    /// Commands that may open a brand-new transaction on the receiving side.
    pub fn opens_transaction(self) -> bool {
        matches!(
            self,
            Command::DpDiscover
                | Command::EidQuery
                | Command::PrecacheRq
                | Command::RegReq
                | Command::Null
                | Command::Encrypt
        )
    }

    /// Commands whose payload is re-framed inside an ENCRYPT record when the
    /// transaction carries a session key.
    pub fn encryptable(self) -> bool {
        matches!(
            self,
            Command::RegReq
                | Command::RegResponse
                | Command::DpDiscover
                | Command::DpResponse
                | Command::EidQuery
                | Command::EidResponse
                | Command::PrecacheRq
                | Command::PrecacheRp
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Command::Ack => "ACK",
            Command::DpDiscover => "DPDISCOVER",
            Command::DpResponse => "DPRESPONSE",
            Command::EidQuery => "EIDQUERY",
            Command::EidResponse => "EIDRESPONSE",
            Command::PrecacheRq => "PRECACHERQ",
            Command::PrecacheRp => "PRECACHERP",
            Command::Invalid => "INVALID",
            Command::Unknown => "UNKNOWN CMD",
            Command::Null => "NULL",
            Command::RegReq => "REGREQ",
            Command::RegResponse => "REGRESPONSE",
            Command::Cancel => "CANCEL",
            Command::Encrypt => "ENCRYPT",
            Command::EncRej => "ENCREJ",
            Command::Status => "STATUS",
        }
    }
}

/// Wire cause codes carried in the CAUSE information element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cause {
    Success = 0,
    General = 1,
    Dynamic = 2,
    NoAuth = 3,
    Duplicate = 4,
    TtlExpired = 5,
    NeedKey = 6,
    BadEncrypt = 7,
}

impl Cause {
    pub fn label(self) -> &'static str {
        match self {
            Cause::Success => "SUCCESS",
            Cause::General => "GENERAL",
            Cause::Dynamic => "DYNAMIC",
            Cause::NoAuth => "NOAUTH",
            Cause::Duplicate => "DUPLICATE",
            Cause::TtlExpired => "TTL EXPIRED",
            Cause::NeedKey => "NEED KEY",
            Cause::BadEncrypt => "BAD ENCRYPT",
        }
    }
}
