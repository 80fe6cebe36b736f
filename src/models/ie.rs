// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::warn;

use crate::models::{
    answer::{AnswerFlags, HintFlags},
    eid::Eid,
    header::{Cause, HEADER_LEN, MAX_PACKET_SIZE},
};

/// Most EIDs a single frame may stack for loop avoidance.
pub const MAX_EID_STACK: usize = 512;
/// Most ANSWER elements accepted from a single frame.
pub const MAX_FRAME_ANSWERS: usize = 100;
/// RSA-wrapped key material is always this long.
pub const RSA_BLOCK_LEN: usize = 128;
/// AES block / IV size.
pub const AES_BLOCK_LEN: usize = 16;

/// Information element identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IeId {
    Eid = 1,
    CalledContext = 2,
    CalledNumber = 3,
    EidDirect = 4,
    Answer = 5,
    Ttl = 6,
    Version = 10,
    Expiration = 11,
    UnknownCmd = 12,
    Cause = 14,
    ReqEid = 15,
    EncData = 16,
    SharedKey = 17,
    Signature = 18,
    KeyCrc32 = 19,
    Hint = 20,
    Department = 21,
    Organization = 22,
    Locality = 23,
    StateProv = 24,
    Country = 25,
    Email = 26,
    Phone = 27,
    IpAddr = 28,
    CacheBypass = 29,
    PeerStatus = 30,
}

impl IeId {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => IeId::Eid,
            2 => IeId::CalledContext,
            3 => IeId::CalledNumber,
            4 => IeId::EidDirect,
            5 => IeId::Answer,
            6 => IeId::Ttl,
            10 => IeId::Version,
            11 => IeId::Expiration,
            12 => IeId::UnknownCmd,
            14 => IeId::Cause,
            15 => IeId::ReqEid,
            16 => IeId::EncData,
            17 => IeId::SharedKey,
            18 => IeId::Signature,
            19 => IeId::KeyCrc32,
            20 => IeId::Hint,
            21 => IeId::Department,
            22 => IeId::Organization,
            23 => IeId::Locality,
            24 => IeId::StateProv,
            25 => IeId::Country,
            26 => IeId::Email,
            27 => IeId::Phone,
            28 => IeId::IpAddr,
            29 => IeId::CacheBypass,
            30 => IeId::PeerStatus,
            _ => return None,
        })
    }

    pub fn label(self) -> &'static str {
        match self {
            IeId::Eid => "ENTITY IDENT",
            IeId::CalledContext => "CALLED CONTEXT",
            IeId::CalledNumber => "CALLED NUMBER",
            IeId::EidDirect => "DIRECT EID",
            IeId::Answer => "ANSWER",
            IeId::Ttl => "TTL",
            IeId::Version => "VERSION",
            IeId::Expiration => "EXPIRATION",
            IeId::UnknownCmd => "UKWN DUNDI CMD",
            IeId::Cause => "CAUSE",
            IeId::ReqEid => "REQUEST EID",
            IeId::EncData => "ENCDATA",
            IeId::SharedKey => "SHAREDKEY",
            IeId::Signature => "SIGNATURE",
            IeId::KeyCrc32 => "KEYCRC32",
            IeId::Hint => "HINT",
            IeId::Department => "DEPARTMENT",
            IeId::Organization => "ORGANIZTN",
            IeId::Locality => "LOCALITY",
            IeId::StateProv => "STATEPROV",
            IeId::Country => "COUNTRY",
            IeId::Email => "EMAIL",
            IeId::Phone => "PHONE",
            IeId::IpAddr => "ADDRESS",
            IeId::CacheBypass => "CBYPASS",
            IeId::PeerStatus => "PEERSTATUS",
        }
    }
}

/// Errors raised by the IE codec.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IeError {
    #[error("out of space for ie '{0}', need {1} more bytes")]
    Overflow(&'static str, usize),
    #[error("information element length exceeds message size")]
    Truncated,
    #[error("information element value too long ({0} bytes)")]
    ValueTooLong(usize),
    #[error("invalid entity identifier")]
    BadEid,
}

/// Accumulates the information-element body of one outbound datagram.
///
/// The limit covers the whole datagram: appending past what still fits in a
/// MAX_PACKET_SIZE frame (after the header) fails and the caller drops the
/// frame.
#[derive(Debug, Clone, Default)]
pub struct IeBuilder {
    buf: Vec<u8>,
}

impl IeBuilder {
    pub const CAPACITY: usize = MAX_PACKET_SIZE - HEADER_LEN;

    pub fn new() -> Self {
        IeBuilder { buf: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn room_for(&self, ie: IeId, len: usize) -> Result<(), IeError> {
        let need = len + 2;
        if self.buf.len() + need > Self::CAPACITY {
            return Err(IeError::Overflow(ie.label(), need));
        }
        Ok(())
    }

    pub fn raw(&mut self, ie: IeId, value: &[u8]) -> Result<(), IeError> {
        if value.len() > u8::MAX as usize {
            return Err(IeError::ValueTooLong(value.len()));
        }
        self.room_for(ie, value.len())?;
        self.buf.push(ie as u8);
        self.buf.push(value.len() as u8);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    pub fn empty(&mut self, ie: IeId) -> Result<(), IeError> {
        self.raw(ie, &[])
    }

    pub fn byte(&mut self, ie: IeId, value: u8) -> Result<(), IeError> {
        self.raw(ie, &[value])
    }

    pub fn short(&mut self, ie: IeId, value: u16) -> Result<(), IeError> {
        self.raw(ie, &value.to_be_bytes())
    }

    pub fn int(&mut self, ie: IeId, value: u32) -> Result<(), IeError> {
        self.raw(ie, &value.to_be_bytes())
    }

    pub fn str(&mut self, ie: IeId, value: &str) -> Result<(), IeError> {
        self.raw(ie, value.as_bytes())
    }

    pub fn eid(&mut self, ie: IeId, eid: &Eid) -> Result<(), IeError> {
        self.raw(ie, &eid.0)
    }

    pub fn cause(&mut self, cause: Cause, desc: &str) -> Result<(), IeError> {
        let mut value = Vec::with_capacity(desc.len() + 1);
        value.push(cause as u8);
        value.extend_from_slice(desc.as_bytes());
        self.raw(IeId::Cause, &value)
    }

    pub fn hint(&mut self, flags: HintFlags, exten: &str) -> Result<(), IeError> {
        let mut value = Vec::with_capacity(exten.len() + 2);
        value.extend_from_slice(&flags.bits().to_be_bytes());
        value.extend_from_slice(exten.as_bytes());
        self.raw(IeId::Hint, &value)
    }

    pub fn answer(
        &mut self,
        eid: &Eid,
        protocol: u8,
        flags: AnswerFlags,
        weight: u16,
        dest: &str,
    ) -> Result<(), IeError> {
        let mut value = Vec::with_capacity(dest.len() + 11);
        value.extend_from_slice(&eid.0);
        value.push(protocol);
        value.extend_from_slice(&flags.wire().to_be_bytes());
        value.extend_from_slice(&weight.to_be_bytes());
        value.extend_from_slice(dest.as_bytes());
        self.raw(IeId::Answer, &value)
    }

    /// ENCDATA: the declared length byte cannot describe the ciphertext (it
    /// may exceed 255 bytes), so the element consumes the rest of the
    /// datagram by convention and the length byte carries the low bits only.
    pub fn encdata(
        &mut self,
        iv: &[u8; AES_BLOCK_LEN],
        ciphertext: &[u8],
    ) -> Result<(), IeError> {
        let datalen = ciphertext.len() + AES_BLOCK_LEN;
        if self.buf.len() + datalen + 2 > Self::CAPACITY {
            return Err(IeError::Overflow(IeId::EncData.label(), datalen + 2));
        }
        self.buf.push(IeId::EncData as u8);
        self.buf.push(datalen as u8);
        self.buf.extend_from_slice(iv);
        self.buf.extend_from_slice(ciphertext);
        Ok(())
    }
}

/// One parsed ANSWER element, borrowing the destination from the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerIe<'a> {
    pub eid: Eid,
    pub protocol: u8,
    pub flags: AnswerFlags,
    pub weight: u16,
    pub dest: &'a str,
}

/// One parsed HINT element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintIe<'a> {
    pub flags: HintFlags,
    pub exten: &'a str,
}

/// The AES record carried by ENCDATA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncBlock<'a> {
    pub iv: [u8; AES_BLOCK_LEN],
    pub data: &'a [u8],
}

/// Borrowed view over the information elements of one datagram. Owned
/// copies are made only when data crosses into the cache or a worker task.
#[derive(Debug, Default, PartialEq)]
pub struct ParsedIes<'a> {
    pub eids: Vec<Eid>,
    pub eid_direct: Vec<bool>,
    pub reqeid: Option<Eid>,
    pub called_context: Option<&'a str>,
    pub called_number: Option<&'a str>,
    pub answers: Vec<AnswerIe<'a>>,
    pub hint: Option<HintIe<'a>>,
    pub ttl: Option<u16>,
    pub version: Option<u16>,
    pub expiration: Option<u16>,
    pub unknown_cmd: Option<u8>,
    pub cause: Option<u8>,
    pub cause_desc: Option<&'a str>,
    pub keycrc32: Option<u32>,
    pub shared_key: Option<&'a [u8]>,
    pub signature: Option<&'a [u8]>,
    pub encblock: Option<EncBlock<'a>>,
    pub q_dept: Option<&'a str>,
    pub q_org: Option<&'a str>,
    pub q_locality: Option<&'a str>,
    pub q_stateprov: Option<&'a str>,
    pub q_country: Option<&'a str>,
    pub q_email: Option<&'a str>,
    pub q_phone: Option<&'a str>,
    pub q_ipaddr: Option<&'a str>,
    pub cbypass: bool,
}

fn ie_str(raw: &[u8]) -> Option<&str> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    std::str::from_utf8(&raw[..end]).ok()
}

fn be16(raw: &[u8]) -> Option<u16> {
    let bytes: [u8; 2] = raw.try_into().ok()?;
    Some(u16::from_be_bytes(bytes))
}

fn be32(raw: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = raw.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Parses the IE section of a datagram into a borrowed view.
///
/// Unknown elements are logged and skipped; malformed known elements are
/// logged and skipped individually, but a TLV running past the end of the
/// buffer fails the whole frame.
pub fn parse_ies(data: &[u8]) -> Result<ParsedIes<'_>, IeError> {
    let mut ies = ParsedIes::default();
    let mut rest = data;
    while rest.len() >= 2 {
        let raw_id = rest[0];
        let mut len = rest[1] as usize;
        // Encrypted data is the remainder of the datagram, regardless of the
        // declared length.
        if raw_id == IeId::EncData as u8 {
            len = rest.len() - 2;
        }
        if len + 2 > rest.len() {
            return Err(IeError::Truncated);
        }
        let value = &rest[2..2 + len];
        match IeId::from_raw(raw_id) {
            Some(id @ (IeId::Eid | IeId::EidDirect)) => {
                if let Ok(eid) = Eid::from_slice(value) {
                    if ies.eids.len() < MAX_EID_STACK {
                        ies.eids.push(eid);
                        ies.eid_direct.push(id == IeId::EidDirect);
                    } else {
                        warn!("too many entities in stack");
                    }
                } else {
                    warn!(len, "improper entity identifier, expecting 6 bytes");
                }
            },
            Some(IeId::ReqEid) => match Eid::from_slice(value) {
                Ok(eid) => ies.reqeid = Some(eid),
                Err(_) => {
                    warn!(len, "improper requested entity identifier");
                },
            },
            Some(IeId::CalledContext) => ies.called_context = ie_str(value),
            Some(IeId::CalledNumber) => ies.called_number = ie_str(value),
            Some(IeId::Answer) => {
                if value.len() < 11 {
                    warn!(len, "answer too short");
                } else if ies.answers.len() >= MAX_FRAME_ANSWERS {
                    warn!("ignoring extra answers");
                } else if let (Ok(eid), Some(flags), Some(weight), Some(dest)) = (
                    Eid::from_slice(&value[..6]),
                    be16(&value[7..9]),
                    be16(&value[9..11]),
                    ie_str(&value[11..]),
                ) {
                    ies.answers.push(AnswerIe {
                        eid,
                        protocol: value[6],
                        flags: AnswerFlags::from_wire(flags),
                        weight,
                        dest,
                    });
                }
            },
            Some(IeId::Ttl) => match be16(value) {
                Some(v) => ies.ttl = Some(v),
                None => warn!(len, "bad TTL length"),
            },
            Some(IeId::Version) => match be16(value) {
                Some(v) => ies.version = Some(v),
                None => warn!(len, "bad version length"),
            },
            Some(IeId::Expiration) => match be16(value) {
                Some(v) => ies.expiration = Some(v),
                None => warn!(len, "bad expiration length"),
            },
            Some(IeId::KeyCrc32) => match be32(value) {
                Some(v) => ies.keycrc32 = Some(v),
                None => warn!(len, "bad key crc length"),
            },
            Some(IeId::UnknownCmd) => {
                if value.len() == 1 {
                    ies.unknown_cmd = Some(value[0]);
                } else {
                    warn!(len, "expected single byte unknown command");
                }
            },
            Some(IeId::Cause) => {
                if value.is_empty() {
                    warn!("expected at least one byte cause");
                } else {
                    ies.cause = Some(value[0]);
                    ies.cause_desc = ie_str(&value[1..]);
                }
            },
            Some(IeId::Hint) => {
                if let (Some(flags), Some(exten)) = (
                    value.get(..2).and_then(be16),
                    value.get(2..).and_then(ie_str),
                ) {
                    ies.hint = Some(HintIe {
                        flags: HintFlags::from_bits_truncate(flags),
                        exten,
                    });
                } else {
                    warn!(len, "expected at least two byte hint");
                }
            },
            Some(IeId::EncData) => {
                if len > AES_BLOCK_LEN && len % AES_BLOCK_LEN == 0 {
                    let mut iv = [0u8; AES_BLOCK_LEN];
                    iv.copy_from_slice(&value[..AES_BLOCK_LEN]);
                    ies.encblock = Some(EncBlock {
                        iv,
                        data: &value[AES_BLOCK_LEN..],
                    });
                } else {
                    warn!(len, "invalid encrypted data length");
                }
            },
            Some(IeId::SharedKey) => {
                if value.len() == RSA_BLOCK_LEN {
                    ies.shared_key = Some(value);
                } else {
                    warn!(len, "invalid encrypted shared key length");
                }
            },
            Some(IeId::Signature) => {
                if value.len() == RSA_BLOCK_LEN {
                    ies.signature = Some(value);
                } else {
                    warn!(len, "invalid encrypted signature length");
                }
            },
            Some(IeId::Department) => ies.q_dept = ie_str(value),
            Some(IeId::Organization) => ies.q_org = ie_str(value),
            Some(IeId::Locality) => ies.q_locality = ie_str(value),
            Some(IeId::StateProv) => ies.q_stateprov = ie_str(value),
            Some(IeId::Country) => ies.q_country = ie_str(value),
            Some(IeId::Email) => ies.q_email = ie_str(value),
            Some(IeId::Phone) => ies.q_phone = ie_str(value),
            Some(IeId::IpAddr) => ies.q_ipaddr = ie_str(value),
            Some(IeId::CacheBypass) => ies.cbypass = true,
            Some(IeId::PeerStatus) | None => {
                warn!(ie = raw_id, len, "ignoring unknown information element");
            },
        }
        rest = &rest[2 + len..];
    }
    if !rest.is_empty() {
        return Err(IeError::Truncated);
    }
    Ok(ies)
}
