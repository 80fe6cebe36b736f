// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt::Write, net::SocketAddr};

use tracing::{Level, enabled, trace};

use crate::models::{
    answer::Tech,
    header::{FrameHeader, HEADER_LEN},
    ie::IeId,
};

/// Direction tag for frame dumps; encrypted inner frames are indented the
/// way the interactive debug of the protocol traditionally prints them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDir {
    Tx,
    Rx,
    EncTx,
    EncRx,
}

impl FrameDir {
    fn prefix(self) -> &'static str {
        match self {
            FrameDir::Tx => "Tx",
            FrameDir::Rx => "Rx",
            FrameDir::EncTx => "    ETx",
            FrameDir::EncRx => "    ERx",
        }
    }

    fn nested(self) -> bool {
        matches!(self, FrameDir::EncTx | FrameDir::EncRx)
    }
}

fn command_label(raw: u8) -> String {
    match crate::models::header::Command::from_raw(raw & 0x7f) {
        Some(cmd) => cmd.label().to_string(),
        None => format!("({raw}?)"),
    }
}

fn describe_ie(raw_id: u8, value: &[u8]) -> String {
    let Some(id) = IeId::from_raw(raw_id) else {
        return "Present".to_string();
    };
    let text = |v: &[u8]| String::from_utf8_lossy(v).into_owned();
    match id {
        IeId::Eid | IeId::EidDirect | IeId::ReqEid => match crate::models::Eid::from_slice(value) {
            Ok(eid) => eid.to_string(),
            Err(_) => format!("Invalid EID len {}", value.len()),
        },
        IeId::CalledContext
        | IeId::CalledNumber
        | IeId::Department
        | IeId::Organization
        | IeId::Locality
        | IeId::StateProv
        | IeId::Country
        | IeId::Email
        | IeId::Phone
        | IeId::IpAddr => text(value),
        IeId::Ttl | IeId::Version | IeId::Expiration => match value.try_into() {
            Ok(b) => u16::from_be_bytes(b).to_string(),
            Err(_) => "Invalid SHORT".to_string(),
        },
        IeId::KeyCrc32 => match value.try_into() {
            Ok(b) => format!("{:08x}", u32::from_be_bytes(b)),
            Err(_) => "Invalid INT".to_string(),
        },
        IeId::UnknownCmd => match value.first() {
            Some(b) => b.to_string(),
            None => "Invalid BYTE".to_string(),
        },
        IeId::Cause => match value.split_first() {
            Some((code, desc)) if !desc.is_empty() => format!("{code}: {}", text(desc)),
            Some((code, _)) => code.to_string(),
            None => "<invalid contents>".to_string(),
        },
        IeId::Answer => {
            if value.len() >= 11 {
                let flags = u16::from_be_bytes([value[7], value[8]]);
                let weight = u16::from_be_bytes([value[9], value[10]]);
                let eid = crate::models::Eid::from_slice(&value[..6])
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                format!(
                    "[{}] {weight} <{}/{}> from [{eid}]",
                    crate::models::AnswerFlags::from_wire(flags),
                    Tech::from_wire(value[6]),
                    text(&value[11..]),
                )
            } else {
                "Invalid Answer".to_string()
            }
        },
        IeId::Hint => {
            if value.len() >= 2 {
                let flags = crate::models::HintFlags::from_bits_truncate(u16::from_be_bytes([
                    value[0], value[1],
                ]));
                format!("[{flags}] {}", text(&value[2..]))
            } else {
                "<invalid contents>".to_string()
            }
        },
        IeId::EncData => {
            if value.len() > 16 && value.len() % 16 == 0 {
                let mut iv = String::with_capacity(32);
                for b in &value[..16] {
                    let _ = write!(iv, "{b:02x}");
                }
                format!("[IV {iv}] {} encrypted blocks", value.len() / 16)
            } else {
                format!("Invalid Encrypted Datalen {}", value.len())
            }
        },
        IeId::SharedKey | IeId::Signature => format!("{} bytes", value.len()),
        IeId::CacheBypass => "Bypass Caches".to_string(),
        IeId::PeerStatus => "Present".to_string(),
    }
}

/// Emits a human-readable dump of one frame at trace level, covering the
/// header and every information element it carries. Reserved-bit frames are
/// never dumped.
pub fn show_frame(buf: &[u8], dir: FrameDir, addr: &SocketAddr) {
    if !enabled!(target: "dundi::wire", Level::TRACE) {
        return;
    }
    let Ok(hdr) = FrameHeader::parse(buf) else {
        return;
    };
    if hdr.reserved_bit() {
        return;
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}-Frame Retry[{}] -- OSeqno: {:03} ISeqno: {:03} Type: {} ({})",
        dir.prefix(),
        if hdr.retransmitted() { "Yes" } else { "No" },
        hdr.oseqno,
        hdr.iseqno,
        command_label(hdr.command_raw()),
        if hdr.cmdresp & 0x40 != 0 {
            "Response"
        } else {
            "Command"
        },
    );
    let _ = writeln!(
        out,
        "{}   Flags: {:02x} STrans: {:05} DTrans: {:05} [{addr}]{}",
        if dir.nested() { "     " } else { "" },
        hdr.cmdflags,
        hdr.src_trans(),
        hdr.dst_trans(),
        if hdr.is_final() { " (Final)" } else { "" },
    );
    let indent = if dir.nested() { "        " } else { "   " };
    let mut rest = &buf[HEADER_LEN..];
    while rest.len() >= 2 {
        let raw_id = rest[0];
        let mut len = rest[1] as usize;
        if raw_id == IeId::EncData as u8 {
            len = rest.len() - 2;
        }
        if len + 2 > rest.len() {
            break;
        }
        let name = IeId::from_raw(raw_id)
            .map(IeId::label)
            .unwrap_or("Unknown IE");
        let _ = writeln!(
            out,
            "{indent}{name:<15}: {}",
            describe_ie(raw_id, &rest[2..2 + len])
        );
        rest = &rest[2 + len..];
    }
    trace!(target: "dundi::wire", "\n{out}");
}
