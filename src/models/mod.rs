// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Wire types for the DUNDi protocol: entity identifiers, the frame
//! header, and the information-element codec.

/// Answer, hint and technology flag types.
pub mod answer;
/// Entity identifiers.
pub mod eid;
/// Frame header and command set.
pub mod header;
/// Information element builder and parser.
pub mod ie;
/// Debug frame dumps.
pub mod show;

pub use answer::{AnswerFlags, HintFlags, Tech};
pub use eid::Eid;
pub use header::{
    CLEAR_PREFIX_LEN, Cause, Command, FrameHeader, HEADER_LEN, MAX_PACKET_SIZE,
};
pub use ie::{
    AES_BLOCK_LEN, AnswerIe, EncBlock, HintIe, IeBuilder, IeError, IeId, MAX_EID_STACK,
    MAX_FRAME_ANSWERS, ParsedIes, RSA_BLOCK_LEN, parse_ies,
};

/// The UDP port the protocol listens on by default.
pub const DUNDI_PORT: u16 = 4520;
/// Protocol version carried in the VERSION element.
pub const DUNDI_VERSION: u16 = 1;
