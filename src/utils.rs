// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::{SystemTime, UNIX_EPOCH};

use crc::{CRC_32_ISO_HDLC, Crc};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (zlib polynomial) used for key tags and avoid-stack checksums.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Seconds since the Unix epoch; cache rows and secrets persist absolute
/// expirations, so wall-clock time it is.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
