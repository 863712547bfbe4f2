// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the UART boot protocol of the Dialog SC14441 boot ROM and its
// second-stage loader.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::convert::TryInto;
use std::fmt;

use crate::constants::{
    RESPONSE_CHECKSUM, RESPONSE_CHIP_ID, RESPONSE_DEBUG, RESPONSE_ERROR_CODES,
    RESPONSE_FLASH_INFO, RESPONSE_SYNC_CODES,
};
use crate::frame::ResponseHeader;

/// Identity record of the chip, as reported by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipId {
    pub id1: u8,
    pub id2: u8,
    pub id3: u8,
    pub mem_size: u8,
    pub revision: u8,
}

impl fmt::Display for ChipId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Revision nibbles are letter-coded, 0 = 'A'.
        let major = (b'A' + (self.revision >> 4)) as char;
        let minor = (b'A' + (self.revision & 0x0F)) as char;
        write!(
            fmt,
            "chip id '{}{}{}' ({:02x}{:02x}{:02x}), mem size {:#04x}, revision {}x{} ({:#04x})",
            self.id1 as char,
            self.id2 as char,
            self.id3 as char,
            self.id1,
            self.id2,
            self.id3,
            self.mem_size,
            major,
            minor,
            self.revision
        )
    }
}

/// What a response code (plus payload shape) means. Kinds with a payload
/// constraint fall back to [`ResponseKind::Other`] when the constraint
/// fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Negative acknowledgment of a prior request.
    Error,
    /// Positive acknowledgment; read replies carry their data alongside.
    Sync,
    /// Unsolicited ASCII debug output, not matched to any request.
    Debug,
    /// CRC-32 the device computed over a flash range.
    Checksum(u32),
    /// Flash size in bytes.
    FlashInfo { flash_size: u32 },
    ChipId(ChipId),
    /// Unknown code, or a known code with a malformed payload.
    Other,
}

/// A CRC-verified frame from the device.
#[derive(Clone)]
pub struct Response {
    pub header: ResponseHeader,
    pub payload: Vec<u8>,
    pub kind: ResponseKind,
}

impl Response {
    pub fn new(header: ResponseHeader, payload: Vec<u8>) -> Response {
        let kind = classify(header.response, &payload);
        Response {
            header,
            payload,
            kind,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    pub fn is_sync(&self) -> bool {
        self.kind == ResponseKind::Sync
    }

    pub fn is_debug(&self) -> bool {
        self.kind == ResponseKind::Debug
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "response to {:#06x}, type {:#04x} ({:?}), {} bytes of data",
            self.header.id,
            self.header.response,
            self.kind,
            self.payload.len()
        )
    }
}

fn classify(code: u8, payload: &[u8]) -> ResponseKind {
    if RESPONSE_ERROR_CODES.contains(&code) {
        ResponseKind::Error
    } else if RESPONSE_SYNC_CODES.contains(&code) {
        ResponseKind::Sync
    } else if code == RESPONSE_DEBUG {
        ResponseKind::Debug
    } else if code == RESPONSE_CHECKSUM && payload.len() == 4 {
        ResponseKind::Checksum(u32::from_le_bytes(payload.try_into().unwrap()))
    } else if code == RESPONSE_FLASH_INFO && payload.len() == 4 {
        ResponseKind::FlashInfo {
            flash_size: u32::from_le_bytes(payload.try_into().unwrap()),
        }
    } else if code == RESPONSE_CHIP_ID && payload.len() == 5 {
        ResponseKind::ChipId(ChipId {
            id1: payload[0],
            id2: payload[1],
            id3: payload[2],
            mem_size: payload[3],
            revision: payload[4],
        })
    } else {
        ResponseKind::Other
    }
}
