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

//! Loader-session frame layout:
//!
//! ```text
//! sync(1) | cmd(1) id(4 LE) payload_len(4 LE) | header_crc(4 LE)
//!         [ payload(payload_len) | payload_crc(4 LE) ]
//! ```
//!
//! Both CRCs are plain CRC-32 (IEEE). The header CRC covers only the 9
//! header bytes on transmit, but `sync || header` on receive; the two
//! directions really do disagree on this.

use std::convert::TryInto;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::constants::SYNC_BYTE;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Command/response header length, without the sync byte and CRC.
const HEADER_LENGTH: usize = 9;

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Encode a host→device frame.
pub fn encode(cmd: u8, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = [0u8; HEADER_LENGTH];
    header[0] = cmd;
    header[1..5].copy_from_slice(&id.to_le_bytes());
    header[5..9].copy_from_slice(&(payload.len() as u32).to_le_bytes());

    let mut frame =
        Vec::with_capacity(1 + HEADER_LENGTH + 4 + payload.len() + 4);
    frame.push(SYNC_BYTE);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&crc32(&header).to_le_bytes());
    if !payload.is_empty() {
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32(payload).to_le_bytes());
    }

    frame
}

/// Header of a device→host frame, once its CRC has checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub response: u8,
    pub id: u32,
    pub payload_length: u32,
}

impl ResponseHeader {
    /// Header plus CRC, as read off the wire after the sync byte.
    pub const LENGTH: usize = HEADER_LENGTH + 4;

    /// Parse and verify a received header. The CRC covers the sync byte
    /// prepended to the 9 header bytes.
    pub fn parse(data: &[u8; Self::LENGTH]) -> Option<ResponseHeader> {
        let mut digest = CRC32.digest();
        digest.update(&[SYNC_BYTE]);
        digest.update(&data[..HEADER_LENGTH]);
        let expected = digest.finalize();

        let received =
            u32::from_le_bytes(data[HEADER_LENGTH..].try_into().unwrap());
        if received != expected {
            log::debug!(
                "corrupted header, checksum incorrect (expected {:#010x}, got {:#010x})",
                expected,
                received
            );
            return None;
        }

        Some(ResponseHeader {
            response: data[0],
            id: u32::from_le_bytes(data[1..5].try_into().unwrap()),
            payload_length: u32::from_le_bytes(data[5..9].try_into().unwrap()),
        })
    }

    /// On the wire a non-empty payload is followed by its own CRC.
    pub fn payload_length_with_crc(&self) -> usize {
        self.payload_length as usize + 4
    }
}
