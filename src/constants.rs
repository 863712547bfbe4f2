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

/// Start-of-text byte emitted by the boot ROM when it is ready.
pub const STX: u8                       = 0x02;
/// Start-of-header byte opening the ROM size header.
pub const SOH: u8                       = 0x01;
/// ACK byte (ROM handshake)
pub const ACK: u8                       = 0x06;
/// NACK byte (ROM handshake)
pub const NACK: u8                      = 0x15;

/// The boot ROM UART rate is fixed by the silicon.
pub const ROM_BAUDRATE: u32             = 9600;

/// Every loader-session frame starts with this byte, in both directions.
pub const SYNC_BYTE: u8                 = 0xA5;

pub const CMD_PING: u8                  = 0x00;
pub const CMD_SET_BAUDRATE: u8          = 0x01;
pub const CMD_FLASH_INFO: u8            = 0x02;
pub const CMD_ERASE_FLASH_SECTOR: u8    = 0x03;
pub const CMD_PROGRAM_FLASH_PAGE: u8    = 0x04;
pub const CMD_READ_FLASH: u8            = 0x06;
pub const CMD_REMOTE_FLASH_CHECKSUM: u8 = 0x07;
pub const CMD_CHIP_ID: u8               = 0x08;
pub const CMD_READ_MEM: u8              = 0x09;

/// Negative acknowledgments to a prior request.
pub const RESPONSE_ERROR_CODES: [u8; 5] = [0x00, 0x02, 0x03, 0x06, 0x08];
/// Positive acknowledgments; also the ping reply.
pub const RESPONSE_SYNC_CODES: [u8; 2]  = [0x01, 0x04];
pub const RESPONSE_DEBUG: u8            = 0x05;
pub const RESPONSE_CHECKSUM: u8         = 0x09;
pub const RESPONSE_FLASH_INFO: u8       = 0x0A;
pub const RESPONSE_CHIP_ID: u8          = 0x0B;

/// Flash erase granularity, in bytes.
pub const SECTOR_SIZE: u32              = 4096;
/// Flash program granularity, in bytes.
pub const PAGE_SIZE: u32                = 256;
/// Transfer unit for chunked reads, in bytes.
pub const CHUNK_SIZE: u32               = 4096;

/// Attempts per chunk on chunked reads.
pub const CHUNK_RETRY: u32              = 5;
/// Ping attempts used to synchronize with a freshly started loader.
pub const SYNC_TRIES: u32               = 3;
/// Ping budget used to confirm liveness after a baudrate change.
pub const BAUDRATE_PING_RETRY: u32      = 5;
