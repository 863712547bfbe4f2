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

use std::{fmt, time::Duration};

use crate::constants::{
    CMD_CHIP_ID, CMD_ERASE_FLASH_SECTOR, CMD_FLASH_INFO, CMD_PING,
    CMD_PROGRAM_FLASH_PAGE, CMD_READ_FLASH, CMD_READ_MEM,
    CMD_REMOTE_FLASH_CHECKSUM, CMD_SET_BAUDRATE,
};
use crate::frame;

/// A request to the second-stage loader. All addresses and lengths travel
/// as little-endian u32 in the payload.
#[derive(Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    SetBaudrate(u32),
    FlashInfo,
    EraseFlashSector(u32),
    ProgramFlashPage { address: u32, data: Vec<u8> },
    ReadFlash { address: u32, length: u32 },
    RemoteFlashChecksum { address: u32, length: u32 },
    ChipId,
    ReadMem { address: u32, length: u32 },
}

impl Command {
    pub fn code(&self) -> u8 {
        match self {
            Command::Ping => CMD_PING,
            Command::SetBaudrate(_) => CMD_SET_BAUDRATE,
            Command::FlashInfo => CMD_FLASH_INFO,
            Command::EraseFlashSector(_) => CMD_ERASE_FLASH_SECTOR,
            Command::ProgramFlashPage { .. } => CMD_PROGRAM_FLASH_PAGE,
            Command::ReadFlash { .. } => CMD_READ_FLASH,
            Command::RemoteFlashChecksum { .. } => CMD_REMOTE_FLASH_CHECKSUM,
            Command::ChipId => CMD_CHIP_ID,
            Command::ReadMem { .. } => CMD_READ_MEM,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::Ping | Command::FlashInfo | Command::ChipId => Vec::new(),
            Command::SetBaudrate(baudrate) => baudrate.to_le_bytes().to_vec(),
            Command::EraseFlashSector(address) => {
                address.to_le_bytes().to_vec()
            }
            Command::ProgramFlashPage { address, data } => {
                let mut payload = Vec::with_capacity(4 + data.len());
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Command::ReadFlash { address, length }
            | Command::RemoteFlashChecksum { address, length }
            | Command::ReadMem { address, length } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
                payload
            }
        }
    }

    /// Worst-case wait for the reply, given the current link baudrate.
    ///
    /// `baudrate / 10` approximates bytes per second under 8-N-1 framing;
    /// the factor of two covers request and response travel.
    pub fn timeout(&self, baudrate: u32) -> Duration {
        const BASE: f64 = 1.0;
        let bytes_per_sec = f64::from(baudrate) / 10.0;

        let secs = match self {
            Command::EraseFlashSector(_) => BASE + 0.5,
            Command::ProgramFlashPage { data, .. } => {
                BASE + 2.0 * data.len() as f64 / bytes_per_sec + 0.003
            }
            Command::ReadFlash { length, .. }
            | Command::ReadMem { length, .. } => {
                BASE + 2.0 * f64::from(*length) / bytes_per_sec
            }
            Command::RemoteFlashChecksum { length, .. } => {
                BASE + f64::from(*length) * 8.0 / 100_000.0
            }
            _ => BASE,
        };

        Duration::from_secs_f64(secs)
    }

    pub fn encode(&self, id: u32) -> Vec<u8> {
        frame::encode(self.code(), id, &self.payload())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => write!(fmt, "Ping"),
            Command::SetBaudrate(baudrate) => {
                write!(fmt, "SetBaudrate({})", baudrate)
            }
            Command::FlashInfo => write!(fmt, "FlashInfo"),
            Command::EraseFlashSector(address) => {
                write!(fmt, "EraseFlashSector({:#010x})", address)
            }
            Command::ProgramFlashPage { address, data } => write!(
                fmt,
                "ProgramFlashPage({:#010x}, {} bytes)",
                address,
                data.len()
            ),
            Command::ReadFlash { address, length } => {
                write!(fmt, "ReadFlash({:#010x}, {})", address, length)
            }
            Command::RemoteFlashChecksum { address, length } => write!(
                fmt,
                "RemoteFlashChecksum({:#010x}, {})",
                address, length
            ),
            Command::ChipId => write!(fmt, "ChipId"),
            Command::ReadMem { address, length } => {
                write!(fmt, "ReadMem({:#010x}, {})", address, length)
            }
        }
    }
}

/// A command bound to the identifier it was transmitted under. Identifiers
/// are never reused while the session lives, even if the request fails.
#[derive(Debug, Clone)]
pub struct DispatchedCommand {
    pub cmd: Command,
    pub id: u32,
}

impl DispatchedCommand {
    pub fn encode(&self) -> Vec<u8> {
        self.cmd.encode(self.id)
    }
}
