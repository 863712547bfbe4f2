// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

use std::{
    error,
    fmt::{self, Display, Formatter},
    io,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the ROM upload engine, the loader session and the
/// range transfer helpers.
#[derive(Debug)]
pub enum Error {
    /// I/O failure on the serial link.
    Io(io::Error),
    /// Serial port configuration or control-line failure.
    Serial(serialport::Error),
    /// No (matching) reply within the deadline.
    Timeout,
    /// The boot ROM answered the size header with NACK.
    BootloaderRefused,
    /// A byte outside the ROM handshake alphabet, or one spurious STX too
    /// many.
    UnexpectedByte(u8),
    /// The ROM's verification byte did not match the XOR of the payload.
    ChecksumMismatch { expected: u8, received: u8 },
    /// The ROM size header carries a u16 length; larger images can't be
    /// uploaded.
    PayloadTooLarge(usize),
    /// Flash writes must start and end on a sector boundary.
    UnalignedRange { offset: u32, length: u32 },
    /// The flash image does not cover the addressed range.
    ImageTooShort { needed: usize, len: usize },
    /// A chunked read gave up after the per-chunk retry budget.
    ChunkRetriesExhausted { address: u32, tries: u32 },
    /// Sector erase was not acknowledged.
    EraseFailed { address: u32 },
    /// Page programming was not acknowledged.
    ProgramFailed { address: u32 },
    /// The device checksum of a written range does not match the image.
    VerifyFailed { address: u32, local: u32, remote: u32 },
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(fmt, "I/O error: {}", err),
            Error::Serial(err) => write!(fmt, "serial port error: {}", err),
            Error::Timeout => write!(fmt, "timed out waiting for a response"),
            Error::BootloaderRefused => {
                write!(fmt, "boot ROM refused the payload (NACK)")
            }
            Error::UnexpectedByte(byte) => {
                write!(fmt, "unexpected byte {:#04x} from the boot ROM", byte)
            }
            Error::ChecksumMismatch { expected, received } => write!(
                fmt,
                "payload checksum incorrect (expected {:#04x}, got {:#04x})",
                expected, received
            ),
            Error::PayloadTooLarge(len) => write!(
                fmt,
                "payload of {} bytes exceeds the 65535 byte upload limit",
                len
            ),
            Error::UnalignedRange { offset, length } => write!(
                fmt,
                "range {:#010x}+{:#x} is not aligned to {} byte sectors",
                offset,
                length,
                crate::constants::SECTOR_SIZE
            ),
            Error::ImageTooShort { needed, len } => write!(
                fmt,
                "input image is {} bytes, the addressed range needs {}",
                len, needed
            ),
            Error::ChunkRetriesExhausted { address, tries } => write!(
                fmt,
                "giving up on chunk at {:#010x} after {} tries",
                address, tries
            ),
            Error::EraseFailed { address } => {
                write!(fmt, "failed to erase sector at {:#010x}", address)
            }
            Error::ProgramFailed { address } => {
                write!(fmt, "failed to program page at {:#010x}", address)
            }
            Error::VerifyFailed {
                address,
                local,
                remote,
            } => write!(
                fmt,
                "checksum mismatch at {:#010x} (image {:#010x}, device {:#010x})",
                address, local, remote
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Serial(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Error {
        Error::Serial(err)
    }
}
