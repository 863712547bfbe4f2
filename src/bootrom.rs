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

use std::{
    io::{self, Read, Write},
    thread,
    time::Duration,
};

use serialport::SerialPort;

use crate::constants::{ACK, NACK, SOH, STX};
use crate::{Error, Result};

/// How long the reset line is held asserted.
const RESET_HOLD: Duration = Duration::from_millis(100);

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Talks to the mask-ROM bootloader: resets the chip and uploads a
/// second-stage image into RAM.
///
/// RTS is wired to the reset line, DTR to boot-mode select.
pub struct Bootrom {
    port: Box<dyn SerialPort>,
}

impl Bootrom {
    pub fn new(port: Box<dyn SerialPort>) -> Bootrom {
        Bootrom { port }
    }

    /// Release the port, e.g. to hand it to a
    /// [`LoaderSession`](crate::LoaderSession) once the uploaded loader is
    /// running.
    pub fn into_port(self) -> Box<dyn SerialPort> {
        self.port
    }

    /// Pulse the reset line without selecting bootloader mode.
    pub fn reset(&mut self) -> Result<()> {
        self.port.write_request_to_send(true)?;
        self.port.write_data_terminal_ready(false)?;
        thread::sleep(RESET_HOLD);
        self.port.write_request_to_send(false)?;
        Ok(())
    }

    /// Hold reset with boot-select low, then release into the bootloader.
    fn reset_into_bootloader(&mut self) -> Result<()> {
        self.port.write_request_to_send(true)?;
        self.port.write_data_terminal_ready(false)?;
        thread::sleep(RESET_HOLD);
        self.port.write_data_terminal_ready(true)?;
        self.port.write_request_to_send(false)?;
        Ok(())
    }

    /// Read one byte; `None` on timeout.
    fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.port.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Upload a second-stage image into device RAM and start it.
    ///
    /// Resets the chip into bootloader mode, waits for the ROM's STX,
    /// announces the payload size, streams the payload and checks the
    /// ROM's XOR verification byte before committing with `ACK 0x00`.
    pub fn upload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > usize::from(u16::MAX) {
            return Err(Error::PayloadTooLarge(payload.len()));
        }

        self.reset_into_bootloader()?;
        self.port.set_timeout(READ_TIMEOUT)?;

        log::info!("Will send {} bytes to the boot ROM", payload.len());

        // Hunt for STX; the surrounding tool bounds the overall wait.
        loop {
            match self.read_byte()? {
                None => log::debug!("timed out waiting for STX"),
                Some(STX) => break,
                Some(byte) => {
                    log::warn!("unexpected byte {:#04x} from boot ROM", byte)
                }
            }
        }

        let mut header = [0u8; 3];
        header[0] = SOH;
        header[1..3].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        self.port.write_all(&header)?;
        self.port.flush()?;

        // The ROM may emit one more STX before acknowledging the size.
        // Exactly one is tolerated; a second is fatal.
        let mut stx_count = 0;
        loop {
            if stx_count > 1 {
                return Err(Error::UnexpectedByte(STX));
            }
            match self.read_byte()? {
                None => return Err(Error::Timeout),
                Some(STX) => stx_count += 1,
                Some(ACK) => break,
                Some(NACK) => return Err(Error::BootloaderRefused),
                Some(byte) => return Err(Error::UnexpectedByte(byte)),
            }
        }

        log::info!("Payload size accepted, sending data");
        self.port.write_all(payload)?;
        self.port.flush()?;

        let checksum = payload.iter().fold(0u8, |acc, byte| acc ^ byte);
        match self.read_byte()? {
            None => Err(Error::Timeout),
            Some(byte) if byte == checksum => {
                log::info!("Payload checksum correct, starting payload");
                // The commit is ACK as a little-endian u16.
                self.port.write_all(&u16::from(ACK).to_le_bytes())?;
                self.port.flush()?;
                Ok(())
            }
            Some(byte) => Err(Error::ChecksumMismatch {
                expected: checksum,
                received: byte,
            }),
        }
    }
}
