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

//! # Dialog SC14441 UART Bootloader Interface library
//!
//! This is a library to program and inspect Dialog SC14441-class devices
//! over their UART boot interface. It speaks two protocols:
//!
//! - the mask-ROM upload handshake ([`Bootrom`]), a stop-and-wait exchange
//!   with an XOR checksum, used only to place a second-stage loader in
//!   device RAM and start it; and
//! - the loader session protocol ([`LoaderSession`]), a framed,
//!   CRC-32-protected request/response protocol with identifier-tagged
//!   replies, an in-band debug stream and in-band baudrate renegotiation.
//!
//! A typical programming run resets the chip into the boot ROM, uploads
//! the loader at 9600 baud, renegotiates a faster rate and then uses the
//! [`util`] range transfers to read, erase and program the flash.

use std::time::Duration;

use serialport::SerialPort;

#[rustfmt::skip]
pub mod constants;
pub mod util;

mod bootrom;
mod command;
mod error;
mod frame;
mod response;
mod session;

#[cfg(test)]
pub(crate) mod testutil;

pub use self::bootrom::Bootrom;
pub use self::command::{Command, DispatchedCommand};
pub use self::error::{Error, Result};
pub use self::frame::ResponseHeader;
pub use self::response::{ChipId, Response, ResponseKind};
pub use self::session::{DebugSink, LoaderSession};

/// Open a serial port with the settings the SC14441 expects: 8 data bits,
/// no parity, one stop bit, no flow control.
///
/// The boot ROM only listens at [`constants::ROM_BAUDRATE`]; faster rates
/// are negotiated later through [`LoaderSession::set_baudrate`].
pub fn open_port(
    path: &str,
    baudrate: u32,
) -> serialport::Result<Box<dyn SerialPort>> {
    serialport::new(path, baudrate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_secs(1))
        .open()
}
