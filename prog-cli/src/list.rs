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

use anyhow::Result;
use serialport::SerialPortType;

pub fn list() -> Result<()> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
        return Ok(());
    }

    for port in ports {
        match port.port_type {
            SerialPortType::UsbPort(usb) => {
                let manufacturer =
                    usb.manufacturer.unwrap_or_else(|| "?".to_string());
                let product = usb.product.unwrap_or_else(|| "?".to_string());
                println!(
                    "- `{}` {:04X}:{:04X} {} {}",
                    port.port_name, usb.vid, usb.pid, manufacturer, product
                );
            }
            _ => println!("- `{}`", port.port_name),
        }
    }

    Ok(())
}
