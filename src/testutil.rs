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

//! Scripted in-memory serial port for the protocol tests. Clones share
//! their state, which is what lets a session's receiver thread and the
//! test body see the same wire.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use serialport::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits,
};

use crate::constants::SYNC_BYTE;
use crate::frame::crc32;

/// Upper bound on how long a mock read blocks; keeps receiver shutdown
/// and timeout-path tests fast.
const POLL_WINDOW: Duration = Duration::from_millis(20);

struct MockState {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    baudrate: u32,
    timeout: Duration,
    rts: Vec<bool>,
    dtr: Vec<bool>,
}

#[derive(Clone)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> MockPort {
        MockPort {
            state: Arc::new(Mutex::new(MockState {
                rx: VecDeque::new(),
                tx: Vec::new(),
                baudrate: 9600,
                timeout: Duration::from_secs(1),
                rts: Vec::new(),
                dtr: Vec::new(),
            })),
        }
    }

    /// Queue bytes for the device→host direction.
    pub fn push_rx(&self, data: &[u8]) {
        self.state.lock().unwrap().rx.extend(data.iter().copied());
    }

    /// Everything written in the host→device direction so far.
    pub fn tx(&self) -> Vec<u8> {
        self.state.lock().unwrap().tx.clone()
    }

    pub fn tx_contains(&self, needle: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        state.tx.windows(needle.len()).any(|window| window == needle)
    }

    pub fn baudrate(&self) -> u32 {
        self.state.lock().unwrap().baudrate
    }

    pub fn rts_history(&self) -> Vec<bool> {
        self.state.lock().unwrap().rts.clone()
    }

    pub fn dtr_history(&self) -> Vec<bool> {
        self.state.lock().unwrap().dtr.clone()
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let window = {
            let state = self.state.lock().unwrap();
            state.timeout.min(POLL_WINDOW)
        };
        let deadline = Instant::now() + window;

        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.rx.is_empty() {
                    let count = buf.len().min(state.rx.len());
                    for slot in buf[..count].iter_mut() {
                        *slot = state.rx.pop_front().unwrap();
                    }
                    return Ok(count);
                }
            }

            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "scripted input exhausted",
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPort for MockPort {
    fn name(&self) -> Option<String> {
        Some("mock".to_string())
    }

    fn baud_rate(&self) -> serialport::Result<u32> {
        Ok(self.state.lock().unwrap().baudrate)
    }

    fn data_bits(&self) -> serialport::Result<DataBits> {
        unreachable!()
    }

    fn flow_control(&self) -> serialport::Result<FlowControl> {
        unreachable!()
    }

    fn parity(&self) -> serialport::Result<Parity> {
        unreachable!()
    }

    fn stop_bits(&self) -> serialport::Result<StopBits> {
        unreachable!()
    }

    fn timeout(&self) -> Duration {
        self.state.lock().unwrap().timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> serialport::Result<()> {
        self.state.lock().unwrap().baudrate = baud_rate;
        Ok(())
    }

    fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
        unreachable!()
    }

    fn set_flow_control(
        &mut self,
        _flow_control: FlowControl,
    ) -> serialport::Result<()> {
        unreachable!()
    }

    fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
        unreachable!()
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
        unreachable!()
    }

    fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
        self.state.lock().unwrap().timeout = timeout;
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> serialport::Result<()> {
        self.state.lock().unwrap().rts.push(level);
        Ok(())
    }

    fn write_data_terminal_ready(
        &mut self,
        level: bool,
    ) -> serialport::Result<()> {
        self.state.lock().unwrap().dtr.push(level);
        Ok(())
    }

    fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
        unreachable!()
    }

    fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
        unreachable!()
    }

    fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
        unreachable!()
    }

    fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
        unreachable!()
    }

    fn bytes_to_read(&self) -> serialport::Result<u32> {
        Ok(self.state.lock().unwrap().rx.len() as u32)
    }

    fn bytes_to_write(&self) -> serialport::Result<u32> {
        Ok(0)
    }

    fn clear(&self, buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
        let mut state = self.state.lock().unwrap();
        match buffer_to_clear {
            ClearBuffer::Input => state.rx.clear(),
            ClearBuffer::Output => (),
            ClearBuffer::All => state.rx.clear(),
        }
        Ok(())
    }

    fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
        Ok(Box::new(self.clone()))
    }

    fn set_break(&self) -> serialport::Result<()> {
        unreachable!()
    }

    fn clear_break(&self) -> serialport::Result<()> {
        unreachable!()
    }
}

/// Device→host frame bytes; unlike the transmit direction, the header CRC
/// covers the sync byte.
pub fn response_frame(code: u8, id: u32, payload: &[u8]) -> Vec<u8> {
    let mut with_sync = vec![SYNC_BYTE, code];
    with_sync.extend_from_slice(&id.to_le_bytes());
    with_sync.extend_from_slice(&(payload.len() as u32).to_le_bytes());

    let mut frame = with_sync.clone();
    frame.extend_from_slice(&crc32(&with_sync).to_le_bytes());
    if !payload.is_empty() {
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc32(payload).to_le_bytes());
    }

    frame
}

/// Write sink capturing the loader debug stream.
#[derive(Clone, Default)]
pub struct SinkBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl SinkBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl io::Write for SinkBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.data.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
