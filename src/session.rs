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
use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use serialport::{ClearBuffer, SerialPort};

use crate::command::{Command, DispatchedCommand};
use crate::constants::{BAUDRATE_PING_RETRY, SYNC_BYTE};
use crate::frame::{self, ResponseHeader};
use crate::response::{ChipId, Response, ResponseKind};
use crate::{Error, Result};

/// Idle timeout of the receive loop; also bounds the header stage.
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Destination for the loader's unsolicited ASCII debug stream. Bytes are
/// forwarded verbatim, with no newline translation.
pub type DebugSink = Box<dyn Write + Send>;

/// State shared between the caller and the receiver thread.
struct Shared {
    queue: Mutex<Vec<Response>>,
    available: Condvar,
    exit: AtomicBool,
}

/// A request/response session with the second-stage loader.
///
/// A background receiver owns the read half of the port for the lifetime
/// of the session. It parses frames, hands debug frames to the debug sink
/// and queues everything else by identifier; [`LoaderSession::await_response`]
/// collects replies for the caller. The caller keeps the write half.
pub struct LoaderSession {
    port: Box<dyn SerialPort>,
    baudrate: u32,
    next_id: u32,
    shared: Arc<Shared>,
    debug_sink: Arc<Mutex<DebugSink>>,
    receiver: Option<thread::JoinHandle<()>>,
}

impl LoaderSession {
    /// Start a session on an already opened port. Loader debug output goes
    /// to stdout.
    pub fn new(port: Box<dyn SerialPort>, baudrate: u32) -> Result<LoaderSession> {
        Self::with_debug_sink(port, baudrate, Box::new(io::stdout()))
    }

    pub fn with_debug_sink(
        mut port: Box<dyn SerialPort>,
        baudrate: u32,
        sink: DebugSink,
    ) -> Result<LoaderSession> {
        port.set_baud_rate(baudrate)?;

        let mut session = LoaderSession {
            port,
            baudrate,
            next_id: 0,
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                available: Condvar::new(),
                exit: AtomicBool::new(false),
            }),
            debug_sink: Arc::new(Mutex::new(sink)),
            receiver: None,
        };
        session.start()?;

        Ok(session)
    }

    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn start(&mut self) -> Result<()> {
        self.shared.exit.store(false, Ordering::SeqCst);

        let port = self.port.try_clone()?;
        let shared = Arc::clone(&self.shared);
        let sink = Arc::clone(&self.debug_sink);
        let baudrate = self.baudrate;
        self.receiver = Some(thread::spawn(move || {
            receive_loop(port, baudrate, &shared, &sink);
        }));

        Ok(())
    }

    fn stop(&mut self) {
        self.shared.exit.store(true, Ordering::SeqCst);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }

    /// Assign the next identifier and put the command on the wire.
    pub fn send(&mut self, cmd: Command) -> Result<DispatchedCommand> {
        let dispatch = DispatchedCommand {
            id: self.next_id,
            cmd,
        };
        self.next_id += 1;

        log::debug!("dispatching {:?}, id {:#06x}", dispatch.cmd, dispatch.id);
        let frame = dispatch.encode();
        log::trace!("TX {:02x?}", frame);
        self.port.write_all(&frame)?;
        self.port.flush()?;

        Ok(dispatch)
    }

    /// Wait for the reply matching `dispatch`, up to `timeout` (defaults to
    /// the command's own deadline at the current baudrate). `None` means
    /// the deadline elapsed; replies to other identifiers stay queued for
    /// their own waiters.
    pub fn await_response(
        &self,
        dispatch: &DispatchedCommand,
        timeout: Option<Duration>,
    ) -> Option<Response> {
        let timeout =
            timeout.unwrap_or_else(|| dispatch.cmd.timeout(self.baudrate));
        let deadline = Instant::now() + timeout;

        let mut queue = self.shared.queue.lock().unwrap();
        loop {
            if let Some(index) = queue
                .iter()
                .position(|resp| resp.header.id == dispatch.id)
            {
                return Some(queue.remove(index));
            }

            let now = Instant::now();
            if now >= deadline {
                log::debug!(
                    "no response to id {:#06x} within {:?}",
                    dispatch.id,
                    timeout
                );
                return None;
            }

            let (guard, _) = self
                .shared
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap();
            queue = guard;
        }
    }

    fn request(&mut self, cmd: Command) -> Result<Option<Response>> {
        let dispatch = self.send(cmd)?;
        Ok(self.await_response(&dispatch, None))
    }

    /// Ping the loader once; true iff it answered with a sync reply.
    pub fn ping(&mut self) -> Result<bool> {
        Ok(self
            .request(Command::Ping)?
            .map_or(false, |resp| resp.is_sync()))
    }

    /// Ping up to `tries` times until the loader answers.
    pub fn sync(&mut self, tries: u32) -> Result<bool> {
        for attempt in 1..=tries {
            if self.ping()? {
                log::debug!("synchronized after {} attempt(s)", attempt);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Renegotiate the link baudrate in-band.
    ///
    /// The device acts on the request without a positive acknowledgment at
    /// the new rate; only an explicit error reply aborts the switch. After
    /// reconfiguring the port the receiver is restarted on a cleared queue
    /// (the device may still emit a few bytes at the old rate) and liveness
    /// is confirmed by pinging. Identifier allocation restarts at 0 once
    /// the switch is confirmed.
    pub fn set_baudrate(&mut self, baudrate: u32) -> Result<bool> {
        let resp = self.request(Command::SetBaudrate(baudrate))?;
        if resp.map_or(false, |resp| resp.is_error()) {
            return Ok(false);
        }

        self.stop();
        self.port.set_baud_rate(baudrate)?;
        self.baudrate = baudrate;
        let _ = self.port.clear(ClearBuffer::Input);
        self.shared.queue.lock().unwrap().clear();
        self.start()?;

        for _ in 0..BAUDRATE_PING_RETRY {
            if self.ping()? {
                // Drop anything still addressed to the old identifiers
                // before the counter restarts.
                self.shared.queue.lock().unwrap().clear();
                self.next_id = 0;
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Read one chunk of flash. `None` when the request failed or timed
    /// out; retry policy belongs to the caller.
    pub fn read_flash_chunk(
        &mut self,
        address: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>> {
        let resp = self.request(Command::ReadFlash { address, length })?;
        Ok(resp.and_then(|resp| {
            if resp.is_sync() {
                Some(resp.payload)
            } else {
                None
            }
        }))
    }

    /// Read one chunk of arbitrary memory.
    pub fn read_mem_chunk(
        &mut self,
        address: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>> {
        let resp = self.request(Command::ReadMem { address, length })?;
        Ok(resp.and_then(|resp| {
            if resp.is_sync() {
                Some(resp.payload)
            } else {
                None
            }
        }))
    }

    /// Erase the 4096-byte sector starting at `address`.
    pub fn erase_flash_sector(&mut self, address: u32) -> Result<bool> {
        Ok(self
            .request(Command::EraseFlashSector(address))?
            .map_or(false, |resp| resp.is_sync()))
    }

    /// Program one 256-byte page at `address`. The sector must have been
    /// erased first.
    pub fn program_flash_page(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<bool> {
        let cmd = Command::ProgramFlashPage {
            address,
            data: data.to_vec(),
        };
        Ok(self.request(cmd)?.map_or(false, |resp| resp.is_sync()))
    }

    /// CRC-32 computed by the device over `[address, address + length)`.
    pub fn remote_flash_checksum(
        &mut self,
        address: u32,
        length: u32,
    ) -> Result<Option<u32>> {
        let resp =
            self.request(Command::RemoteFlashChecksum { address, length })?;
        Ok(resp.and_then(|resp| match resp.kind {
            ResponseKind::Checksum(checksum) => Some(checksum),
            _ => None,
        }))
    }

    /// Flash size in bytes.
    pub fn flash_info(&mut self) -> Result<Option<u32>> {
        let resp = self.request(Command::FlashInfo)?;
        Ok(resp.and_then(|resp| match resp.kind {
            ResponseKind::FlashInfo { flash_size } => Some(flash_size),
            _ => None,
        }))
    }

    /// Chip identity record.
    pub fn chip_id(&mut self) -> Result<Option<ChipId>> {
        let resp = self.request(Command::ChipId)?;
        Ok(resp.and_then(|resp| match resp.kind {
            ResponseKind::ChipId(chip_id) => Some(chip_id),
            _ => None,
        }))
    }
}

impl Drop for LoaderSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(
    mut port: Box<dyn SerialPort>,
    baudrate: u32,
    shared: &Shared,
    sink: &Mutex<DebugSink>,
) {
    while !shared.exit.load(Ordering::SeqCst) {
        let resp = match receive_packet(&mut port, baudrate) {
            Ok(Some(resp)) => resp,
            Ok(None) => continue,
            Err(err) => {
                log::error!("receive path failed: {}", err);
                break;
            }
        };

        if resp.is_debug() {
            let mut sink = sink.lock().unwrap();
            let _ = sink.write_all(&resp.payload);
            let _ = sink.flush();
            continue;
        }

        log::trace!("{:?}", resp);
        let mut queue = shared.queue.lock().unwrap();
        queue.push(resp);
        shared.available.notify_all();
    }
}

/// Receive a single frame. `None` drops the frame (timeout, missing sync,
/// CRC mismatch); the requester observes that as its own timeout.
fn receive_packet(
    port: &mut Box<dyn SerialPort>,
    baudrate: u32,
) -> Result<Option<Response>> {
    port.set_timeout(RECEIVE_TIMEOUT)?;

    let mut sync = [0u8; 1];
    match port.read(&mut sync) {
        Ok(0) => return Ok(None),
        Ok(_) => (),
        Err(err) if err.kind() == io::ErrorKind::TimedOut => return Ok(None),
        Err(err) if err.kind() == io::ErrorKind::Interrupted => {
            return Ok(None)
        }
        Err(err) => return Err(Error::Io(err)),
    }
    if sync[0] != SYNC_BYTE {
        log::trace!("discarding byte {:#04x} outside any frame", sync[0]);
        return Ok(None);
    }

    let mut header_data = [0u8; ResponseHeader::LENGTH];
    if !read_fully(port, &mut header_data)? {
        return Ok(None);
    }

    let header = match ResponseHeader::parse(&header_data) {
        Some(header) => header,
        None => return Ok(None),
    };

    let mut payload = Vec::new();
    if header.payload_length > 0 {
        let wanted = header.payload_length_with_crc();

        // Scale the deadline with the transfer size at the current rate.
        let secs = 1.0 + wanted as f64 * 10.0 / f64::from(baudrate);
        port.set_timeout(Duration::from_secs_f64(secs))?;

        let mut data = vec![0u8; wanted];
        if !read_fully(port, &mut data)? {
            return Ok(None);
        }

        let received =
            u32::from_le_bytes(data[wanted - 4..].try_into().unwrap());
        let expected = frame::crc32(&data[..wanted - 4]);
        if received != expected {
            log::debug!(
                "corrupted payload, checksum incorrect (expected {:#010x}, got {:#010x})",
                expected,
                received
            );
            return Ok(None);
        }

        data.truncate(wanted - 4);
        payload = data;
    }

    Ok(Some(Response::new(header, payload)))
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn read_fully(port: &mut Box<dyn SerialPort>, buf: &mut [u8]) -> Result<bool> {
    match port.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err)
            if err.kind() == io::ErrorKind::TimedOut
                || err.kind() == io::ErrorKind::UnexpectedEof =>
        {
            log::debug!("short read, dropping frame");
            Ok(false)
        }
        Err(err) => Err(Error::Io(err)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{response_frame, MockPort, SinkBuffer};

    fn session_over(port: &MockPort, baudrate: u32) -> (LoaderSession, SinkBuffer) {
        let sink = SinkBuffer::default();
        let session = LoaderSession::with_debug_sink(
            Box::new(port.clone()),
            baudrate,
            Box::new(sink.clone()),
        )
        .unwrap();
        (session, sink)
    }

    #[test]
    fn test_ping_resolves_on_sync_reply() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x01, 0, &[]));

        let (mut session, _sink) = session_over(&port, 9600);
        let dispatch = session.send(Command::Ping).unwrap();
        assert_eq!(dispatch.id, 0);

        let resp = session.await_response(&dispatch, None).unwrap();
        assert!(resp.is_sync());
        assert!(resp.payload.is_empty());

        // The request on the wire is the encoded ping frame.
        assert_eq!(port.tx(), Command::Ping.encode(0));
    }

    #[test]
    fn test_identifiers_are_monotonic() {
        let port = MockPort::new();
        let (mut session, _sink) = session_over(&port, 9600);

        for expected in 0..4 {
            let dispatch = session.send(Command::Ping).unwrap();
            assert_eq!(dispatch.id, expected);
        }
    }

    #[test]
    fn test_await_matches_by_id_only() {
        let port = MockPort::new();
        // Reply to id 1 arrives before the reply to id 0.
        port.push_rx(&response_frame(0x01, 1, b"later"));
        port.push_rx(&response_frame(0x01, 0, b"first"));

        let (mut session, _sink) = session_over(&port, 9600);
        let first = session.send(Command::Ping).unwrap();
        let second = session.send(Command::Ping).unwrap();

        let resp = session.await_response(&first, None).unwrap();
        assert_eq!(resp.header.id, 0);
        assert_eq!(resp.payload, b"first");

        // The out-of-order reply stayed queued for its own waiter.
        let resp = session.await_response(&second, None).unwrap();
        assert_eq!(resp.header.id, 1);
        assert_eq!(resp.payload, b"later");
    }

    #[test]
    fn test_debug_frames_go_to_the_sink() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x05, 0xAA, b"hello"));

        let (session, sink) = session_over(&port, 9600);
        let dispatch = DispatchedCommand {
            cmd: Command::Ping,
            id: 0xAA,
        };

        // The debug frame shares the pending identifier but must never be
        // collected as a reply.
        let resp = session
            .await_response(&dispatch, Some(Duration::from_millis(300)));
        assert!(resp.is_none());
        assert_eq!(sink.contents(), b"hello");
    }

    #[test]
    fn test_corrupted_frames_are_dropped() {
        let port = MockPort::new();

        let mut bad_header = response_frame(0x01, 0, &[]);
        bad_header[11] ^= 0xFF;
        port.push_rx(&bad_header);

        let mut bad_payload = response_frame(0x01, 0, b"data");
        let len = bad_payload.len();
        bad_payload[len - 1] ^= 0xFF;
        port.push_rx(&bad_payload);

        port.push_rx(&response_frame(0x01, 0, b"good"));

        let (mut session, _sink) = session_over(&port, 9600);
        let dispatch = session.send(Command::Ping).unwrap();
        let resp = session.await_response(&dispatch, None).unwrap();
        assert_eq!(resp.payload, b"good");
    }

    #[test]
    fn test_await_times_out_without_reply() {
        let port = MockPort::new();
        let (mut session, _sink) = session_over(&port, 9600);

        let dispatch = session.send(Command::Ping).unwrap();
        let started = Instant::now();
        let resp = session
            .await_response(&dispatch, Some(Duration::from_millis(200)));
        assert!(resp.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_error_reply_fails_the_ping() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x00, 0, &[]));

        let (mut session, _sink) = session_over(&port, 9600);
        assert!(!session.ping().unwrap());
    }

    #[test]
    fn test_read_flash_chunk_returns_payload() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x01, 0, &[0xDE, 0xAD, 0xBE, 0xEF]));

        let (mut session, _sink) = session_over(&port, 9600);
        let chunk = session.read_flash_chunk(0x1000, 4).unwrap();
        assert_eq!(chunk.unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_remote_checksum_reply() {
        let port = MockPort::new();
        port.push_rx(&response_frame(
            0x09,
            0,
            &0xCAFE_BABEu32.to_le_bytes(),
        ));

        let (mut session, _sink) = session_over(&port, 9600);
        let checksum = session.remote_flash_checksum(0, 0x100).unwrap();
        assert_eq!(checksum, Some(0xCAFE_BABE));
    }

    #[test]
    fn test_chip_id_and_flash_info() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x0B, 0, &[b'4', b'4', b'1', 0x0F, 0x01]));
        port.push_rx(&response_frame(
            0x0A,
            1,
            &0x0010_0000u32.to_le_bytes(),
        ));

        let (mut session, _sink) = session_over(&port, 9600);
        let chip_id = session.chip_id().unwrap().unwrap();
        assert_eq!((chip_id.id1, chip_id.id2, chip_id.id3), (b'4', b'4', b'1'));
        assert_eq!(session.flash_info().unwrap(), Some(0x0010_0000));
    }

    #[test]
    fn test_set_baudrate() {
        let port = MockPort::new();
        // Sync reply to the SetBaudrate request itself (id 0).
        port.push_rx(&response_frame(0x01, 0, &[]));

        let (mut session, _sink) = session_over(&port, 9600);

        // Once the confirmation ping (old counter, id 1) shows up on the
        // wire at the new rate, answer it. Pushing earlier would race with
        // the input flush that follows the rate change.
        let helper_port = port.clone();
        let ping_frame = Command::Ping.encode(1);
        let helper = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                if helper_port.baudrate() == 230_400
                    && helper_port.tx_contains(&ping_frame)
                {
                    helper_port.push_rx(&response_frame(0x01, 1, &[]));
                    break;
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        });

        assert!(session.set_baudrate(230_400).unwrap());
        helper.join().unwrap();

        assert_eq!(port.baudrate(), 230_400);
        assert_eq!(session.baudrate(), 230_400);

        // Identifier allocation restarted.
        let dispatch = session.send(Command::Ping).unwrap();
        assert_eq!(dispatch.id, 0);
    }

    #[test]
    fn test_set_baudrate_aborts_on_error_reply() {
        let port = MockPort::new();
        port.push_rx(&response_frame(0x00, 0, &[]));

        let (mut session, _sink) = session_over(&port, 9600);
        assert!(!session.set_baudrate(230_400).unwrap());

        // The port was never reconfigured.
        assert_eq!(port.baudrate(), 9600);
    }
}
