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

//! # Range transfers
//!
//! Chunked, retry-wrapped reads and sector-wise writes on top of the
//! single-command session operations. The protocol layer never retries on
//! its own; all retry policy lives here.
//!
//! Each transfer takes a `progress(done, total)` callback (byte counts) so
//! front-ends can drive a progress bar without the library depending on
//! one.

use crate::constants::{CHUNK_RETRY, CHUNK_SIZE, PAGE_SIZE, SECTOR_SIZE};
use crate::session::LoaderSession;
use crate::{frame, Error, Result};

type ChunkRead =
    fn(&mut LoaderSession, u32, u32) -> Result<Option<Vec<u8>>>;

fn read_range<F>(
    session: &mut LoaderSession,
    start: u32,
    length: u32,
    mut progress: F,
    read_chunk: ChunkRead,
) -> Result<Vec<u8>>
where
    F: FnMut(u64, u64),
{
    let total = u64::from(length);
    let mut data = Vec::with_capacity(length as usize);
    let mut address = start;
    let mut remaining = length;

    while remaining > 0 {
        let read_size = remaining.min(CHUNK_SIZE);

        let mut chunk = None;
        for attempt in 1..=CHUNK_RETRY {
            match read_chunk(session, address, read_size)? {
                Some(bytes) => {
                    chunk = Some(bytes);
                    break;
                }
                None => log::warn!(
                    "failed to read chunk at {:#010x}, try {}/{}",
                    address,
                    attempt,
                    CHUNK_RETRY
                ),
            }
        }

        match chunk {
            Some(bytes) => data.extend_from_slice(&bytes),
            None => {
                return Err(Error::ChunkRetriesExhausted {
                    address,
                    tries: CHUNK_RETRY,
                })
            }
        }

        remaining -= read_size;
        // Wraps only when the range ends at the top of the address space.
        address = address.wrapping_add(read_size);
        progress(total - u64::from(remaining), total);
    }

    Ok(data)
}

/// Read `length` bytes of flash starting at `start`, in 4096-byte chunks
/// with up to five attempts per chunk. A chunk that keeps failing fails
/// the whole read.
pub fn read_flash_range<F>(
    session: &mut LoaderSession,
    start: u32,
    length: u32,
    progress: F,
) -> Result<Vec<u8>>
where
    F: FnMut(u64, u64),
{
    read_range(
        session,
        start,
        length,
        progress,
        LoaderSession::read_flash_chunk,
    )
}

/// Read `length` bytes of arbitrary memory starting at `start`.
pub fn read_mem_range<F>(
    session: &mut LoaderSession,
    start: u32,
    length: u32,
    progress: F,
) -> Result<Vec<u8>>
where
    F: FnMut(u64, u64),
{
    read_range(
        session,
        start,
        length,
        progress,
        LoaderSession::read_mem_chunk,
    )
}

/// Write `[offset, offset + length)` of the flash from `image`.
///
/// `image` is a flash image indexed by absolute address, so it must cover
/// at least `offset + length` bytes. The range must start and end on a
/// sector boundary; this is checked before anything goes on the wire.
/// Every sector in the range is erased first, then programmed in 256-byte
/// pages.
pub fn write_flash_range<F>(
    session: &mut LoaderSession,
    offset: u32,
    length: u32,
    image: &[u8],
    mut progress: F,
) -> Result<()>
where
    F: FnMut(u64, u64),
{
    let end = offset
        .checked_add(length)
        .ok_or(Error::UnalignedRange { offset, length })?;
    if offset % SECTOR_SIZE != 0 || end % SECTOR_SIZE != 0 {
        return Err(Error::UnalignedRange { offset, length });
    }
    if image.len() < end as usize {
        return Err(Error::ImageTooShort {
            needed: end as usize,
            len: image.len(),
        });
    }

    for sector_address in (offset..end).step_by(SECTOR_SIZE as usize) {
        log::info!("Erasing sector at {:#010x}", sector_address);
        if !session.erase_flash_sector(sector_address)? {
            return Err(Error::EraseFailed {
                address: sector_address,
            });
        }
    }

    let total = u64::from(length);
    for page_address in (offset..end).step_by(PAGE_SIZE as usize) {
        let page = &image
            [page_address as usize..(page_address + PAGE_SIZE) as usize];
        if !session.program_flash_page(page_address, page)? {
            return Err(Error::ProgramFailed {
                address: page_address,
            });
        }
        progress(
            u64::from(page_address - offset) + u64::from(PAGE_SIZE),
            total,
        );
    }

    Ok(())
}

/// Check a written range sector by sector, comparing the device's checksum
/// of each sector against the CRC-32 of the matching image slice. A
/// mismatch reports the failing sector's address.
pub fn verify_flash_range(
    session: &mut LoaderSession,
    offset: u32,
    length: u32,
    image: &[u8],
) -> Result<()> {
    let end = offset
        .checked_add(length)
        .ok_or(Error::UnalignedRange { offset, length })?;
    if image.len() < end as usize {
        return Err(Error::ImageTooShort {
            needed: end as usize,
            len: image.len(),
        });
    }

    for sector_address in (offset..end).step_by(SECTOR_SIZE as usize) {
        let sector_end = sector_address.saturating_add(SECTOR_SIZE).min(end);
        log::info!("Verifying sector at {:#010x}", sector_address);

        let slice = &image[sector_address as usize..sector_end as usize];
        let local = frame::crc32(slice);
        let remote = session
            .remote_flash_checksum(sector_address, sector_end - sector_address)?;
        match remote {
            Some(remote) if remote == local => (),
            Some(remote) => {
                return Err(Error::VerifyFailed {
                    address: sector_address,
                    local,
                    remote,
                })
            }
            None => return Err(Error::Timeout),
        }
    }

    Ok(())
}
