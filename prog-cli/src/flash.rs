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

use std::convert::TryInto;
use std::fs;

use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};

use dialog_sbl::{constants::SECTOR_SIZE, util, LoaderSession};

/// read_flash subcommand entry point.
pub fn read_flash(
    matches: &ArgMatches<'_>,
    session: &mut LoaderSession,
) -> Result<()> {
    let path = matches.value_of("FILE").unwrap();
    let offset = matches
        .value_of("offset")
        .map(parse_integer)
        .transpose()?
        .unwrap_or(0);
    let length = match matches.value_of("length").map(parse_integer).transpose()? {
        Some(length) => length,
        None => session.flash_info()?.context(
            "Failed to determine the flash size, specify the read length manually",
        )?,
    };
    if length == 0 {
        bail!("Nothing to read");
    }

    log::info!(
        "Will read {} bytes from {:#010x} - {:#010x}",
        length,
        offset,
        offset as u64 + u64::from(length) - 1
    );

    let bar = transfer_bar(u64::from(length));
    let data =
        util::read_flash_range(session, offset, length, |done, _total| {
            bar.set_position(done)
        })
        .context("Couldn't read flash")?;
    bar.finish();

    fs::write(path, &data)
        .with_context(|| format!("Couldn't write `{}`", path))?;
    log::info!("Wrote {} bytes to `{}`", data.len(), path);

    Ok(())
}

/// read_mem subcommand entry point.
pub fn read_mem(
    matches: &ArgMatches<'_>,
    session: &mut LoaderSession,
) -> Result<()> {
    let path = matches.value_of("FILE").unwrap();
    let offset = parse_integer(matches.value_of("offset").unwrap())?;
    let length = parse_integer(matches.value_of("length").unwrap())?;
    if length == 0 {
        bail!("Nothing to read");
    }

    log::info!(
        "Will read {} bytes from {:#010x} - {:#010x}",
        length,
        offset,
        offset as u64 + u64::from(length) - 1
    );

    let bar = transfer_bar(u64::from(length));
    let data =
        util::read_mem_range(session, offset, length, |done, _total| {
            bar.set_position(done)
        })
        .context("Couldn't read memory")?;
    bar.finish();

    fs::write(path, &data)
        .with_context(|| format!("Couldn't write `{}`", path))?;
    log::info!("Wrote {} bytes to `{}`", data.len(), path);

    Ok(())
}

/// write_flash subcommand entry point.
pub fn write_flash(
    matches: &ArgMatches<'_>,
    session: &mut LoaderSession,
) -> Result<()> {
    let path = matches.value_of("FILE").unwrap();
    let image = fs::read(path)
        .with_context(|| format!("Couldn't read flash image `{}`", path))?;

    let offset = matches
        .value_of("offset")
        .map(parse_integer)
        .transpose()?
        .unwrap_or(0);
    let length = match matches.value_of("length").map(parse_integer).transpose()? {
        Some(length) => length,
        None => image
            .len()
            .try_into()
            .context("Flash image is too large")?,
    };

    log::info!(
        "Will write {} bytes at {:#010x} from `{}`",
        length,
        offset,
        path
    );

    let bar = transfer_bar(u64::from(length));
    util::write_flash_range(session, offset, length, &image, |done, _total| {
        bar.set_position(done)
    })
    .context("Couldn't write flash")?;
    bar.finish();

    if matches.is_present("verify") {
        log::info!("Verifying {} bytes at {:#010x}", length, offset);
        // Sector by sector, like the erase pass, so a failure names the
        // sector that is bad.
        for sector_address in
            (offset..offset + length).step_by(SECTOR_SIZE as usize)
        {
            let sector_length = SECTOR_SIZE.min(offset + length - sector_address);
            util::verify_flash_range(session, sector_address, sector_length, &image)
                .with_context(|| {
                    format!(
                        "Flash verification failed at sector {:#010x}",
                        sector_address
                    )
                })?;
        }
        log::info!("Verification passed");
    }

    Ok(())
}

fn transfer_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .progress_chars("=> "),
    );
    bar
}

/// Parse a C-style integer literal: 0x/0o/0b prefix or decimal.
fn parse_integer(value: &str) -> Result<u32> {
    let value = value.trim();
    let parsed = if let Some(hex) =
        value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16)
    } else if let Some(oct) =
        value.strip_prefix("0o").or_else(|| value.strip_prefix("0O"))
    {
        u32::from_str_radix(oct, 8)
    } else if let Some(bin) =
        value.strip_prefix("0b").or_else(|| value.strip_prefix("0B"))
    {
        u32::from_str_radix(bin, 2)
    } else {
        value.parse()
    };

    parsed.with_context(|| format!("Invalid number `{}`", value))
}
