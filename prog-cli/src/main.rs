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

use std::{fs, io::Write};

use anyhow::{Context, Result};
use clap::{crate_authors, crate_version, App, AppSettings, Arg, SubCommand};

use dialog_sbl::{constants, Bootrom, LoaderSession};

mod flash;
mod list;

#[cfg(unix)]
const DEFAULT_PORT: &str = "/dev/ttyUSB0";
#[cfg(windows)]
const DEFAULT_PORT: &str = "COM1";

fn main() -> Result<()> {
    let app = App::new("Dialog SC14441 UART Bootloader Programmer")
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about("Programmer for the Dialog SC14441 UART boot ROM and its second-stage loader")
        .arg(
            Arg::with_name("PORT")
                .short("p")
                .long("port")
                .default_value(DEFAULT_PORT)
                .help("Serial port to use")
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .default_value("230400")
                .help("Baudrate used once the loader is running")
        )
        .arg(
            Arg::with_name("loader")
                .short("l")
                .long("loader")
                .takes_value(true)
                .help("Second-stage loader image uploaded into device RAM")
        )
        .arg(
            Arg::with_name("skip-loader")
                .long("skip-loader")
                .help("Skip the loader upload, assume it is already running")
        )
        .arg(
            Arg::with_name("initial-baudrate")
                .long("initial-baudrate")
                .default_value("9600")
                .help("Baudrate used for initial communication (the boot ROM is fixed at 9600)")
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity, -v (debug), -vv (trace)")
        )
        .subcommand(
            SubCommand::with_name("chip_id")
                .about("Read the chip identity record")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("flash_info")
                .about("Read the flash size")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("read_flash")
                .about("Read flash contents into a file")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Output file for the raw flash contents")
                )
                .arg(
                    Arg::with_name("offset")
                        .help("Start offset (0x/0o/0b prefix or decimal), defaults to 0")
                )
                .arg(
                    Arg::with_name("length")
                        .help("Number of bytes to read, defaults to the reported flash size")
                )
        )
        .subcommand(
            SubCommand::with_name("write_flash")
                .about("Write a flash image file to the flash")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Flash image, indexed by absolute flash address")
                )
                .arg(
                    Arg::with_name("offset")
                        .help("Start offset (0x/0o/0b prefix or decimal), defaults to 0. Must be sector aligned")
                )
                .arg(
                    Arg::with_name("length")
                        .help("Number of bytes to write, defaults to the file size. Offset + length must be sector aligned")
                )
                .arg(
                    Arg::with_name("verify")
                        .long("verify")
                        .help("Check the written range against the device's checksum")
                )
        )
        .subcommand(
            SubCommand::with_name("reset")
                .about("Pulse the reset line")
                .setting(AppSettings::ColoredHelp)
        )
        .subcommand(
            SubCommand::with_name("read_mem")
                .about("Read a memory range into a file")
                .setting(AppSettings::ColoredHelp)
                .arg(
                    Arg::with_name("FILE")
                        .required(true)
                        .takes_value(true)
                        .help("Output file for the raw memory contents")
                )
                .arg(
                    Arg::with_name("offset")
                        .required(true)
                        .help("Start address (0x/0o/0b prefix or decimal)")
                )
                .arg(
                    Arg::with_name("length")
                        .required(true)
                        .help("Number of bytes to read")
                )
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("List available serial ports")
                .setting(AppSettings::ColoredHelp)
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    let matches = app.get_matches();

    init_logger(match matches.occurrences_of("v") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u64::MAX => log::LevelFilter::Trace,
    })?;

    if let ("list", _) = matches.subcommand() {
        return list::list();
    }

    let opts = Opts::from_matches(&matches)?;

    log::info!("Opening serial port `{}`", opts.port);
    let mut port = dialog_sbl::open_port(&opts.port, opts.initial_baudrate)
        .with_context(|| {
            format!("Couldn't open serial port `{}`", opts.port)
        })?;

    if let ("reset", _) = matches.subcommand() {
        log::info!("Resetting device");
        let mut bootrom = Bootrom::new(port);
        bootrom.reset().context("Failed to pulse the reset line")?;
        return Ok(());
    }

    if !opts.skip_loader {
        let loader_path = opts.loader.as_deref().context(
            "--loader is required unless --skip-loader is specified",
        )?;
        let image = fs::read(loader_path).with_context(|| {
            format!("Couldn't read loader image `{}`", loader_path)
        })?;

        log::info!(
            "Uploading loader `{}` ({} bytes)",
            loader_path,
            image.len()
        );
        let mut bootrom = Bootrom::new(port);
        bootrom.upload(&image).context("Loader upload failed")?;
        port = bootrom.into_port();
    }

    let mut session = LoaderSession::new(port, opts.initial_baudrate)
        .context("Failed to start the loader session")?;

    if !session.sync(constants::SYNC_TRIES)? {
        anyhow::bail!("Failed to synchronize with the loader");
    }

    if opts.baudrate != opts.initial_baudrate {
        log::info!(
            "Changing baudrate {} -> {}",
            opts.initial_baudrate,
            opts.baudrate
        );
        if !session.set_baudrate(opts.baudrate)? {
            anyhow::bail!(
                "Failed to synchronize with the loader after the baudrate change"
            );
        }
    }

    match matches.subcommand() {
        ("chip_id", _) => match session.chip_id()? {
            Some(chip_id) => println!("{}", chip_id),
            None => anyhow::bail!("No chip id reply from the loader"),
        },
        ("flash_info", _) => match session.flash_info()? {
            Some(flash_size) => println!(
                "Flash size: {} bytes ({} K)",
                flash_size,
                flash_size / 1024
            ),
            None => anyhow::bail!("No flash info reply from the loader"),
        },
        ("read_flash", Some(matches)) => {
            flash::read_flash(matches, &mut session)?
        }
        ("write_flash", Some(matches)) => {
            flash::write_flash(matches, &mut session)?
        }
        ("read_mem", Some(matches)) => {
            flash::read_mem(matches, &mut session)?
        }
        _ => unreachable!(),
    }

    Ok(())
}

struct Opts {
    port: String,
    baudrate: u32,
    initial_baudrate: u32,
    loader: Option<String>,
    skip_loader: bool,
}

impl Opts {
    fn from_matches(matches: &clap::ArgMatches<'_>) -> Result<Opts> {
        Ok(Opts {
            port: matches.value_of("PORT").unwrap().to_string(),
            baudrate: matches
                .value_of("baudrate")
                .unwrap()
                .parse()
                .context("Invalid baudrate")?,
            initial_baudrate: matches
                .value_of("initial-baudrate")
                .unwrap()
                .parse()
                .context("Invalid initial baudrate")?,
            loader: matches.value_of("loader").map(str::to_string),
            skip_loader: matches.is_present("skip-loader"),
        })
    }
}

fn init_logger(level: log::LevelFilter) -> Result<()> {
    let mut logger = env_logger::Builder::from_env("DIALOG_SBL_LOG");
    logger.filter_level(level);

    #[cfg(unix)]
    logger.format(log_format_color);
    #[cfg(not(unix))]
    logger.format(log_format_no_color);

    logger.try_init().context("Failed to initialize logger")
}

#[cfg(unix)]
fn log_format_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> std::io::Result<()> {
    let level = match record.level() {
        log::Level::Error => ansi_term::Color::Red.bold().paint("ERROR"),
        log::Level::Warn => ansi_term::Color::Yellow.bold().paint("WARN"),
        log::Level::Info => ansi_term::Color::Green.bold().paint("INFO"),
        log::Level::Debug => ansi_term::Color::Cyan.bold().paint("DBG"),
        log::Level::Trace => ansi_term::Color::Cyan.bold().paint("TRACE"),
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}

#[cfg(not(unix))]
fn log_format_no_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> std::io::Result<()> {
    let level = match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN",
        log::Level::Info => "INFO",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRACE",
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}
