// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

#[cfg(test)]
mod test_util;

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use raw_block::raw::RawDisk;
use raw_block::{AioCompletion, AioContext, IoBuffer, OpenFlags, SECTOR_SIZE};
use rawdisk::{cli_print_error_chain, ToolConfig};

fn create_app() -> Command {
    Command::new("rawdisk")
        .version(env!("BUILT_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Inspect and drive raw host disks and disk images.")
        .arg_required_else_help(true)
        .subcommand_required(true)
        .args([
            Arg::new("config")
                .long("config")
                .help("JSON file with \"disk\" and \"aio\" settings")
                .num_args(1)
                .value_parser(value_parser!(PathBuf)),
            Arg::new("direct")
                .long("direct")
                .help("Bypass the host page cache")
                .action(ArgAction::SetTrue),
            Arg::new("host-device")
                .long("host-device")
                .help("Open the image as a host device (/dev/cd*, /dev/fd*, ...)")
                .action(ArgAction::SetTrue),
            Arg::new("image")
                .help("Path to the disk image or host device")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
            Arg::new("readonly")
                .long("readonly")
                .help("Never open the disk for writing")
                .action(ArgAction::SetTrue),
        ])
        .subcommands([
            Command::new("aio-read")
                .about("Read sectors through the asynchronous engine")
                .args([
                    Arg::new("count")
                        .long("count")
                        .help("Number of sectors")
                        .required(true)
                        .value_parser(value_parser!(u32)),
                    Arg::new("output")
                        .long("output")
                        .help("Output file, standard output when omitted")
                        .value_parser(value_parser!(PathBuf)),
                    Arg::new("sector")
                        .long("sector")
                        .help("First sector")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ]),
            Command::new("create")
                .about("Create an image file of the given size")
                .arg(
                    Arg::new("sectors")
                        .long("sectors")
                        .help("Size in sectors")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
            Command::new("eject")
                .about("Eject the medium")
                .arg(
                    Arg::new("close")
                        .long("close")
                        .help("Close the tray instead")
                        .action(ArgAction::SetTrue),
                ),
            Command::new("info").about("Print disk properties"),
            Command::new("lock").about("Lock the drive door"),
            Command::new("media-changed").about("Report whether the medium changed"),
            Command::new("read")
                .about("Read a byte range")
                .args([
                    Arg::new("length")
                        .long("length")
                        .help("Number of bytes")
                        .required(true)
                        .value_parser(value_parser!(usize)),
                    Arg::new("offset")
                        .long("offset")
                        .help("Byte offset")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                    Arg::new("output")
                        .long("output")
                        .help("Output file, standard output when omitted")
                        .value_parser(value_parser!(PathBuf)),
                ]),
            Command::new("truncate")
                .about("Resize an image file")
                .arg(
                    Arg::new("sectors")
                        .long("sectors")
                        .help("New size in sectors")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ),
            Command::new("unlock").about("Unlock the drive door"),
            Command::new("write")
                .about("Write the content of a file at a byte offset")
                .args([
                    Arg::new("input")
                        .long("input")
                        .help("File holding the data to write")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                    Arg::new("offset")
                        .long("offset")
                        .help("Byte offset")
                        .required(true)
                        .value_parser(value_parser!(u64)),
                ]),
        ])
}

fn open_disk(
    matches: &ArgMatches,
    config: &ToolConfig,
    writable: bool,
) -> anyhow::Result<RawDisk> {
    // These .unwrap()s cannot fail as the argument is required
    let image = matches.get_one::<PathBuf>("image").unwrap();

    let mut flags = OpenFlags::empty();
    if writable && !matches.get_flag("readonly") {
        flags |= OpenFlags::READ_WRITE;
    }
    if matches.get_flag("direct") {
        flags |= OpenFlags::DIRECT;
    }

    let disk = if matches.get_flag("host-device") {
        RawDisk::open_host_device(image, flags, config.disk.clone())
    } else {
        RawDisk::open(image, flags, config.disk.clone())
    };
    disk.with_context(|| format!("Failed to open {image:?}"))
}

fn write_output(output: Option<&PathBuf>, data: &[u8]) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            fs::write(path, data).with_context(|| format!("Failed to write {path:?}"))
        }
        None => io::stdout()
            .lock()
            .write_all(data)
            .context("Failed to write to standard output"),
    }
}

fn print_info(disk: &mut RawDisk) -> anyhow::Result<()> {
    let length = disk.length().context("Failed to get disk length")?;
    let inserted = match disk.is_inserted() {
        Ok(inserted) => inserted.to_string(),
        Err(e) => format!("unknown ({e})"),
    };

    println!("path: {}", disk.path().display());
    println!("class: {:?}", disk.class());
    println!("driver: {:?}", disk.driver());
    println!("length: {length}");
    println!("sectors: {}", length / SECTOR_SIZE);
    println!("read-only: {}", disk.is_read_only());
    println!("direct: {}", disk.is_direct());
    println!("scsi-generic: {}", disk.is_scsi_generic());
    println!("inserted: {inserted}");
    Ok(())
}

fn aio_read(
    disk: &mut RawDisk,
    config: &ToolConfig,
    sector: u64,
    count: u32,
) -> anyhow::Result<Vec<u8>> {
    let mut ctx = AioContext::new(&config.aio).context("Failed to set up async I/O")?;
    let buffer = IoBuffer::new(count as usize * SECTOR_SIZE as usize)?;

    let slot: Arc<Mutex<Option<AioCompletion>>> = Arc::default();
    let completion = slot.clone();
    disk.aio_read(
        &mut ctx,
        sector,
        count,
        buffer,
        Box::new(move |c| *completion.lock().unwrap() = Some(c)),
    )
    .context("Failed to submit async read")?;
    ctx.flush().context("Failed to wait for async read")?;

    let completion = slot
        .lock()
        .unwrap()
        .take()
        .ok_or_else(|| anyhow!("Async read finished without completion"))?;
    completion.result.context("Async read failed")?;
    Ok(completion.buffer.to_vec())
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => ToolConfig::from_file(path)?,
        None => ToolConfig::default(),
    };
    let image = matches.get_one::<PathBuf>("image").unwrap();

    match matches.subcommand() {
        Some(("create", sub)) => {
            let sectors = *sub.get_one::<u64>("sectors").unwrap();
            RawDisk::create(image, sectors)
                .with_context(|| format!("Failed to create {image:?}"))?;
            info!("Created {image:?} with {sectors} sectors");
        }
        Some(("info", _)) => {
            let mut disk = open_disk(matches, &config, false)?;
            print_info(&mut disk)?;
        }
        Some(("read", sub)) => {
            let offset = *sub.get_one::<u64>("offset").unwrap();
            let length = *sub.get_one::<usize>("length").unwrap();
            let mut disk = open_disk(matches, &config, false)?;

            let mut data = vec![0u8; length];
            disk.read_at(offset, &mut data)
                .with_context(|| format!("Failed to read {length} bytes at {offset}"))?;
            write_output(sub.get_one::<PathBuf>("output"), &data)?;
        }
        Some(("write", sub)) => {
            let offset = *sub.get_one::<u64>("offset").unwrap();
            let input = sub.get_one::<PathBuf>("input").unwrap();
            let data = fs::read(input).with_context(|| format!("Failed to read {input:?}"))?;
            let mut disk = open_disk(matches, &config, true)?;

            disk.write_at(offset, &data)
                .with_context(|| format!("Failed to write {} bytes at {offset}", data.len()))?;
            disk.flush().context("Failed to flush disk")?;
        }
        Some(("aio-read", sub)) => {
            let sector = *sub.get_one::<u64>("sector").unwrap();
            let count = *sub.get_one::<u32>("count").unwrap();
            let mut disk = open_disk(matches, &config, false)?;

            let data = aio_read(&mut disk, &config, sector, count)?;
            write_output(sub.get_one::<PathBuf>("output"), &data)?;
        }
        Some(("truncate", sub)) => {
            let sectors = *sub.get_one::<u64>("sectors").unwrap();
            let mut disk = open_disk(matches, &config, true)?;
            disk.truncate(sectors).context("Failed to truncate disk")?;
        }
        Some(("eject", sub)) => {
            let mut disk = open_disk(matches, &config, false)?;
            disk.eject(!sub.get_flag("close"))
                .context("Failed to eject medium")?;
        }
        Some(("lock", _)) => {
            let mut disk = open_disk(matches, &config, false)?;
            disk.set_locked(true).context("Failed to lock drive")?;
        }
        Some(("unlock", _)) => {
            let mut disk = open_disk(matches, &config, false)?;
            disk.set_locked(false).context("Failed to unlock drive")?;
        }
        Some(("media-changed", _)) => {
            let mut disk = open_disk(matches, &config, false)?;
            let changed = disk
                .media_changed()
                .context("Failed to query media change")?;
            println!("{changed}");
        }
        Some((name, _)) => return Err(anyhow!("Unknown command {name}")),
        None => return Err(anyhow!("Missing command")),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let matches = create_app().get_matches();
    if let Err(e) = run(&matches) {
        cli_print_error_chain(e.as_ref(), "rawdisk");
        process::exit(1);
    }
}
