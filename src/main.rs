use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use isdt_lib::capability::{CapabilityMatrix, Command, Mode, Model};
use isdt_lib::firmware;
use isdt_lib::hidapi::{list_devices, HidTransport};
use isdt_lib::protocol::Request;
use isdt_lib::session::{Session, SessionConfig};
use log::*;
use serde::Serialize;
use std::{fmt, ops::Deref, panic, sync::Arc};

mod commandline;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn print_record<R: Serialize + fmt::Display>(json: bool, record: &R) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(record).context("Cannot serialize output")?
        );
    } else {
        println!("{record}");
    }
    Ok(())
}

macro_rules! print_response {
    ($args:expr, $charger:expr, $request:expr) => {{
        let request = $request;
        let command = request.command();
        let response = $charger
            .invoke(request)
            .with_context(|| format!("Cannot run {command}"))?;
        print_record($args.json, &response)?
    }};
}

#[derive(Serialize)]
struct CapabilityRow {
    opcode: u8,
    command: Command,
    supported_in: Vec<(Model, Mode)>,
}

impl fmt::Display for CapabilityRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} {:<22}", self.opcode, self.command.to_string())?;
        let supported = self
            .supported_in
            .iter()
            .filter(|(model, _)| *model != Model::Unknown)
            .map(|(model, mode)| format!("{model}/{mode}"))
            .collect::<Vec<_>>();
        write!(f, "{}", supported.join(" "))
    }
}

#[derive(Serialize)]
struct ImageInfo {
    header: firmware::ImageHeader,
    calculated_checksum: u32,
    checksum_matches: bool,
}

fn open_charger(args: &CliArgs) -> Result<Session<HidTransport>> {
    let transport = match &args.path {
        Some(path) => {
            HidTransport::open_path(path).with_context(|| format!("Cannot open charger '{path}'"))?
        }
        None => HidTransport::open(args.vid, args.pid).with_context(|| {
            format!("Cannot open charger {:04x}:{:04x}", args.vid, args.pid)
        })?,
    };
    let config = SessionConfig {
        timeout: args.timeout,
        ..Default::default()
    };
    Ok(Session::with_config(
        transport,
        Arc::new(CapabilityMatrix::standard()),
        config,
    ))
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    // commands that do not talk to a charger
    match &args.command {
        CliCommands::FwInfo { file } => {
            let image = firmware::inspect_file(file)
                .with_context(|| format!("Cannot inspect firmware '{}'", file.display()))?;
            if args.json {
                let info = ImageInfo {
                    header: image.header,
                    calculated_checksum: image.calculated_checksum,
                    checksum_matches: image.checksum_matches(),
                };
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{image}");
            }
            return Ok(());
        }
        CliCommands::DecryptFw { file, outfile } => {
            let image = firmware::inspect_file(file)
                .with_context(|| format!("Cannot decrypt firmware '{}'", file.display()))?;
            std::fs::write(outfile, &image.body)
                .with_context(|| format!("Cannot write '{}'", outfile.display()))?;
            println!("Embedded checksum:   {:#010x}", image.header.embedded_checksum);
            println!("Calculated checksum: {:#010x}", image.calculated_checksum);
            return Ok(());
        }
        CliCommands::List { all } => {
            let filter = if *all {
                None
            } else {
                Some((args.vid, args.pid))
            };
            let devices = list_devices(filter).context("Cannot list HID devices")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found.");
            } else {
                for device in devices {
                    println!(
                        "{:04x}:{:04x} interface {} {} {} {}",
                        device.vendor_id,
                        device.product_id,
                        device.interface_number,
                        device.manufacturer.as_deref().unwrap_or("-"),
                        device.product.as_deref().unwrap_or("-"),
                        device.path
                    );
                }
            }
            return Ok(());
        }
        CliCommands::Capabilities => {
            let rows = CapabilityMatrix::standard()
                .descriptors()
                .map(|descriptor| CapabilityRow {
                    opcode: descriptor.opcode,
                    command: descriptor.command,
                    supported_in: descriptor.legal.to_vec(),
                })
                .collect::<Vec<_>>();
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in rows {
                    println!("{row}");
                }
            }
            return Ok(());
        }
        _ => {}
    }

    let charger = open_charger(&args)?;

    match args.command {
        CliCommands::LinkTest => print_response!(args, charger, Request::LinkTest),
        CliCommands::Version => print_response!(args, charger, Request::Version),
        CliCommands::Metrics { ref channels } => {
            for channel in channels {
                print_response!(args, charger, Request::ChannelMetrics(*channel));
            }
        }
        CliCommands::ChannelDetail { channel } => {
            print_response!(args, charger, Request::ChannelDetail(channel))
        }
        CliCommands::Sensors => print_response!(args, charger, Request::Sensors),
        CliCommands::CellVoltages => print_response!(args, charger, Request::CellVoltages),
        CliCommands::UniqueId => print_response!(args, charger, Request::UniqueId),
        CliCommands::Rename { ref name } => {
            print_response!(args, charger, Request::Rename(name.clone()))
        }
        CliCommands::Languages { mask } => {
            print_response!(args, charger, Request::SetLanguages(mask))
        }
        CliCommands::SetSerial { ref serial } => {
            print_response!(args, charger, Request::SetSerial(serial.clone()))
        }
        CliCommands::SetUserId { user_id } => {
            print_response!(args, charger, Request::SetUserId(user_id))
        }
        CliCommands::BootLoader => print_response!(args, charger, Request::RebootToBootloader),
        CliCommands::BootApp => print_response!(args, charger, Request::RebootToApp),
        CliCommands::VerifyFw { ref file } => {
            let image = firmware::inspect_file(file)
                .with_context(|| format!("Cannot inspect firmware '{}'", file.display()))?;
            if !image.checksum_matches() {
                warn!(
                    "Firmware image checksum mismatch - embedded={:#010x} calculated={:#010x}",
                    image.header.embedded_checksum, image.calculated_checksum
                );
            }
            print_response!(
                args,
                charger,
                Request::VerifyFirmware(image.flash_region())
            )
        }
        CliCommands::RawCommand {
            confirmed,
            ref command,
        } => {
            if !confirmed {
                bail!("Raw commands need --i-know-this-one-breaks-things");
            }
            let Some((&opcode, params)) = command.split_first() else {
                bail!("Raw commands need an opcode");
            };
            let response = charger
                .invoke_unchecked(opcode, params)
                .with_context(|| format!("Cannot run opcode {opcode:#04x}"))?;
            print_record(args.json, &response)?
        }
        CliCommands::FwInfo { .. }
        | CliCommands::DecryptFw { .. }
        | CliCommands::List { .. }
        | CliCommands::Capabilities => {}
    }

    Ok(())
}
