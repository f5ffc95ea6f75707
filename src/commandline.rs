use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use isdt_lib::hidapi::{PRODUCT_ID, VENDOR_ID};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Test the connection and show the boot mode
    LinkTest,
    /// Identify the charger: model, hardware, bootloader and application versions
    Version,
    /// Show the metrics of one or more channels
    Metrics {
        /// Channels to query
        #[arg(long, short, num_args = 1.., default_values_t = [0u8, 1, 2, 3])]
        channels: Vec<u8>,
    },
    /// Show the raw detail words of a channel
    ChannelDetail {
        /// Channel to query, channels from 6 on read channel 0
        #[arg(default_value_t = 0)]
        channel: u8,
    },
    /// Show input voltage, temperatures and output power
    Sensors,
    /// Show the per cell voltages of a balance charging channel
    CellVoltages,
    /// Show the unique id of the charger
    UniqueId,
    /// Rename the charger, it reboots afterwards
    Rename {
        /// New name, at most 8 bytes
        #[arg(long, short)]
        name: String,
    },
    /// Set the bit mask of enabled user interface languages
    Languages {
        #[arg(value_parser = maybe_hex::<u16>)]
        mask: u16,
    },
    /// Write the serial number
    SetSerial {
        /// At most 16 ASCII characters
        serial: String,
    },
    /// Write the user id
    SetUserId {
        #[arg(value_parser = maybe_hex::<u32>)]
        user_id: u32,
    },
    /// Reboot into the boot loader
    BootLoader,
    /// Reboot into the application
    BootApp,
    /// Let the boot loader verify the flashed application against a firmware image
    VerifyFw {
        /// Encrypted firmware image
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Show header and checksums of a firmware image, no charger needed
    FwInfo {
        /// Encrypted firmware image
        #[arg(long, short)]
        file: PathBuf,
    },
    /// Decrypt a firmware image, no charger needed
    DecryptFw {
        /// Encrypted firmware image
        #[arg(long, short)]
        file: PathBuf,
        /// Destination of the decrypted body
        #[arg(long, short = 'w')]
        outfile: PathBuf,
    },
    /// List attached HID devices
    List {
        /// Show every HID device, not only the selected vendor and product id
        #[arg(long, short, action)]
        all: bool,
    },
    /// Show which commands each model accepts in each mode
    Capabilities,
    /// Send an arbitrary opcode, bypassing the capability check (Use with caution!)
    RawCommand {
        /// Confirms that the charger may end up in a broken state
        #[arg(long = "i-know-this-one-breaks-things", action)]
        confirmed: bool,
        /// Opcode followed by its parameter bytes
        #[arg(long, num_args = 1.., required = true, value_parser = maybe_hex::<u8>)]
        command: Vec<u8>,
    },
}

const fn about_text() -> &'static str {
    "ISDT charger command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// HID device path, takes precedence over vendor and product id
    #[arg(long)]
    pub path: Option<String>,

    /// USB vendor id (e.g., 0x28e9)
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = VENDOR_ID)]
    pub vid: u16,

    /// USB product id (e.g., 0x028a)
    #[arg(long, value_parser = maybe_hex::<u16>, default_value_t = PRODUCT_ID)]
    pub pid: u16,

    /// Timeout for a single response (e.g., "200ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "200ms")]
    pub timeout: Duration,

    /// Print JSON instead of plain text
    #[arg(long, action)]
    pub json: bool,

    #[command(subcommand)]
    pub command: CliCommands,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parses_hex_arguments() {
        let args = CliArgs::parse_from([
            "isdt",
            "--vid",
            "0x1234",
            "raw-command",
            "--i-know-this-one-breaks-things",
            "--command",
            "0xde",
            "1",
        ]);
        assert_eq!(args.vid, 0x1234);
        assert_eq!(args.pid, PRODUCT_ID);
        assert_eq!(args.timeout, Duration::from_millis(200));
        assert_eq!(
            args.command,
            CliCommands::RawCommand {
                confirmed: true,
                command: vec![0xDE, 0x01]
            }
        );
    }

    #[test]
    fn raw_command_needs_opcode() {
        assert!(CliArgs::try_parse_from(["isdt", "raw-command"]).is_err());
        let args = CliArgs::parse_from(["isdt", "raw-command", "--command", "0xde"]);
        assert!(matches!(
            args.command,
            CliCommands::RawCommand {
                confirmed: false,
                ..
            }
        ));
    }

    #[test]
    fn metrics_default_to_four_channels() {
        let args = CliArgs::parse_from(["isdt", "metrics"]);
        assert_eq!(
            args.command,
            CliCommands::Metrics {
                channels: vec![0, 1, 2, 3]
            }
        );
    }
}
