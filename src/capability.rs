//! Which opcode may be sent to which charger, and how its answer looks.

use crate::error::DecodeError;
use crate::exchange::Reply;
use crate::protocol::{decoders, DecodeContext, Response};
use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Model {
    C4,
    A4,
    C4Evo,
    Unknown,
}

impl Model {
    /// Matches the NUL padded model string reported by the charger.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim_end_matches('\0').trim();
        if name.eq_ignore_ascii_case("C4") {
            Model::C4
        } else if name.eq_ignore_ascii_case("A4") {
            Model::A4
        } else if name.eq_ignore_ascii_case("C4EVO") {
            Model::C4Evo
        } else {
            Model::Unknown
        }
    }

    /// Byte the 0xAA echo appends after the echoed parameters.
    pub fn echo_marker(self) -> Option<u8> {
        match self {
            Model::C4 => Some(0xDE),
            Model::A4 => Some(0x00),
            Model::C4Evo | Model::Unknown => None,
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Model::C4 => write!(f, "C4"),
            Model::A4 => write!(f, "A4"),
            Model::C4Evo => write!(f, "C4EVO"),
            Model::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Mode {
    App,
    Bootloader,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::App => write!(f, "application"),
            Mode::Bootloader => write!(f, "bootloader"),
        }
    }
}

/// Opcodes the application firmware accepts without ever answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QuietOpcode {
    A2,
    A4,
    E2,
    E6,
}

impl QuietOpcode {
    pub const ALL: [QuietOpcode; 4] = [
        QuietOpcode::A2,
        QuietOpcode::A4,
        QuietOpcode::E2,
        QuietOpcode::E6,
    ];

    pub const fn opcode(self) -> u8 {
        match self {
            QuietOpcode::A2 => 0xA2,
            QuietOpcode::A4 => 0xA4,
            QuietOpcode::E2 => 0xE2,
            QuietOpcode::E6 => 0xE6,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|q| q.opcode() == opcode)
    }
}

/// Logical command, independent of its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Command {
    LinkTest,
    Version,
    Rename,
    SetLanguages,
    SetSerial,
    SetUserId,
    UniqueId,
    ChannelMetrics,
    ChannelDetail,
    Sensors,
    CellVoltages,
    RebootToBootloader,
    RebootToApp,
    VerifyFirmware,
    SyncEcho,
    StaleEcho,
    PlainEcho,
    ResendLast,
    Quiet(QuietOpcode),
    /// Opcode sent through the unchecked escape hatch.
    Raw(u8),
}

pub const RESEND_OPCODE: u8 = 0xA1;

impl Command {
    pub const fn opcode(self) -> u8 {
        match self {
            Command::LinkTest => 0x00,
            Command::Version => 0xE0,
            Command::Rename => 0xC0,
            Command::SetLanguages => 0xC2,
            Command::SetSerial => 0xAC,
            Command::SetUserId => 0xEE,
            Command::UniqueId => 0xC8,
            Command::ChannelMetrics => 0xDE,
            Command::ChannelDetail => 0xE4,
            Command::Sensors => 0xF8,
            Command::CellVoltages => 0xFA,
            Command::RebootToBootloader => 0xF0,
            Command::RebootToApp => 0xFC,
            Command::VerifyFirmware => 0xF6,
            Command::SyncEcho => 0xAA,
            Command::StaleEcho => 0xE8,
            Command::PlainEcho => 0xEC,
            Command::ResendLast => RESEND_OPCODE,
            Command::Quiet(quiet) => quiet.opcode(),
            Command::Raw(opcode) => opcode,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::LinkTest => write!(f, "link test"),
            Command::Version => write!(f, "version"),
            Command::Rename => write!(f, "rename"),
            Command::SetLanguages => write!(f, "set languages"),
            Command::SetSerial => write!(f, "set serial"),
            Command::SetUserId => write!(f, "set user id"),
            Command::UniqueId => write!(f, "unique id"),
            Command::ChannelMetrics => write!(f, "channel metrics"),
            Command::ChannelDetail => write!(f, "channel detail"),
            Command::Sensors => write!(f, "sensors"),
            Command::CellVoltages => write!(f, "cell voltages"),
            Command::RebootToBootloader => write!(f, "reboot to bootloader"),
            Command::RebootToApp => write!(f, "reboot to app"),
            Command::VerifyFirmware => write!(f, "verify firmware"),
            Command::SyncEcho => write!(f, "sync echo"),
            Command::StaleEcho => write!(f, "stale echo"),
            Command::PlainEcho => write!(f, "plain echo"),
            Command::ResendLast => write!(f, "resend last frame"),
            Command::Quiet(quiet) => write!(f, "quiet opcode {:#04x}", quiet.opcode()),
            Command::Raw(opcode) => write!(f, "raw opcode {:#04x}", opcode),
        }
    }
}

/// How the charger answers an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// Escaped, checksummed frame with opcode `request + 1`.
    Standard,
    /// Single report without sync, escaping or checksum.
    RawEnvelope,
    /// No answer at all.
    None,
    /// Repetition of the last frame the charger sent.
    Resend,
}

pub type Decoder = fn(&Reply, &DecodeContext) -> Result<Response, DecodeError>;

pub struct OpcodeDescriptor {
    pub opcode: u8,
    pub command: Command,
    pub shape: ResponseShape,
    pub decode: Decoder,
    pub legal: &'static [(Model, Mode)],
}

impl fmt::Debug for OpcodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeDescriptor")
            .field("opcode", &format_args!("{:#04x}", self.opcode))
            .field("command", &self.command)
            .field("shape", &self.shape)
            .field("legal", &self.legal)
            .finish_non_exhaustive()
    }
}

impl OpcodeDescriptor {
    pub fn response_opcode(&self) -> Option<u8> {
        match self.shape {
            ResponseShape::Standard => Some(self.opcode.wrapping_add(1)),
            _ => None,
        }
    }
}

use Mode::{App, Bootloader};
use Model::{C4Evo, A4, C4};

const IDENTIFY: &[(Model, Mode)] = &[
    (C4, App),
    (C4, Bootloader),
    (A4, App),
    (A4, Bootloader),
    (C4Evo, App),
    (C4Evo, Bootloader),
    (Model::Unknown, App),
    (Model::Unknown, Bootloader),
];
const ANY_MODE: &[(Model, Mode)] = &[
    (C4, App),
    (C4, Bootloader),
    (A4, App),
    (A4, Bootloader),
    (C4Evo, App),
    (C4Evo, Bootloader),
];
const ALL_APP: &[(Model, Mode)] = &[(C4, App), (A4, App), (C4Evo, App)];
const ALL_BOOTLOADER: &[(Model, Mode)] = &[(C4, Bootloader), (A4, Bootloader), (C4Evo, Bootloader)];
const C4_FAMILY_APP: &[(Model, Mode)] = &[(C4, App), (C4Evo, App)];
const C4_A4_APP: &[(Model, Mode)] = &[(C4, App), (A4, App)];
const C4_APP: &[(Model, Mode)] = &[(C4, App)];

macro_rules! descriptor {
    ($command:expr, $shape:ident, $decode:path, $legal:expr) => {
        OpcodeDescriptor {
            opcode: $command.opcode(),
            command: $command,
            shape: ResponseShape::$shape,
            decode: $decode,
            legal: $legal,
        }
    };
}

static DESCRIPTORS: &[OpcodeDescriptor] = &[
    descriptor!(Command::LinkTest, Standard, decoders::link_test, IDENTIFY),
    descriptor!(Command::Version, Standard, decoders::version, IDENTIFY),
    descriptor!(Command::Rename, Standard, decoders::acknowledgement, C4_FAMILY_APP),
    descriptor!(Command::SetLanguages, Standard, decoders::acknowledgement, C4_FAMILY_APP),
    descriptor!(Command::SetSerial, RawEnvelope, decoders::serial_record, ALL_APP),
    descriptor!(Command::SetUserId, RawEnvelope, decoders::serial_record, ALL_APP),
    descriptor!(Command::UniqueId, Standard, decoders::unique_id, ALL_APP),
    descriptor!(Command::ChannelMetrics, Standard, decoders::metrics, ALL_APP),
    descriptor!(Command::ChannelDetail, Standard, decoders::channel_detail, C4_FAMILY_APP),
    descriptor!(Command::Sensors, Standard, decoders::sensors, C4_FAMILY_APP),
    descriptor!(Command::CellVoltages, Standard, decoders::cell_voltages, C4_FAMILY_APP),
    descriptor!(Command::RebootToBootloader, Standard, decoders::mode_transition, ANY_MODE),
    descriptor!(Command::RebootToApp, Standard, decoders::mode_transition, ANY_MODE),
    descriptor!(Command::VerifyFirmware, Standard, decoders::firmware_verification, ALL_BOOTLOADER),
    descriptor!(Command::SyncEcho, Standard, decoders::sync_echo, C4_A4_APP),
    descriptor!(Command::StaleEcho, Standard, decoders::stale_echo, C4_APP),
    descriptor!(Command::PlainEcho, Standard, decoders::plain_echo, C4_A4_APP),
    descriptor!(Command::ResendLast, Resend, decoders::resent, ANY_MODE),
    descriptor!(Command::Quiet(QuietOpcode::A2), None, decoders::silent, C4_A4_APP),
    descriptor!(Command::Quiet(QuietOpcode::A4), None, decoders::silent, C4_A4_APP),
    descriptor!(Command::Quiet(QuietOpcode::E2), None, decoders::silent, C4_A4_APP),
    descriptor!(Command::Quiet(QuietOpcode::E6), None, decoders::silent, C4_A4_APP),
];

/// Immutable lookup of the opcode table, shared between sessions.
#[derive(Debug)]
pub struct CapabilityMatrix {
    by_opcode: BTreeMap<u8, &'static OpcodeDescriptor>,
}

impl CapabilityMatrix {
    pub fn standard() -> Self {
        Self::from_descriptors(DESCRIPTORS)
    }

    fn from_descriptors(descriptors: &'static [OpcodeDescriptor]) -> Self {
        let by_opcode = descriptors
            .iter()
            .map(|descriptor| (descriptor.opcode, descriptor))
            .collect();
        Self { by_opcode }
    }

    pub fn is_supported(&self, model: Model, mode: Mode, opcode: u8) -> bool {
        self.descriptor(opcode)
            .is_some_and(|descriptor| descriptor.legal.contains(&(model, mode)))
    }

    pub fn supported_in(&self, opcode: u8) -> Vec<(Model, Mode)> {
        self.descriptor(opcode)
            .map(|descriptor| descriptor.legal.to_vec())
            .unwrap_or_default()
    }

    pub fn descriptor(&self, opcode: u8) -> Option<&'static OpcodeDescriptor> {
        self.by_opcode.get(&opcode).copied()
    }

    pub fn descriptor_for(&self, command: Command) -> Option<&'static OpcodeDescriptor> {
        self.descriptor(command.opcode())
            .filter(|descriptor| descriptor.command == command)
    }

    /// All descriptors ordered by opcode.
    pub fn descriptors(&self) -> impl Iterator<Item = &'static OpcodeDescriptor> + '_ {
        self.by_opcode.values().copied()
    }
}

impl Default for CapabilityMatrix {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_names_are_matched_loosely() {
        assert_eq!(Model::from_name("C4\0\0\0\0\0\0"), Model::C4);
        assert_eq!(Model::from_name("a4"), Model::A4);
        assert_eq!(Model::from_name("C4EVO\0\0\0"), Model::C4Evo);
        assert_eq!(Model::from_name("Q6"), Model::Unknown);
        assert_eq!(Model::from_name(""), Model::Unknown);
    }

    #[test]
    fn identification_works_everywhere() {
        let matrix = CapabilityMatrix::standard();
        for model in [Model::C4, Model::A4, Model::C4Evo, Model::Unknown] {
            for mode in [Mode::App, Mode::Bootloader] {
                assert!(matrix.is_supported(model, mode, 0x00));
                assert!(matrix.is_supported(model, mode, 0xE0));
            }
        }
    }

    #[test]
    fn gating_follows_the_table() {
        let matrix = CapabilityMatrix::standard();
        assert!(matrix.is_supported(Model::C4, Mode::App, 0xF8));
        assert!(!matrix.is_supported(Model::A4, Mode::App, 0xF8));
        assert!(!matrix.is_supported(Model::C4, Mode::Bootloader, 0xF8));
        assert!(matrix.is_supported(Model::A4, Mode::Bootloader, 0xF6));
        assert!(!matrix.is_supported(Model::A4, Mode::App, 0xF6));
        assert!(matrix.is_supported(Model::C4, Mode::App, 0xE8));
        assert!(!matrix.is_supported(Model::C4Evo, Mode::App, 0xAA));
        assert!(!matrix.is_supported(Model::Unknown, Mode::App, 0xDE));
        assert!(!matrix.is_supported(Model::C4, Mode::App, 0x42));
    }

    // opcode, then the modes legal for C4, A4 and C4EVO (A = app, B = bootloader)
    const GRID: &[(u8, &str, &str, &str)] = &[
        (0x00, "AB", "AB", "AB"),
        (0xE0, "AB", "AB", "AB"),
        (0xC0, "A", "", "A"),
        (0xC2, "A", "", "A"),
        (0xAC, "A", "A", "A"),
        (0xEE, "A", "A", "A"),
        (0xC8, "A", "A", "A"),
        (0xDE, "A", "A", "A"),
        (0xE4, "A", "", "A"),
        (0xF8, "A", "", "A"),
        (0xFA, "A", "", "A"),
        (0xF0, "AB", "AB", "AB"),
        (0xFC, "AB", "AB", "AB"),
        (0xF6, "B", "B", "B"),
        (0xAA, "A", "A", ""),
        (0xE8, "A", "", ""),
        (0xEC, "A", "A", ""),
        (0xA1, "AB", "AB", "AB"),
        (0xA2, "A", "A", ""),
        (0xA4, "A", "A", ""),
        (0xE2, "A", "A", ""),
        (0xE6, "A", "A", ""),
    ];

    #[test]
    fn every_cell_of_the_grid() {
        let matrix = CapabilityMatrix::standard();
        assert_eq!(matrix.descriptors().count(), GRID.len());
        for &(opcode, c4, a4, c4evo) in GRID {
            assert!(matrix.descriptor(opcode).is_some(), "{opcode:#04x} missing");
            let identify = matches!(opcode, 0x00 | 0xE0);
            for (model, cell) in [
                (Model::C4, c4),
                (Model::A4, a4),
                (Model::C4Evo, c4evo),
                (Model::Unknown, if identify { "AB" } else { "" }),
            ] {
                for (mode, letter) in [(Mode::App, 'A'), (Mode::Bootloader, 'B')] {
                    assert_eq!(
                        matrix.is_supported(model, mode, opcode),
                        cell.contains(letter),
                        "{opcode:#04x} {model} {mode}"
                    );
                }
            }
        }
    }

    #[test]
    fn request_opcodes_are_even_except_resend() {
        let matrix = CapabilityMatrix::standard();
        for descriptor in matrix.descriptors() {
            if descriptor.command == Command::ResendLast {
                assert_eq!(descriptor.opcode % 2, 1);
            } else {
                assert_eq!(descriptor.opcode % 2, 0, "{}", descriptor.command);
            }
        }
    }

    #[test]
    fn lookups() {
        let matrix = CapabilityMatrix::standard();
        assert_eq!(
            matrix.supported_in(0xF8),
            vec![(Model::C4, Mode::App), (Model::C4Evo, Mode::App)]
        );
        assert!(matrix.supported_in(0x42).is_empty());
        let serial = matrix.descriptor_for(Command::SetSerial).unwrap();
        assert_eq!(serial.shape, ResponseShape::RawEnvelope);
        assert_eq!(serial.response_opcode(), None);
        let version = matrix.descriptor_for(Command::Version).unwrap();
        assert_eq!(version.response_opcode(), Some(0xE1));
        assert!(matrix.descriptor_for(Command::Raw(0xE0)).is_none());
        assert_eq!(
            matrix
                .descriptor(0xE6)
                .map(|descriptor| descriptor.command),
            Some(Command::Quiet(QuietOpcode::E6))
        );
    }
}
