use crate::capability::{Command, Mode, Model, QuietOpcode};
use crate::codec::Frame;
use crate::error::DecodeError;
use crate::exchange::Reply;
use crate::firmware::FlashRegion;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Names of the rename command are zero padded to this length.
pub const NAME_LENGTH: usize = 8;
pub const SERIAL_MAX_LENGTH: usize = 16;
/// Channel detail requests for higher channels are sent for channel 0.
pub const DETAIL_CHANNELS: u8 = 6;

const REBOOT_TO_BOOTLOADER_MAGIC: u8 = 0xAC;
const REBOOT_TO_APP_MAGIC: u8 = 0xCA;
const VERIFY_MAGIC: [u8; 2] = [0x35, 0x00];

fn validate_len(opcode: u8, payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        log::warn!(
            "Invalid payload size - opcode={:#04x} required={} received={}",
            opcode,
            expected,
            payload.len()
        );
        return Err(DecodeError::TooShort {
            opcode,
            expected,
            actual: payload.len(),
        });
    }
    Ok(())
}

fn ascii_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn i16_at(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Four part version as reported by the charger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VersionNumber(pub [u8; 4]);

impl fmt::Display for VersionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LinkTest {
    pub mode: Mode,
    /// Missing while a C4 runs its application firmware.
    pub model_name: Option<String>,
}

impl LinkTest {
    pub const RESPONSE: u8 = 0x01;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        match payload.len() {
            3 => Ok(Self {
                mode: Mode::App,
                model_name: None,
            }),
            9 => Ok(Self {
                mode: if payload[0] == 0 {
                    Mode::Bootloader
                } else {
                    Mode::App
                },
                model_name: Some(ascii_string(&payload[1..9])),
            }),
            length => Err(DecodeError::Inconsistent {
                opcode: Self::RESPONSE,
                reason: format!("link test answer of {length} bytes"),
            }),
        }
    }

    pub fn model(&self) -> Option<Model> {
        self.model_name.as_deref().map(Model::from_name)
    }
}

impl fmt::Display for LinkTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Link test succeeded, currently running the {}", self.mode)?;
        if let Some(name) = &self.model_name {
            write!(f, " of {name}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Version {
    pub preamble: [u8; 8],
    pub hardware: VersionNumber,
    pub bootloader: VersionNumber,
    pub application: VersionNumber,
    pub model_name: String,
    /// Looks like the build date of the bootloader, only sent by some firmware.
    pub build_time: Option<String>,
}

impl Version {
    pub const RESPONSE: u8 = 0xE1;
    const MIN_LENGTH: usize = 28;
    const BUILD_TIME_END: usize = 37;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, Self::MIN_LENGTH)?;
        let version = |offset: usize| {
            VersionNumber([
                payload[offset],
                payload[offset + 1],
                payload[offset + 2],
                payload[offset + 3],
            ])
        };
        let mut preamble = [0; 8];
        preamble.copy_from_slice(&payload[..8]);
        let build_time = (payload.len() >= Self::BUILD_TIME_END).then(|| {
            let t = &payload[32..Self::BUILD_TIME_END];
            format!(
                "20{:02}-{:02}-{:02} {:02}:{:02}",
                t[0], t[1], t[2], t[3], t[4]
            )
        });
        Ok(Self {
            preamble,
            hardware: version(8),
            bootloader: version(12),
            application: version(16),
            model_name: ascii_string(&payload[20..payload.len().min(30)]),
            build_time,
        })
    }

    pub fn model(&self) -> Model {
        Model::from_name(&self.model_name)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model name: {}", self.model_name)?;
        writeln!(f, "Hardware version {}", self.hardware)?;
        writeln!(f, "Bootloader version {}", self.bootloader)?;
        write!(f, "OS/App version {}", self.application)?;
        if let Some(build_time) = &self.build_time {
            write!(f, "\nBootloader build time {build_time}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelMode {
    Idle,
    Waiting,
    Reversed,
    Charging,
    Charged,
    Discharging,
    Discharged,
    Storage,
    StorageDone,
    /// Also reported while activating Ni cells.
    Cycling,
    CyclingDone,
    Analysis,
    AnalysisDone,
    Unknown(u8),
}

impl ChannelMode {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => ChannelMode::Idle,
            1 => ChannelMode::Waiting,
            2 => ChannelMode::Reversed,
            3 => ChannelMode::Charging,
            4 => ChannelMode::Charged,
            5 => ChannelMode::Discharging,
            6 => ChannelMode::Discharged,
            7 => ChannelMode::Storage,
            8 => ChannelMode::StorageDone,
            9 => ChannelMode::Cycling,
            10 => ChannelMode::CyclingDone,
            11 => ChannelMode::Analysis,
            12 => ChannelMode::AnalysisDone,
            other => ChannelMode::Unknown(other),
        }
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Idle => write!(f, "idling"),
            ChannelMode::Waiting => write!(f, "waiting"),
            ChannelMode::Reversed => write!(f, "reversed"),
            ChannelMode::Charging => write!(f, "charging"),
            ChannelMode::Charged => write!(f, "charged"),
            ChannelMode::Discharging => write!(f, "discharging"),
            ChannelMode::Discharged => write!(f, "discharged"),
            ChannelMode::Storage => write!(f, "storage"),
            ChannelMode::StorageDone => write!(f, "storage done"),
            ChannelMode::Cycling => write!(f, "cycling"),
            ChannelMode::CyclingDone => write!(f, "cycling done"),
            ChannelMode::Analysis => write!(f, "analysis"),
            ChannelMode::AnalysisDone => write!(f, "analysis done"),
            ChannelMode::Unknown(id) => write!(f, "unknown {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Chemistry {
    Auto,
    LiHv,
    LiIon,
    LiFePo4,
    NiZn,
    /// NiMH that was overcharged.
    NiMhOvercharged,
    Eneloop,
    NiCd,
    NiMh,
    Unknown(u8),
}

impl Chemistry {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => Chemistry::Auto,
            1 => Chemistry::LiHv,
            2 => Chemistry::LiIon,
            3 => Chemistry::LiFePo4,
            5 => Chemistry::NiZn,
            6 => Chemistry::NiMhOvercharged,
            7 => Chemistry::Eneloop,
            8 => Chemistry::NiCd,
            9 => Chemistry::NiMh,
            other => Chemistry::Unknown(other),
        }
    }
}

impl fmt::Display for Chemistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chemistry::Auto => write!(f, "auto"),
            Chemistry::LiHv => write!(f, "LiHv"),
            Chemistry::LiIon => write!(f, "Li-Ion"),
            Chemistry::LiFePo4 => write!(f, "LiFePO4"),
            Chemistry::NiZn => write!(f, "NiZn"),
            Chemistry::NiMhOvercharged => write!(f, "NiMH!!!"),
            Chemistry::Eneloop => write!(f, "Eneloop"),
            Chemistry::NiCd => write!(f, "NiCd"),
            Chemistry::NiMh => write!(f, "NiMH"),
            Chemistry::Unknown(id) => write!(f, "unknown {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CellSize {
    Aaa,
    Aa,
    S18650,
    S26650,
    Empty,
    Unknown(u8),
}

impl CellSize {
    pub fn from_id(id: u8) -> Self {
        match id {
            0 => CellSize::Aaa,
            1 => CellSize::Aa,
            2 => CellSize::S18650,
            3 => CellSize::S26650,
            4 => CellSize::Empty,
            other => CellSize::Unknown(other),
        }
    }
}

impl fmt::Display for CellSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellSize::Aaa => write!(f, "AAA"),
            CellSize::Aa => write!(f, "AA"),
            CellSize::S18650 => write!(f, "18650"),
            CellSize::S26650 => write!(f, "26650"),
            CellSize::Empty => write!(f, "empty"),
            CellSize::Unknown(id) => write!(f, "unknown {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelMetrics {
    pub channel: u8,
    pub mode: ChannelMode,
    pub chemistry: Chemistry,
    pub cell_size: CellSize,
    /// °C
    pub temperature: u8,
    /// °C, presumably the charging MOSFET
    pub internal_temperature: u8,
    /// %
    pub progress: u8,
    /// mV
    pub voltage: i16,
    /// mA
    pub current: i16,
    /// mΩ
    pub resistance: u16,
    pub power: i16,
    pub energy: i16,
    /// Capacity while charging, peak voltage for some modes
    pub capacity: i32,
    /// s
    pub elapsed: u32,
    /// Set when the values contradict each other or the request.
    pub malformed: bool,
}

impl ChannelMetrics {
    pub const RESPONSE: u8 = 0xDF;
    const LENGTH: usize = 25;

    /// `None` when the charger has no such channel.
    pub fn decode(payload: &[u8], requested: Option<u8>) -> Result<Option<Self>, DecodeError> {
        if payload.is_empty() {
            return Ok(None);
        }
        validate_len(Self::RESPONSE, payload, Self::LENGTH)?;
        let mut metrics = Self {
            channel: payload[0],
            mode: ChannelMode::from_id(payload[1]),
            chemistry: Chemistry::from_id(payload[2]),
            cell_size: CellSize::from_id(payload[3]),
            temperature: payload[4],
            internal_temperature: payload[5],
            progress: payload[6],
            voltage: i16_at(payload, 7),
            current: i16_at(payload, 9),
            resistance: u16_at(payload, 11),
            power: i16_at(payload, 13),
            energy: i16_at(payload, 15),
            capacity: i32::from_le_bytes([payload[17], payload[18], payload[19], payload[20]]),
            elapsed: u32_at(payload, 21),
            malformed: false,
        };
        let mut problems = Vec::new();
        if requested.is_some_and(|channel| channel != metrics.channel) {
            problems.push("channel differs from request");
        }
        if metrics.progress > 100 {
            problems.push("progress above 100 %");
        }
        if metrics.mode == ChannelMode::Idle && metrics.current != 0 {
            problems.push("current while idling");
        }
        if payload.len() > Self::LENGTH {
            problems.push("trailing bytes");
        }
        if !problems.is_empty() {
            log::warn!(
                "Malformed metrics - channel={} problems={:?} payload={:02X?}",
                metrics.channel,
                problems,
                payload
            );
            metrics.malformed = true;
        }
        Ok(Some(metrics))
    }
}

impl fmt::Display for ChannelMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.malformed {
            write!(f, "MALFORMED! ")?;
        }
        write!(
            f,
            "CH {} {:>13}: {:>7} {:>5} at {:>3} %, {:>2} °C, {:>6.3} V * {:>6.3} A, {:>3} mOhm, {} s",
            self.channel,
            self.mode.to_string(),
            self.chemistry.to_string(),
            self.cell_size.to_string(),
            self.progress,
            self.temperature,
            f32::from(self.voltage) / 1000.0,
            f32::from(self.current) / 1000.0,
            self.resistance,
            self.elapsed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sensors {
    pub preamble: [u8; 6],
    /// mV
    pub psu_voltage: u16,
    /// mV
    pub usb_voltage: u16,
    /// mV, meaning unknown
    pub unknown_voltages: [u16; 6],
    /// °C
    pub channel_temperatures: [u8; 4],
    /// °C, meaning unknown
    pub unknown_temperature: u8,
    pub trailing: Vec<u8>,
}

impl Sensors {
    pub const RESPONSE: u8 = 0xF9;
    const LENGTH: usize = 28;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, Self::LENGTH)?;
        let mut preamble = [0; 6];
        preamble.copy_from_slice(&payload[..6]);
        let mut unknown_voltages = [0; 6];
        for (i, voltage) in unknown_voltages.iter_mut().enumerate() {
            *voltage = u16_at(payload, 10 + 2 * i);
        }
        let mut channel_temperatures = [0; 4];
        channel_temperatures.copy_from_slice(&payload[22..26]);
        Ok(Self {
            preamble,
            psu_voltage: u16_at(payload, 6),
            usb_voltage: u16_at(payload, 8),
            unknown_voltages,
            channel_temperatures,
            unknown_temperature: payload[26],
            trailing: payload[27..].to_vec(),
        })
    }
}

impl fmt::Display for Sensors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PSU voltage: {} mV", self.psu_voltage)?;
        writeln!(f, "USB voltage: {} mV", self.usb_voltage)?;
        for (i, voltage) in self.unknown_voltages.iter().enumerate() {
            writeln!(f, "Unknown voltage {}: {} mV", i + 1, voltage)?;
        }
        for (i, temperature) in self.channel_temperatures.iter().enumerate() {
            writeln!(f, "Channel temperature {}: {} °C", i + 1, temperature)?;
        }
        write!(f, "Unknown temperature: {} °C", self.unknown_temperature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltagePair {
    /// mV
    pub charging: u16,
    /// mV, absent for the last channel
    pub cell: Option<u16>,
}

/// Per channel voltages as the firmware reports them.
///
/// The firmware writes every value one slot too late: the first charging voltage is
/// always zero and the last cell voltage falls off the end. The values are kept in
/// the reported slots and `shifted` says so.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CellVoltages {
    pub channels: Vec<CellVoltagePair>,
    pub shifted: bool,
}

impl CellVoltages {
    pub const RESPONSE: u8 = 0xFB;
    pub const SLOT_SHIFT_ARTIFACT: bool = true;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 2)?;
        if payload.len() % 2 != 0 {
            return Err(DecodeError::Inconsistent {
                opcode: Self::RESPONSE,
                reason: format!("odd number of voltage bytes ({})", payload.len()),
            });
        }
        let slots = payload
            .chunks_exact(2)
            .map(|slot| u16::from_le_bytes([slot[0], slot[1]]))
            .collect::<Vec<_>>();
        let channels = slots
            .iter()
            .enumerate()
            .map(|(i, charging)| CellVoltagePair {
                charging: *charging,
                cell: slots.get(i + 1).copied(),
            })
            .collect();
        Ok(Self {
            channels,
            shifted: Self::SLOT_SHIFT_ARTIFACT,
        })
    }
}

impl fmt::Display for CellVoltages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pair) in self.channels.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "Channel {}: charging {} mV, cell ", i, pair.charging)?;
            match pair.cell {
                Some(cell) => write!(f, "{cell} mV")?,
                None => write!(f, "n/a")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SyncEcho {
    pub echoed: Vec<u8>,
    pub marker: u8,
    /// `None` when the marker of the model is not known.
    pub marker_matches_model: Option<bool>,
}

impl SyncEcho {
    pub const RESPONSE: u8 = 0xAB;

    pub fn decode(payload: &[u8], model: Model) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 1)?;
        let (marker, echoed) = payload
            .split_last()
            .map(|(marker, echoed)| (*marker, echoed.to_vec()))
            .unwrap_or_default();
        let marker_matches_model = model.echo_marker().map(|expected| expected == marker);
        if marker_matches_model == Some(false) {
            log::warn!("Echo marker {:#04x} does not belong to {}", marker, model);
        }
        Ok(Self {
            echoed,
            marker,
            marker_matches_model,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StaleEcho {
    pub echoed: Vec<u8>,
    /// Left over from an earlier response, the firmware never sets them.
    pub stale: [u8; 2],
}

impl StaleEcho {
    pub const RESPONSE: u8 = 0xE9;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 2)?;
        let split = payload.len() - 2;
        Ok(Self {
            echoed: payload[..split].to_vec(),
            stale: [payload[split], payload[split + 1]],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Echo {
    pub echoed: Vec<u8>,
}

impl Echo {
    pub const RESPONSE: u8 = 0xED;

    pub fn decode(payload: &[u8]) -> Self {
        Self {
            echoed: payload.to_vec(),
        }
    }
}

/// Answer to the serial number and user id commands.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SerialRecord {
    pub response_opcode: u8,
    /// Shaped like `YYMMDDhhmmss`, kept as sent.
    pub timestamp: String,
    pub user_id: u32,
    pub tail: Vec<u8>,
}

impl SerialRecord {
    const TIMESTAMP_LENGTH: usize = 12;
    const LENGTH: usize = 1 + Self::TIMESTAMP_LENGTH + 4;

    pub fn decode(body: &[u8], expected_opcode: u8) -> Result<Self, DecodeError> {
        validate_len(expected_opcode, body, Self::LENGTH)?;
        if body[0] != expected_opcode {
            return Err(DecodeError::UnexpectedOpcode {
                expected: expected_opcode,
                received: body[0],
            });
        }
        Ok(Self {
            response_opcode: body[0],
            timestamp: ascii_string(&body[1..=Self::TIMESTAMP_LENGTH]),
            user_id: u32_at(body, 1 + Self::TIMESTAMP_LENGTH),
            tail: body[Self::LENGTH..].to_vec(),
        })
    }
}

impl fmt::Display for SerialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial {} user id {}", self.timestamp, self.user_id)
    }
}

/// Content of the unique ID register of the charger MCU.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UniqueId {
    pub id: [u8; 12],
    pub extra: Vec<u8>,
}

impl UniqueId {
    pub const RESPONSE: u8 = 0xC9;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 12)?;
        let mut id = [0; 12];
        id.copy_from_slice(&payload[..12]);
        Ok(Self {
            id,
            extra: payload[12..].to_vec(),
        })
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unique ID: {}", hex_string(&self.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChannelDetail {
    pub channel: u8,
    pub words: Vec<u16>,
    pub trailing: Option<u8>,
}

impl ChannelDetail {
    pub const RESPONSE: u8 = 0xE5;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 1)?;
        let words = payload[1..].chunks_exact(2);
        let trailing = words.remainder().first().copied();
        Ok(Self {
            channel: payload[0],
            words: words
                .map(|word| u16::from_le_bytes([word[0], word[1]]))
                .collect(),
            trailing,
        })
    }
}

/// Answer of commands that only confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Acknowledgement {
    pub status: Option<u8>,
    pub raw: Vec<u8>,
}

impl Acknowledgement {
    pub fn decode(payload: &[u8]) -> Self {
        Self {
            status: payload.first().copied(),
            raw: payload.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransitionOutcome {
    Confirmed,
    RefusedWhileCharging,
    Unknown(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ModeTransition {
    pub target: Mode,
    pub outcome: TransitionOutcome,
}

impl ModeTransition {
    pub const TO_BOOTLOADER: u8 = 0xF1;
    pub const TO_APP: u8 = 0xFD;

    pub fn decode(response_opcode: u8, payload: &[u8], model: Model) -> Result<Self, DecodeError> {
        let target = if response_opcode == Self::TO_APP {
            Mode::App
        } else {
            Mode::Bootloader
        };
        let outcome = match payload {
            // the bootloader confirms without a status byte
            [] if response_opcode == Self::TO_APP => TransitionOutcome::Confirmed,
            [] => {
                return Err(DecodeError::TooShort {
                    opcode: response_opcode,
                    expected: 1,
                    actual: 0,
                })
            }
            [0x00] => TransitionOutcome::Confirmed,
            [0x02] => TransitionOutcome::RefusedWhileCharging,
            [value] if model == Model::A4 && response_opcode == Self::TO_BOOTLOADER => {
                return Err(DecodeError::UnknownOutcome {
                    opcode: response_opcode,
                    value: *value,
                })
            }
            [value] => TransitionOutcome::Unknown(*value),
            _ => {
                return Err(DecodeError::Inconsistent {
                    opcode: response_opcode,
                    reason: format!("{} outcome bytes", payload.len()),
                })
            }
        };
        Ok(Self { target, outcome })
    }
}

impl fmt::Display for ModeTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            TransitionOutcome::Confirmed => write!(f, "Rebooting to {}.", self.target),
            TransitionOutcome::RefusedWhileCharging => {
                write!(f, "Reboot to {} refused while charging.", self.target)
            }
            TransitionOutcome::Unknown(value) => {
                write!(f, "Reboot to {} answered {:#04x}.", self.target, value)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FirmwareVerification {
    pub matches: bool,
    pub raw: Vec<u8>,
}

impl FirmwareVerification {
    pub const RESPONSE: u8 = 0xF7;

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        validate_len(Self::RESPONSE, payload, 2)?;
        Ok(Self {
            matches: payload[1] == 0x00,
            raw: payload.to_vec(),
        })
    }
}

impl fmt::Display for FirmwareVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matches {
            write!(f, "The checksum matches the image in flash.")
        } else {
            write!(f, "The checksum DOES NOT match the image in flash.")
        }
    }
}

/// A command together with its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    LinkTest,
    Version,
    Rename(String),
    SetLanguages(u16),
    SetSerial(String),
    SetUserId(u32),
    UniqueId,
    ChannelMetrics(u8),
    ChannelDetail(u8),
    Sensors,
    CellVoltages,
    RebootToBootloader,
    RebootToApp,
    VerifyFirmware(FlashRegion),
    SyncEcho(Vec<u8>),
    StaleEcho(Vec<u8>),
    PlainEcho(Vec<u8>),
    ResendLast,
    Quiet(QuietOpcode, Vec<u8>),
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::LinkTest => Command::LinkTest,
            Request::Version => Command::Version,
            Request::Rename(_) => Command::Rename,
            Request::SetLanguages(_) => Command::SetLanguages,
            Request::SetSerial(_) => Command::SetSerial,
            Request::SetUserId(_) => Command::SetUserId,
            Request::UniqueId => Command::UniqueId,
            Request::ChannelMetrics(_) => Command::ChannelMetrics,
            Request::ChannelDetail(_) => Command::ChannelDetail,
            Request::Sensors => Command::Sensors,
            Request::CellVoltages => Command::CellVoltages,
            Request::RebootToBootloader => Command::RebootToBootloader,
            Request::RebootToApp => Command::RebootToApp,
            Request::VerifyFirmware(_) => Command::VerifyFirmware,
            Request::SyncEcho(_) => Command::SyncEcho,
            Request::StaleEcho(_) => Command::StaleEcho,
            Request::PlainEcho(_) => Command::PlainEcho,
            Request::ResendLast => Command::ResendLast,
            Request::Quiet(quiet, _) => Command::Quiet(*quiet),
        }
    }

    /// Channel the answer is expected to refer to.
    pub fn channel(&self) -> Option<u8> {
        match self {
            Request::ChannelMetrics(channel) => Some(*channel),
            Request::ChannelDetail(channel) if *channel < DETAIL_CHANNELS => Some(*channel),
            Request::ChannelDetail(_) => Some(0),
            _ => None,
        }
    }

    /// Parameter bytes following the opcode.
    pub fn params(&self) -> Result<Vec<u8>, &'static str> {
        let params = match self {
            Request::LinkTest
            | Request::Version
            | Request::UniqueId
            | Request::Sensors
            | Request::CellVoltages
            | Request::ResendLast => Vec::new(),
            Request::Rename(name) => {
                let name = name.as_bytes();
                if name.len() > NAME_LENGTH {
                    return Err("name is longer than 8 bytes");
                }
                let mut params = name.to_vec();
                params.resize(NAME_LENGTH, 0);
                params
            }
            Request::SetLanguages(mask) => mask.to_le_bytes().to_vec(),
            Request::SetSerial(serial) => {
                if !serial.is_ascii() {
                    return Err("serial must be ASCII");
                }
                if serial.len() > SERIAL_MAX_LENGTH {
                    return Err("serial is longer than 16 bytes");
                }
                serial.as_bytes().to_vec()
            }
            Request::SetUserId(user_id) => user_id.to_le_bytes().to_vec(),
            Request::ChannelMetrics(channel) => vec![*channel],
            Request::ChannelDetail(_) => vec![self.channel().unwrap_or_default()],
            Request::RebootToBootloader => vec![REBOOT_TO_BOOTLOADER_MAGIC],
            Request::RebootToApp => vec![REBOOT_TO_APP_MAGIC],
            Request::VerifyFirmware(region) => {
                let mut params = VERIFY_MAGIC.to_vec();
                params.extend_from_slice(&region.offset.to_le_bytes());
                params.extend_from_slice(&region.size.to_le_bytes());
                params.extend_from_slice(&region.checksum.to_le_bytes());
                params
            }
            Request::SyncEcho(bytes)
            | Request::StaleEcho(bytes)
            | Request::PlainEcho(bytes)
            | Request::Quiet(_, bytes) => bytes.clone(),
        };
        Ok(params)
    }
}

/// Everything a decoder needs besides the reply itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub model: Model,
    pub mode: Mode,
    /// Request opcode.
    pub opcode: u8,
    pub channel: Option<u8>,
}

/// Decoded answer of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Response {
    LinkTest(LinkTest),
    Version(Version),
    Acknowledged(Acknowledgement),
    Serial(SerialRecord),
    UniqueId(UniqueId),
    /// `None` when the channel does not exist.
    Metrics(Option<ChannelMetrics>),
    ChannelDetail(ChannelDetail),
    Sensors(Sensors),
    CellVoltages(CellVoltages),
    ModeTransition(ModeTransition),
    FirmwareVerification(FirmwareVerification),
    SyncEcho(SyncEcho),
    StaleEcho(StaleEcho),
    Echo(Echo),
    Resent(Frame),
    Unparsed(Reply),
    Silent,
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::LinkTest(_) => "link test",
            Response::Version(_) => "version",
            Response::Acknowledged(_) => "acknowledgement",
            Response::Serial(_) => "serial",
            Response::UniqueId(_) => "unique id",
            Response::Metrics(_) => "metrics",
            Response::ChannelDetail(_) => "channel detail",
            Response::Sensors(_) => "sensors",
            Response::CellVoltages(_) => "cell voltages",
            Response::ModeTransition(_) => "mode transition",
            Response::FirmwareVerification(_) => "firmware verification",
            Response::SyncEcho(_) => "sync echo",
            Response::StaleEcho(_) => "stale echo",
            Response::Echo(_) => "echo",
            Response::Resent(_) => "resent frame",
            Response::Unparsed(_) => "unparsed",
            Response::Silent => "silent",
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::LinkTest(record) => fmt::Display::fmt(record, f),
            Response::Version(record) => fmt::Display::fmt(record, f),
            Response::Acknowledged(record) => match record.status {
                Some(status) => write!(f, "Acknowledged with status {status:#04x}"),
                None => write!(f, "Acknowledged"),
            },
            Response::Serial(record) => fmt::Display::fmt(record, f),
            Response::UniqueId(record) => fmt::Display::fmt(record, f),
            Response::Metrics(Some(record)) => fmt::Display::fmt(record, f),
            Response::Metrics(None) => write!(f, "Channel does not exist."),
            Response::ChannelDetail(record) => {
                write!(f, "CH {} detail: {:04x?}", record.channel, record.words)
            }
            Response::Sensors(record) => fmt::Display::fmt(record, f),
            Response::CellVoltages(record) => fmt::Display::fmt(record, f),
            Response::ModeTransition(record) => fmt::Display::fmt(record, f),
            Response::FirmwareVerification(record) => fmt::Display::fmt(record, f),
            Response::SyncEcho(record) => {
                write!(f, "Echo {} marker {:#04x}", hex_string(&record.echoed), record.marker)
            }
            Response::StaleEcho(record) => write!(
                f,
                "Echo {} stale {}",
                hex_string(&record.echoed),
                hex_string(&record.stale)
            ),
            Response::Echo(record) => write!(f, "Echo {}", hex_string(&record.echoed)),
            Response::Resent(frame) => write!(
                f,
                "Resent {:#04x} {}",
                frame.opcode,
                hex_string(&frame.payload)
            ),
            Response::Unparsed(reply) => write!(f, "{}", hex_string(reply.payload())),
            Response::Silent => write!(f, "Sent, no answer expected."),
        }
    }
}

/// Glue between the opcode table and the record decoders.
pub(crate) mod decoders {
    use super::*;

    fn frame<'a>(reply: &'a Reply, record: &'static str) -> Result<&'a Frame, DecodeError> {
        match reply {
            Reply::Frame(frame) => Ok(frame),
            other => Err(DecodeError::UnexpectedReply {
                record,
                reply: other.kind(),
            }),
        }
    }

    pub fn link_test(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        LinkTest::decode(&frame(reply, "link test")?.payload).map(Response::LinkTest)
    }

    pub fn version(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        Version::decode(&frame(reply, "version")?.payload).map(Response::Version)
    }

    pub fn acknowledgement(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        let frame = frame(reply, "acknowledgement")?;
        Ok(Response::Acknowledged(Acknowledgement::decode(
            &frame.payload,
        )))
    }

    pub fn serial_record(reply: &Reply, context: &DecodeContext) -> Result<Response, DecodeError> {
        match reply {
            Reply::Raw(raw) => SerialRecord::decode(&raw.body, context.opcode.wrapping_add(1))
                .map(Response::Serial),
            other => Err(DecodeError::UnexpectedReply {
                record: "serial",
                reply: other.kind(),
            }),
        }
    }

    pub fn unique_id(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        UniqueId::decode(&frame(reply, "unique id")?.payload).map(Response::UniqueId)
    }

    pub fn metrics(reply: &Reply, context: &DecodeContext) -> Result<Response, DecodeError> {
        ChannelMetrics::decode(&frame(reply, "metrics")?.payload, context.channel)
            .map(Response::Metrics)
    }

    pub fn channel_detail(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        ChannelDetail::decode(&frame(reply, "channel detail")?.payload)
            .map(Response::ChannelDetail)
    }

    pub fn sensors(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        Sensors::decode(&frame(reply, "sensors")?.payload).map(Response::Sensors)
    }

    pub fn cell_voltages(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        CellVoltages::decode(&frame(reply, "cell voltages")?.payload).map(Response::CellVoltages)
    }

    pub fn mode_transition(reply: &Reply, context: &DecodeContext) -> Result<Response, DecodeError> {
        let frame = frame(reply, "mode transition")?;
        ModeTransition::decode(frame.opcode, &frame.payload, context.model)
            .map(Response::ModeTransition)
    }

    pub fn firmware_verification(
        reply: &Reply,
        _: &DecodeContext,
    ) -> Result<Response, DecodeError> {
        FirmwareVerification::decode(&frame(reply, "firmware verification")?.payload)
            .map(Response::FirmwareVerification)
    }

    pub fn sync_echo(reply: &Reply, context: &DecodeContext) -> Result<Response, DecodeError> {
        SyncEcho::decode(&frame(reply, "sync echo")?.payload, context.model)
            .map(Response::SyncEcho)
    }

    pub fn stale_echo(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        StaleEcho::decode(&frame(reply, "stale echo")?.payload).map(Response::StaleEcho)
    }

    pub fn plain_echo(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        Ok(Response::Echo(Echo::decode(
            &frame(reply, "echo")?.payload,
        )))
    }

    pub fn resent(reply: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        frame(reply, "resent frame").map(|frame| Response::Resent(frame.clone()))
    }

    pub fn silent(_: &Reply, _: &DecodeContext) -> Result<Response, DecodeError> {
        Ok(Response::Silent)
    }
}
