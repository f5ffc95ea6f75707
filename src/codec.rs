//! Byte-stuffed framing used inside the 64-byte HID reports.
//!
//! A logical frame travels as
//!
//! ```text
//! first:        [dir][len][0xAA][recipient][size][opcode][payload ...][checksum][0-pad]
//! continuation: [dir][len][escaped continuation ...][0-pad]
//! ```
//!
//! Everything after the `0xAA` sync marker is the escaped domain, where every `0xAA`
//! is doubled. `size` counts the opcode and payload bytes, the checksum is the
//! wrapping sum of recipient, size, opcode and payload.

use std::fmt;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const REPORT_SIZE: usize = 64;
const HEADER_LENGTH: usize = 2;
/// Bytes of escaped stream one report can carry.
pub const CHUNK_CAPACITY: usize = REPORT_SIZE - HEADER_LENGTH;
pub const SYNC: u8 = 0xAA;
/// A frame spread over more reports than this is treated as corruption.
pub const MAX_PACKETS: usize = 8;
/// The size byte limits opcode + payload to 255 bytes.
pub const MAX_FRAME_SIZE: usize = u8::MAX as usize;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("packet of {0} bytes is too short")]
    ShortPacket(usize),
    #[error("unknown direction byte {0:#04x}")]
    UnknownDirection(u8),
    #[error("direction changed from {first:?} to {got:?} within one frame")]
    DirectionChanged { first: Direction, got: Direction },
    #[error("recipient byte {recipient:#04x} does not match direction {direction:?}")]
    RecipientMismatch { direction: Direction, recipient: u8 },
    #[error("first packet starts with {0:#04x} instead of the sync marker")]
    MissingSync(u8),
    #[error("unpaired sync byte at escaped offset {0}")]
    UnpairedSync(usize),
    #[error("declared frame size is zero")]
    EmptyFrame,
    #[error("frame declares {declared} bytes but the final packet ended after {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("checksum mismatch - calculated={calculated:#04x} received={received:#04x}")]
    Checksum { calculated: u8, received: u8 },
    #[error("frame incomplete after {0} packets")]
    Truncated(usize),
    #[error("frame needs more than {MAX_PACKETS} packets")]
    TooManyPackets,
    #[error("declared length {declared} is smaller than the length bias {bias}")]
    LengthUnderflow { declared: u8, bias: u8 },
    #[error("declared length {declared} runs past the end of the report")]
    LengthOverflow { declared: u8 },
    #[error("frame of {0} bytes does not fit into the packet limit")]
    Oversized(usize),
    #[error("unexpected {0:?} frame")]
    UnexpectedDirection(Direction),
}

/// Who sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Direction {
    HostToCharger,
    ChargerToHost,
}

impl Direction {
    /// First byte of every report.
    pub const fn packet_byte(self) -> u8 {
        match self {
            Direction::HostToCharger => 0x01,
            Direction::ChargerToHost => 0x02,
        }
    }

    /// First byte of the escaped domain.
    pub const fn recipient_byte(self) -> u8 {
        match self {
            Direction::HostToCharger => 0x12,
            Direction::ChargerToHost => 0x21,
        }
    }

    pub fn from_packet_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Direction::HostToCharger),
            0x02 => Some(Direction::ChargerToHost),
            _ => None,
        }
    }
}

/// How the `len` byte of every report relates to the bytes it carries.
///
/// Application and bootloader firmware disagree by two on what the length covers.
/// `length_bias` is added when encoding and subtracted when decoding. With
/// `clamp_overlong` a declared length that runs past the report is read as an upper
/// bound instead of an error; bytes after the checksum are ignored either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    pub length_bias: u8,
    pub clamp_overlong: bool,
}

impl CodecConfig {
    /// Requests carry exact chunk lengths. Application answers sometimes declare two
    /// bytes more than they carry, so overlong lengths are clamped.
    pub const APPLICATION: CodecConfig = CodecConfig {
        length_bias: 0,
        clamp_overlong: true,
    };
    /// The bootloader and the official updater declare exact chunk lengths both ways.
    pub const BOOTLOADER: CodecConfig = CodecConfig {
        length_bias: 0,
        clamp_overlong: false,
    };
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self::APPLICATION
    }
}

/// One fixed size HID report.
#[derive(Clone, PartialEq, Eq)]
pub struct Report([u8; REPORT_SIZE]);

impl Report {
    pub fn zeroed() -> Self {
        Self([0; REPORT_SIZE])
    }

    /// Copies `bytes` into a zero padded report, dropping anything past 64 bytes.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut report = Self::zeroed();
        let length = bytes.len().min(REPORT_SIZE);
        report.0[..length].copy_from_slice(&bytes[..length]);
        report
    }
}

impl Deref for Report {
    type Target = [u8; REPORT_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Report {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl AsRef<[u8]> for Report {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.0)
    }
}

/// One whole request or response, independent of how many reports carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub direction: Direction,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(opcode: u8, payload: &[u8]) -> Self {
        Self {
            direction: Direction::HostToCharger,
            opcode,
            payload: payload.to_vec(),
        }
    }

    pub fn response(opcode: u8, payload: &[u8]) -> Self {
        Self {
            direction: Direction::ChargerToHost,
            opcode,
            payload: payload.to_vec(),
        }
    }

    pub fn encode(&self, config: &CodecConfig) -> Result<Vec<Report>, FrameError> {
        encode(self.direction, self.opcode, &self.payload, config)
    }
}

/// Body of a report that bypasses the escaped, checksummed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEnvelope {
    pub direction: Direction,
    pub body: Vec<u8>,
}

impl RawEnvelope {
    pub fn from_report(packet: &[u8], config: &CodecConfig) -> Result<Self, FrameError> {
        let direction = packet_direction(packet)?;
        let body = packet_body(packet, config)?;
        Ok(Self {
            direction,
            body: body.to_vec(),
        })
    }
}

/// Wrapping 8-bit sum, used for frame checksums.
pub fn checksum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Wrapping 32-bit sum, used for firmware image checksums.
pub fn checksum32<I: IntoIterator<Item = u32>>(words: I) -> u32 {
    words.into_iter().fold(0u32, |sum, w| sum.wrapping_add(w))
}

/// Appends `bytes` to `out`, doubling every sync byte.
pub fn escape(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == SYNC {
            out.push(SYNC);
        }
        out.push(b);
    }
}

/// Un-escapes at most `limit` logical bytes. A trailing lone sync byte is left for
/// the next packet to complete.
fn unescape(escaped: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
    let mut result = Vec::with_capacity(limit.min(escaped.len()));
    let mut offset = 0;
    while offset < escaped.len() && result.len() < limit {
        let b = escaped[offset];
        if b == SYNC {
            match escaped.get(offset + 1) {
                Some(&SYNC) => {
                    result.push(SYNC);
                    offset += 2;
                }
                Some(_) => return Err(FrameError::UnpairedSync(offset)),
                None => break,
            }
        } else {
            result.push(b);
            offset += 1;
        }
    }
    Ok(result)
}

/// Splits one logical frame into zero padded reports.
pub fn encode(
    direction: Direction,
    opcode: u8,
    payload: &[u8],
    config: &CodecConfig,
) -> Result<Vec<Report>, FrameError> {
    let size = payload.len() + 1;
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::Oversized(size));
    }

    let mut domain = Vec::with_capacity(size + 3);
    domain.push(direction.recipient_byte());
    domain.push(size as u8);
    domain.push(opcode);
    domain.extend_from_slice(payload);
    domain.push(checksum8(&domain));

    let mut stream = Vec::with_capacity(domain.len() * 2 + 1);
    stream.push(SYNC);
    escape(&domain, &mut stream);

    if stream.len().div_ceil(CHUNK_CAPACITY) > MAX_PACKETS {
        return Err(FrameError::Oversized(size));
    }

    let reports = stream
        .chunks(CHUNK_CAPACITY)
        .map(|chunk| {
            let mut report = Report::zeroed();
            report[0] = direction.packet_byte();
            report[1] = chunk.len() as u8 + config.length_bias;
            report[HEADER_LENGTH..HEADER_LENGTH + chunk.len()].copy_from_slice(chunk);
            report
        })
        .collect::<Vec<_>>();
    log::trace!(
        "Encoded opcode {:#04x} with {} payload bytes into {} reports",
        opcode,
        payload.len(),
        reports.len()
    );
    Ok(reports)
}

/// Decodes a complete packet sequence. Packets after the end of the frame are ignored.
pub fn decode<P: AsRef<[u8]>>(packets: &[P], config: &CodecConfig) -> Result<Frame, FrameError> {
    let mut reassembler = Reassembler::new(*config);
    for packet in packets {
        if let Some(frame) = reassembler.push(packet.as_ref())? {
            return Ok(frame);
        }
    }
    Err(FrameError::Truncated(reassembler.packets()))
}

fn packet_direction(packet: &[u8]) -> Result<Direction, FrameError> {
    let first = *packet.first().ok_or(FrameError::ShortPacket(0))?;
    Direction::from_packet_byte(first).ok_or(FrameError::UnknownDirection(first))
}

fn packet_body<'a>(packet: &'a [u8], config: &CodecConfig) -> Result<&'a [u8], FrameError> {
    if packet.len() < HEADER_LENGTH {
        return Err(FrameError::ShortPacket(packet.len()));
    }
    let declared = packet[1];
    let length = declared
        .checked_sub(config.length_bias)
        .ok_or(FrameError::LengthUnderflow {
            declared,
            bias: config.length_bias,
        })? as usize;
    let available = packet.len() - HEADER_LENGTH;
    if length > available {
        if !config.clamp_overlong {
            return Err(FrameError::LengthOverflow { declared });
        }
        return Ok(&packet[HEADER_LENGTH..]);
    }
    Ok(&packet[HEADER_LENGTH..HEADER_LENGTH + length])
}

/// Collects the reports of one inbound frame.
#[derive(Debug)]
pub struct Reassembler {
    config: CodecConfig,
    direction: Option<Direction>,
    escaped: Vec<u8>,
    packets: usize,
}

impl Reassembler {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            direction: None,
            escaped: Vec::with_capacity(CHUNK_CAPACITY),
            packets: 0,
        }
    }

    /// Number of packets consumed so far.
    pub fn packets(&self) -> usize {
        self.packets
    }

    pub fn is_empty(&self) -> bool {
        self.packets == 0
    }

    /// Feeds one report. Returns the frame once it is complete and checksum-valid.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Frame>, FrameError> {
        let direction = packet_direction(packet)?;
        match self.direction {
            None => self.direction = Some(direction),
            Some(first) if first != direction => {
                return Err(FrameError::DirectionChanged {
                    first,
                    got: direction,
                })
            }
            Some(_) => {}
        }
        if self.packets >= MAX_PACKETS {
            return Err(FrameError::TooManyPackets);
        }
        self.packets += 1;

        let body = packet_body(packet, &self.config)?;
        let final_packet = body.len() < CHUNK_CAPACITY;
        if self.packets == 1 {
            match body.split_first() {
                Some((&SYNC, rest)) => self.escaped.extend_from_slice(rest),
                Some((&other, _)) => return Err(FrameError::MissingSync(other)),
                None => return Err(FrameError::ShortPacket(packet.len())),
            }
        } else {
            self.escaped.extend_from_slice(body);
        }

        self.try_complete(direction, final_packet)
    }

    fn try_complete(
        &self,
        direction: Direction,
        final_packet: bool,
    ) -> Result<Option<Frame>, FrameError> {
        let header = unescape(&self.escaped, 2)?;
        if header.len() < 2 {
            return self.incomplete(0, header.len().saturating_sub(2), final_packet);
        }
        let size = header[1] as usize;
        if size == 0 {
            return Err(FrameError::EmptyFrame);
        }

        // recipient + size + (opcode, payload) + checksum
        let logical = unescape(&self.escaped, size + 3)?;
        if logical.len() < size + 3 {
            return self.incomplete(size, logical.len() - 2, final_packet);
        }

        let recipient = logical[0];
        if recipient != direction.recipient_byte() {
            return Err(FrameError::RecipientMismatch {
                direction,
                recipient,
            });
        }

        let calculated = checksum8(&logical[..size + 2]);
        let received = logical[size + 2];
        if calculated != received {
            log::warn!(
                "Invalid checksum - calculated={:02X?} received={:02X?} frame={:02X?}",
                calculated,
                received,
                logical
            );
            return Err(FrameError::Checksum {
                calculated,
                received,
            });
        }

        Ok(Some(Frame {
            direction,
            opcode: logical[2],
            payload: logical[3..size + 2].to_vec(),
        }))
    }

    fn incomplete(
        &self,
        declared: usize,
        actual: usize,
        final_packet: bool,
    ) -> Result<Option<Frame>, FrameError> {
        if final_packet {
            log::warn!(
                "Frame ended early - declared={} received={} packets={}",
                declared,
                actual,
                self.packets
            );
            return Err(FrameError::SizeMismatch { declared, actual });
        }
        Ok(None)
    }
}
