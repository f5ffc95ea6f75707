//! One request, one answer: the request/response cycle over a report transport.

use crate::capability::ResponseShape;
use crate::codec::{
    self, CodecConfig, Direction, Frame, FrameError, RawEnvelope, Reassembler, Report,
};
use std::io;
use std::time::{Duration, Instant};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default time to wait for the first report of an answer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);

// Upper bound of stale reports discarded before a request.
const DRAIN_LIMIT: usize = 4 * codec::MAX_PACKETS;

/// Sends and receives whole 64-byte reports.
pub trait Transport {
    fn write_report(&mut self, report: &Report) -> io::Result<()>;

    /// Waits up to `timeout` for the next report. `Ok(None)` means the timeout elapsed.
    fn read_report(&mut self, timeout: Duration) -> io::Result<Option<Report>>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write_report(&mut self, report: &Report) -> io::Result<()> {
        (**self).write_report(report)
    }

    fn read_report(&mut self, timeout: Duration) -> io::Result<Option<Report>> {
        (**self).read_report(timeout)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("cannot encode request: {0}")]
    Encode(FrameError),
    #[error("malformed response: {0}")]
    Frame(FrameError),
    #[error("expected response opcode {expected:#04x}, received {received:#04x}")]
    OpcodeMismatch { expected: u8, received: u8 },
    #[error("resent frame differs from the last received frame")]
    ResendMismatch,
}

type Result<T> = std::result::Result<T, ExchangeError>;

/// What came back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Reply {
    Frame(Frame),
    Raw(RawEnvelope),
    Silent,
}

impl Reply {
    /// Bytes after the response opcode, or the whole body of a raw envelope.
    pub fn payload(&self) -> &[u8] {
        match self {
            Reply::Frame(frame) => &frame.payload,
            Reply::Raw(raw) => &raw.body,
            Reply::Silent => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Frame(_) => "framed",
            Reply::Raw(_) => "raw",
            Reply::Silent => "silent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingResponse { opcode: u8 },
}

/// Owns the transport and enforces one outstanding request at a time.
#[derive(Debug)]
pub struct Exchange<T> {
    transport: T,
    codec: CodecConfig,
    timeout: Duration,
    state: State,
    last_received: Option<Frame>,
}

impl<T: Transport> Exchange<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, CodecConfig::default(), DEFAULT_TIMEOUT)
    }

    pub fn with_config(transport: T, codec: CodecConfig, timeout: Duration) -> Self {
        Self {
            transport,
            codec,
            timeout,
            state: State::Idle,
            last_received: None,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_codec(&mut self, codec: CodecConfig) {
        self.codec = codec;
    }

    pub fn codec(&self) -> CodecConfig {
        self.codec
    }

    /// Last framed answer, the reference for a resend. A raw envelope reply clears it.
    pub fn last_received(&self) -> Option<&Frame> {
        self.last_received.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Request opcode whose answer is being awaited.
    pub fn pending_opcode(&self) -> Option<u8> {
        match self.state {
            State::Idle => None,
            State::AwaitingResponse { opcode } => Some(opcode),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Sends `opcode` with `params` once and waits for the answer `shape` describes.
    pub fn transact(&mut self, opcode: u8, params: &[u8], shape: ResponseShape) -> Result<Reply> {
        let reports = codec::encode(Direction::HostToCharger, opcode, params, &self.codec)
            .map_err(ExchangeError::Encode)?;
        self.drain()?;
        for report in &reports {
            log::trace!("send_report: {:?}", report);
            self.transport.write_report(report)?;
        }
        if shape == ResponseShape::None {
            log::debug!("Opcode {:#04x} is not answered, not waiting", opcode);
            return Ok(Reply::Silent);
        }

        self.state = State::AwaitingResponse { opcode };
        let result = self.await_response(opcode, shape);
        self.state = State::Idle;
        result
    }

    fn drain(&mut self) -> Result<()> {
        for _ in 0..DRAIN_LIMIT {
            match self.transport.read_report(Duration::ZERO)? {
                Some(report) => log::debug!("Dropping stale report {:?}", report),
                None => return Ok(()),
            }
        }
        log::warn!("Still receiving after dropping {} stale reports", DRAIN_LIMIT);
        Ok(())
    }

    fn await_response(&mut self, opcode: u8, shape: ResponseShape) -> Result<Reply> {
        let deadline = Instant::now() + self.timeout;
        let mut reassembler = Reassembler::new(self.codec);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(report) = self.transport.read_report(remaining)? else {
                if reassembler.is_empty() {
                    log::debug!("No response to opcode {:#04x} within {:?}", opcode, self.timeout);
                    return Err(ExchangeError::Timeout(self.timeout));
                }
                return Err(ExchangeError::Frame(FrameError::Truncated(
                    reassembler.packets(),
                )));
            };
            log::trace!("receive_report: {:?}", report);

            if shape == ResponseShape::RawEnvelope {
                let raw =
                    RawEnvelope::from_report(&report[..], &self.codec).map_err(ExchangeError::Frame)?;
                if raw.direction != Direction::ChargerToHost {
                    return Err(ExchangeError::Frame(FrameError::UnexpectedDirection(
                        raw.direction,
                    )));
                }
                // raw envelopes cannot be compared with a resent frame
                self.last_received = None;
                return Ok(Reply::Raw(raw));
            }

            if let Some(frame) = reassembler.push(&report[..]).map_err(ExchangeError::Frame)? {
                return self.accept(opcode, shape, frame);
            }
        }
    }

    fn accept(&mut self, opcode: u8, shape: ResponseShape, frame: Frame) -> Result<Reply> {
        if frame.direction != Direction::ChargerToHost {
            return Err(ExchangeError::Frame(FrameError::UnexpectedDirection(
                frame.direction,
            )));
        }
        let previous = self.last_received.replace(frame.clone());
        match shape {
            ResponseShape::Resend => match previous {
                Some(previous) if previous != frame => {
                    log::warn!(
                        "Resent frame differs - previous={:02X?} received={:02X?}",
                        previous,
                        frame
                    );
                    Err(ExchangeError::ResendMismatch)
                }
                _ => Ok(Reply::Frame(frame)),
            },
            _ => {
                let expected = opcode.wrapping_add(1);
                if frame.opcode != expected {
                    log::warn!(
                        "Unexpected response opcode - expected={:#04x} received={:#04x}",
                        expected,
                        frame.opcode
                    );
                    return Err(ExchangeError::OpcodeMismatch {
                        expected,
                        received: frame.opcode,
                    });
                }
                Ok(Reply::Frame(frame))
            }
        }
    }
}
