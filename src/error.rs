use crate::capability::{Command, Mode, Model};
use crate::codec::FrameError;
use crate::exchange::ExchangeError;
use std::time::Duration;

/// Errors raised while turning a response payload into a record.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("response {opcode:#04x} carries {actual} bytes, expected at least {expected}")]
    TooShort {
        opcode: u8,
        expected: usize,
        actual: usize,
    },
    #[error("response {opcode:#04x} is inconsistent: {reason}")]
    Inconsistent { opcode: u8, reason: String },
    #[error("response {opcode:#04x} reports unknown outcome {value:#04x}")]
    UnknownOutcome { opcode: u8, value: u8 },
    #[error("expected response {expected:#04x}, received {received:#04x}")]
    UnexpectedOpcode { expected: u8, received: u8 },
    #[error("{record} cannot be read from a {reply} reply")]
    UnexpectedReply {
        record: &'static str,
        reply: &'static str,
    },
    #[error("response decoded into an unexpected {0} record")]
    UnexpectedRecord(&'static str),
}

/// Where in the request pipeline an [`Error`] was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capability,
    Encode,
    Transport,
    Timeout,
    Frame,
    Decode,
}

/// Error returned by every [`Session`](crate::session::Session) call.
///
/// Each variant carries the command that was attempted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(
        "{command} is not supported by model {model} in {mode} mode{}",
        supported_hint(.supported_in)
    )]
    Unsupported {
        command: Command,
        model: Model,
        mode: Mode,
        supported_in: Vec<(Model, Mode)>,
    },
    #[error("invalid parameter for {command}: {reason}")]
    InvalidParameter {
        command: Command,
        reason: &'static str,
    },
    #[error("cannot encode {command}: {source}")]
    Encode { command: Command, source: FrameError },
    #[error("transport failure during {command}: {source}")]
    Transport {
        command: Command,
        source: std::io::Error,
    },
    #[error("{command} received no response within {timeout:?}")]
    Timeout { command: Command, timeout: Duration },
    #[error("malformed response to {command}: {source}")]
    Frame { command: Command, source: FrameError },
    #[error("{command} was answered with opcode {received:#04x} instead of {expected:#04x}")]
    OpcodeMismatch {
        command: Command,
        expected: u8,
        received: u8,
    },
    #[error("{command} returned a frame that differs from the last received one")]
    ResendMismatch { command: Command },
    #[error("cannot decode response to {command}: {source}")]
    Decode {
        command: Command,
        source: DecodeError,
    },
}

fn supported_hint(supported_in: &[(Model, Mode)]) -> String {
    if supported_in.is_empty() {
        return String::new();
    }
    let list = supported_in
        .iter()
        .map(|(model, mode)| format!("{model} ({mode})"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("; supported by {list}")
}

impl Error {
    pub(crate) fn from_exchange(command: Command, err: ExchangeError) -> Self {
        match err {
            ExchangeError::Transport(source) => Error::Transport { command, source },
            ExchangeError::Timeout(timeout) => Error::Timeout { command, timeout },
            ExchangeError::Encode(source) => Error::Encode { command, source },
            ExchangeError::Frame(source) => Error::Frame { command, source },
            ExchangeError::OpcodeMismatch { expected, received } => Error::OpcodeMismatch {
                command,
                expected,
                received,
            },
            ExchangeError::ResendMismatch => Error::ResendMismatch { command },
        }
    }

    pub fn command(&self) -> Command {
        match self {
            Error::Unsupported { command, .. }
            | Error::InvalidParameter { command, .. }
            | Error::Encode { command, .. }
            | Error::Transport { command, .. }
            | Error::Timeout { command, .. }
            | Error::Frame { command, .. }
            | Error::OpcodeMismatch { command, .. }
            | Error::ResendMismatch { command }
            | Error::Decode { command, .. } => *command,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Error::Unsupported { .. } => Stage::Capability,
            Error::InvalidParameter { .. } | Error::Encode { .. } => Stage::Encode,
            Error::Transport { .. } => Stage::Transport,
            Error::Timeout { .. } => Stage::Timeout,
            Error::Frame { .. } | Error::OpcodeMismatch { .. } | Error::ResendMismatch { .. } => {
                Stage::Frame
            }
            Error::Decode { .. } => Stage::Decode,
        }
    }
}
