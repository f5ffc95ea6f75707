//! A charger behind a transport, with its identity cached.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "hidapi")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use isdt_lib::capability::CapabilityMatrix;
//! use isdt_lib::hidapi::{HidTransport, PRODUCT_ID, VENDOR_ID};
//! use isdt_lib::session::Session;
//! use std::sync::Arc;
//!
//! let transport = HidTransport::open(VENDOR_ID, PRODUCT_ID)?;
//! let charger = Session::new(transport, Arc::new(CapabilityMatrix::standard()));
//! println!("{:?}", charger.probe()?);
//! for channel in 0..4 {
//!     if let Some(metrics) = charger.metrics(channel)? {
//!         println!("{metrics}");
//!     }
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "hidapi"))]
//! # fn main() {}
//! ```

use crate::capability::{
    CapabilityMatrix, Command, Mode, Model, OpcodeDescriptor, QuietOpcode, ResponseShape,
};
use crate::codec::{CodecConfig, Frame};
use crate::error::{DecodeError, Error};
use crate::exchange::{Exchange, Transport, DEFAULT_TIMEOUT};
use crate::firmware::FlashRegion;
use crate::protocol::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub timeout: Duration,
    /// Framing while the application firmware runs, also used before the mode is known.
    pub app_codec: CodecConfig,
    /// Framing once the charger reports or confirms bootloader mode.
    pub bootloader_codec: CodecConfig,
}

impl SessionConfig {
    pub fn codec(&self, mode: Mode) -> CodecConfig {
        match mode {
            Mode::App => self.app_codec,
            Mode::Bootloader => self.bootloader_codec,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            app_codec: CodecConfig::APPLICATION,
            bootloader_codec: CodecConfig::BOOTLOADER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Identity {
    pub model: Model,
    pub mode: Mode,
    pub model_name: Option<String>,
}

impl Identity {
    fn unknown() -> Self {
        Self {
            model: Model::Unknown,
            mode: Mode::App,
            model_name: None,
        }
    }
}

#[derive(Debug)]
struct SessionState<T> {
    exchange: Exchange<T>,
    identity: Option<Identity>,
}

/// Serialises all traffic to one charger.
#[derive(Debug)]
pub struct Session<T> {
    capabilities: Arc<CapabilityMatrix>,
    config: SessionConfig,
    state: Mutex<SessionState<T>>,
}

macro_rules! typed {
    ($self:ident, $request:expr, $variant:ident) => {{
        let request = $request;
        let command = request.command();
        match $self.invoke(request)? {
            Response::$variant(record) => Ok(record),
            other => Err(unexpected_record(command, &other)),
        }
    }};
}

fn unexpected_record(command: Command, response: &Response) -> Error {
    Error::Decode {
        command,
        source: DecodeError::UnexpectedRecord(response.kind()),
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, capabilities: Arc<CapabilityMatrix>) -> Self {
        Self::with_config(transport, capabilities, SessionConfig::default())
    }

    pub fn with_config(
        transport: T,
        capabilities: Arc<CapabilityMatrix>,
        config: SessionConfig,
    ) -> Self {
        Self {
            capabilities,
            config,
            state: Mutex::new(SessionState {
                exchange: Exchange::with_config(transport, config.app_codec, config.timeout),
                identity: None,
            }),
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityMatrix> {
        &self.capabilities
    }

    fn lock(&self) -> MutexGuard<'_, SessionState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.lock().exchange.set_timeout(timeout);
    }

    pub fn timeout(&self) -> Duration {
        self.lock().exchange.timeout()
    }

    /// Framing currently used for the charger.
    pub fn codec(&self) -> CodecConfig {
        self.lock().exchange.codec()
    }

    pub fn into_transport(self) -> T {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .exchange
            .into_transport()
    }

    /// Asks the charger who it is and what it runs.
    pub fn probe(&self) -> Result<Identity, Error> {
        let mut state = self.lock();
        self.probe_locked(&mut state)
    }

    pub fn identity(&self) -> Option<Identity> {
        self.lock().identity.clone()
    }

    /// Uses `identity` without asking the charger.
    pub fn assume_identity(&self, identity: Identity) {
        log::debug!("Assuming {:?}", identity);
        let mut state = self.lock();
        self.follow_mode(&mut state, identity.mode);
        state.identity = Some(identity);
    }

    pub fn forget_identity(&self) {
        self.lock().identity = None;
    }

    fn probe_locked(&self, state: &mut SessionState<T>) -> Result<Identity, Error> {
        let unknown = Identity::unknown();
        let link = match self.run(state, Command::LinkTest, &[], &unknown, None)? {
            Response::LinkTest(link) => link,
            other => return Err(unexpected_record(Command::LinkTest, &other)),
        };
        self.follow_mode(state, link.mode);
        let model_name = match link.model_name {
            Some(name) => name,
            None => match self.run(state, Command::Version, &[], &unknown, None)? {
                Response::Version(version) => version.model_name,
                other => return Err(unexpected_record(Command::Version, &other)),
            },
        };
        let identity = Identity {
            model: Model::from_name(&model_name),
            mode: link.mode,
            model_name: Some(model_name),
        };
        log::debug!("Identified {} in {} mode", identity.model, identity.mode);
        state.identity = Some(identity.clone());
        Ok(identity)
    }

    fn follow_mode(&self, state: &mut SessionState<T>, mode: Mode) {
        let codec = self.config.codec(mode);
        if state.exchange.codec() != codec {
            log::debug!("Switching to {} mode framing {:?}", mode, codec);
            state.exchange.set_codec(codec);
        }
    }

    fn run(
        &self,
        state: &mut SessionState<T>,
        command: Command,
        params: &[u8],
        identity: &Identity,
        channel: Option<u8>,
    ) -> Result<Response, Error> {
        let descriptor = self.descriptor(command, identity)?;
        self.run_descriptor(state, descriptor, command, params, identity, channel)
    }

    fn descriptor(
        &self,
        command: Command,
        identity: &Identity,
    ) -> Result<&'static OpcodeDescriptor, Error> {
        self.capabilities
            .descriptor_for(command)
            .filter(|descriptor| descriptor.legal.contains(&(identity.model, identity.mode)))
            .ok_or_else(|| {
                log::warn!(
                    "Refusing {} for {} in {} mode",
                    command,
                    identity.model,
                    identity.mode
                );
                Error::Unsupported {
                    command,
                    model: identity.model,
                    mode: identity.mode,
                    supported_in: self.capabilities.supported_in(command.opcode()),
                }
            })
    }

    fn run_descriptor(
        &self,
        state: &mut SessionState<T>,
        descriptor: &OpcodeDescriptor,
        command: Command,
        params: &[u8],
        identity: &Identity,
        channel: Option<u8>,
    ) -> Result<Response, Error> {
        let reply = state
            .exchange
            .transact(descriptor.opcode, params, descriptor.shape)
            .map_err(|err| Error::from_exchange(command, err))?;
        let context = DecodeContext {
            model: identity.model,
            mode: identity.mode,
            opcode: descriptor.opcode,
            channel,
        };
        (descriptor.decode)(&reply, &context).map_err(|source| Error::Decode { command, source })
    }

    /// Sends `request` if the identified charger supports it and decodes the answer.
    pub fn invoke(&self, request: Request) -> Result<Response, Error> {
        let command = request.command();
        let params = request
            .params()
            .map_err(|reason| Error::InvalidParameter { command, reason })?;

        let mut state = self.lock();
        let identity = match state.identity.clone() {
            Some(identity) => identity,
            // identification works before the model is known
            None if matches!(command, Command::LinkTest | Command::Version) => Identity::unknown(),
            None => self.probe_locked(&mut state)?,
        };
        let response = self.run(&mut state, command, &params, &identity, request.channel())?;
        self.update_identity(&mut state, command, &response);
        Ok(response)
    }

    fn update_identity(
        &self,
        state: &mut SessionState<T>,
        command: Command,
        response: &Response,
    ) {
        match response {
            Response::ModeTransition(ModeTransition {
                target,
                outcome: TransitionOutcome::Confirmed,
            }) => {
                if let Some(identity) = state.identity.as_mut() {
                    log::debug!("Charger switches from {} to {} mode", identity.mode, target);
                    identity.mode = *target;
                }
                self.follow_mode(state, *target);
            }
            Response::LinkTest(link) => {
                self.follow_mode(state, link.mode);
                if let Some(name) = &link.model_name {
                    state.identity = Some(Identity {
                        model: Model::from_name(name),
                        mode: link.mode,
                        model_name: Some(name.clone()),
                    });
                } else if let Some(identity) = state.identity.as_mut() {
                    identity.mode = link.mode;
                }
            }
            Response::Version(version) => {
                if let Some(identity) = state.identity.as_mut() {
                    identity.model = version.model();
                    identity.model_name = Some(version.model_name.clone());
                }
            }
            Response::Acknowledged(_) if command == Command::Rename => {
                log::debug!("Charger reboots after renaming, identity needs to be read again");
                state.identity = None;
            }
            _ => {}
        }
    }

    /// Sends any opcode without checking the capability table.
    ///
    /// Known opcodes are decoded, anything else is returned unparsed.
    pub fn invoke_unchecked(&self, opcode: u8, params: &[u8]) -> Result<Response, Error> {
        log::warn!("Sending opcode {:#04x} without capability check", opcode);
        let mut state = self.lock();
        let identity = state.identity.clone().unwrap_or_else(Identity::unknown);
        match self.capabilities.descriptor(opcode) {
            Some(descriptor) => {
                let channel = match descriptor.command {
                    Command::ChannelMetrics | Command::ChannelDetail => params.first().copied(),
                    _ => None,
                };
                let response = self.run_descriptor(
                    &mut state,
                    descriptor,
                    descriptor.command,
                    params,
                    &identity,
                    channel,
                )?;
                self.update_identity(&mut state, descriptor.command, &response);
                Ok(response)
            }
            None => {
                let command = Command::Raw(opcode);
                let reply = state
                    .exchange
                    .transact(opcode, params, ResponseShape::Standard)
                    .map_err(|err| Error::from_exchange(command, err))?;
                Ok(Response::Unparsed(reply))
            }
        }
    }

    pub fn link_test(&self) -> Result<LinkTest, Error> {
        typed!(self, Request::LinkTest, LinkTest)
    }

    pub fn version(&self) -> Result<Version, Error> {
        typed!(self, Request::Version, Version)
    }

    /// Renames the charger, which reboots right away.
    pub fn rename(&self, name: &str) -> Result<Acknowledgement, Error> {
        typed!(self, Request::Rename(name.to_string()), Acknowledged)
    }

    pub fn set_languages(&self, mask: u16) -> Result<Acknowledgement, Error> {
        typed!(self, Request::SetLanguages(mask), Acknowledged)
    }

    pub fn set_serial(&self, serial: &str) -> Result<SerialRecord, Error> {
        typed!(self, Request::SetSerial(serial.to_string()), Serial)
    }

    pub fn set_user_id(&self, user_id: u32) -> Result<SerialRecord, Error> {
        typed!(self, Request::SetUserId(user_id), Serial)
    }

    pub fn unique_id(&self) -> Result<UniqueId, Error> {
        typed!(self, Request::UniqueId, UniqueId)
    }

    /// `None` when the charger has no such channel.
    pub fn metrics(&self, channel: u8) -> Result<Option<ChannelMetrics>, Error> {
        typed!(self, Request::ChannelMetrics(channel), Metrics)
    }

    pub fn channel_detail(&self, channel: u8) -> Result<ChannelDetail, Error> {
        typed!(self, Request::ChannelDetail(channel), ChannelDetail)
    }

    pub fn sensors(&self) -> Result<Sensors, Error> {
        typed!(self, Request::Sensors, Sensors)
    }

    pub fn cell_voltages(&self) -> Result<CellVoltages, Error> {
        typed!(self, Request::CellVoltages, CellVoltages)
    }

    pub fn reboot_to_bootloader(&self) -> Result<ModeTransition, Error> {
        typed!(self, Request::RebootToBootloader, ModeTransition)
    }

    pub fn reboot_to_app(&self) -> Result<ModeTransition, Error> {
        typed!(self, Request::RebootToApp, ModeTransition)
    }

    pub fn verify_firmware(&self, region: FlashRegion) -> Result<FirmwareVerification, Error> {
        typed!(self, Request::VerifyFirmware(region), FirmwareVerification)
    }

    pub fn sync_echo(&self, params: &[u8]) -> Result<SyncEcho, Error> {
        typed!(self, Request::SyncEcho(params.to_vec()), SyncEcho)
    }

    pub fn stale_echo(&self, params: &[u8]) -> Result<StaleEcho, Error> {
        typed!(self, Request::StaleEcho(params.to_vec()), StaleEcho)
    }

    pub fn plain_echo(&self, params: &[u8]) -> Result<Echo, Error> {
        typed!(self, Request::PlainEcho(params.to_vec()), Echo)
    }

    /// Asks the charger to repeat the last frame it sent.
    pub fn resend_last(&self) -> Result<Frame, Error> {
        typed!(self, Request::ResendLast, Resent)
    }

    /// Sends an opcode that is never answered.
    pub fn quiet(&self, opcode: QuietOpcode, params: &[u8]) -> Result<(), Error> {
        let command = Command::Quiet(opcode);
        match self.invoke(Request::Quiet(opcode, params.to_vec()))? {
            Response::Silent => Ok(()),
            other => Err(unexpected_record(command, &other)),
        }
    }
}
