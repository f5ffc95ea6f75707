#![cfg_attr(docsrs, feature(doc_cfg))]
//! # isdt_lib
//!
//! This crate talks to ISDT battery chargers (C4, C4 EVO, A4 and relatives) over their
//! USB HID interface. It covers the framing codec, the request/response exchange, the
//! per model capability table and the decoders for every known response record.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `isdt`
//!   command-line tool and pulls in `hidapi` and `serde`.
//!
//! ### Transport Features
//! - `hidapi`: Enables [`hidapi::HidTransport`], a blocking transport using the `hidapi` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing the decoded records.
//! - `bin-dependencies`: Enables all features required by the `isdt` binary executable.
//!
//! Without `hidapi` the library has no I/O of its own; any type implementing
//! [`exchange::Transport`] can carry the reports.

/// Which commands each model accepts in each mode.
pub mod capability;
/// Report framing: escaping, checksums, splitting and reassembly.
pub mod codec;
/// Contains error types for the library.
mod error;
/// One request, one response, over a [`exchange::Transport`].
pub mod exchange;
/// Encrypted firmware image handling.
pub mod firmware;
/// Request parameters and response records.
pub mod protocol;
pub mod session;

pub use error::{DecodeError, Error, Stage};

/// HID transport for ISDT chargers.
#[cfg_attr(docsrs, doc(cfg(feature = "hidapi")))]
#[cfg(feature = "hidapi")]
pub mod hidapi;
