//! Error types for the transport core.
//!
//! This module defines all error types that can occur while creating,
//! driving and tearing down transports, including acquisition, state
//! machine, signalling and configuration errors.

use smol_str::SmolStr;
use thiserror::Error;

use crate::transport::TransportState;

/// Main error type for the transport core.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("Link acquisition failed: {0}")]
   AcquisitionFailure(String),

   #[error("Invalid state transition: {from} -> {to}")]
   InvalidStateTransition {
      from: TransportState,
      to: TransportState,
   },

   #[error("Transport not found: {0}")]
   NotFound(SmolStr),

   #[error("Transport already registered: {0}")]
   DuplicateTransport(SmolStr),

   #[error("Signal delivery failed: {0}")]
   SignalDeliveryFailure(&'static str),

   #[error("Worker thread did not exit within {0:?}")]
   ThreadJoinTimeout(std::time::Duration),

   #[error("Profile {profile} is not valid for {kind} transports")]
   InvalidProfile {
      kind: &'static str,
      profile: &'static str,
   },

   #[error("Operation not supported: {0}")]
   NotSupported(&'static str),

   #[error("Command too long: {0} bytes (max {max})", max = crate::transport::MAX_COMMAND_LEN)]
   CommandTooLong(usize),

   #[error("Device has been destroyed")]
   DeviceGone,

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `TransportError`.
pub type Result<T> = std::result::Result<T, TransportError>;
