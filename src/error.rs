//! Error types for the instrument command layer.
//!
//! Every operation on an instrument returns [`InstrResult`], whose error type
//! [`InstrError`] consolidates the failure classes of the protocol layer:
//!
//! - **`Range`**: a numeric parameter lies outside the instrument's documented
//!   limits. Raised by the codec before any I/O, so nothing reaches the wire.
//! - **`Construction`**: an invalid combination of parameters (for example a
//!   resolution given without a range). Also raised before any I/O.
//! - **`Transport`**: the underlying link failed while connecting, writing or
//!   reading. Wraps the adapter's `anyhow` error chain. Cached values touched by
//!   the failed operation are left dirty.
//! - **`Decode`**: a reply did not match the expected grammar. Carries the raw
//!   reply text; no default value is ever substituted.
//! - **`DeviceReported`**: errors the instrument itself reported, produced only
//!   when the caller explicitly polls the error status.
//! - **`NotConnected`** / **`WrongDevice`**: session lifecycle failures.
//!
//! Adapters use `anyhow::Result` internally; the session converts those into
//! `InstrError::Transport` so callers can match on structured variants.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the instrument error type.
pub type InstrResult<T> = std::result::Result<T, InstrError>;

/// Every failure an instrument operation can report.
#[derive(Error, Debug)]
pub enum InstrError {
    /// A parameter outside its limits; nothing was sent.
    #[error(transparent)]
    Range(#[from] RangeError),

    /// An invalid parameter combination; nothing was sent.
    #[error("Invalid parameter combination: {0}")]
    Construction(String),

    /// The link failed while connecting, writing or reading.
    #[error("Transport error on '{instrument}': {source}")]
    Transport {
        /// Instrument name.
        instrument: String,
        /// Failed link operation.
        #[source]
        source: TransportError,
    },

    /// A reply that does not match the dialect's grammar.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Errors the instrument reported when its status was polled.
    #[error("Instrument '{instrument}' reported errors: {}", .errors.join(", "))]
    DeviceReported {
        /// Instrument name.
        instrument: String,
        /// Reported conditions, in taxonomy order.
        errors: Vec<String>,
    },

    /// A command was issued before `connect` succeeded or after `disconnect`.
    #[error("Instrument '{0}' is not connected")]
    NotConnected(String),

    /// The identity check found another instrument.
    #[error("Unexpected device on '{instrument}': expected '{expected}', got '{actual}'")]
    WrongDevice {
        /// Instrument name.
        instrument: String,
        /// Identity the driver expects.
        expected: String,
        /// Identity the instrument reported.
        actual: String,
    },
}

impl InstrError {
    /// True when the error was raised before anything was written to the wire.
    pub fn is_pre_io(&self) -> bool {
        matches!(self, InstrError::Range(_) | InstrError::Construction(_))
    }
}

/// Which limit a rejected value violated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    /// Value was below the minimum.
    Min(f64),
    /// Value was above the maximum.
    Max(f64),
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Min(min) => write!(f, "minimum {}", min),
            Bound::Max(max) => write!(f, "maximum {}", max),
        }
    }
}

/// A numeric parameter outside its documented limits.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{parameter} = {value} is out of range (violates {bound})")]
pub struct RangeError {
    /// Parameter name as used in the instrument's API.
    pub parameter: String,
    /// Offending value.
    pub value: f64,
    /// Violated limit.
    pub bound: Bound,
}

/// Reply text that does not match the grammar the codec expected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The number carries a unit suffix the dialect does not use.
    #[error("Unknown unit suffix in reply '{reply}'")]
    UnknownUnit {
        /// Raw reply.
        reply: String,
    },

    /// No field starts with the expected prefix.
    #[error("Field '{prefix}' not found in reply '{reply}'")]
    FieldNotFound {
        /// Expected field prefix.
        prefix: String,
        /// Raw reply.
        reply: String,
    },

    /// The reply is not of the expected form.
    #[error("Malformed reply '{reply}': {reason}")]
    Malformed {
        /// Raw reply.
        reply: String,
        /// What was expected.
        reason: String,
    },

    /// A fixed-width record of the wrong length.
    #[error("Record length {actual} does not match expected {expected}: '{reply}'")]
    RecordLength {
        /// Length the layout requires.
        expected: usize,
        /// Length received.
        actual: usize,
        /// Raw record.
        reply: String,
    },

    /// A non-digit inside the numeric region of a record.
    #[error("Non-digit character at offset {offset} in record '{reply}'")]
    NonDigit {
        /// Byte offset of the offending character.
        offset: usize,
        /// Raw record.
        reply: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(reply: &str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            reply: reply.to_string(),
            reason: reason.into(),
        }
    }

    /// Replaces the reply text with the full reply the field was cut from.
    pub(crate) fn in_reply(self, reply: &str) -> Self {
        let reply = reply.to_string();
        match self {
            DecodeError::UnknownUnit { .. } => DecodeError::UnknownUnit { reply },
            DecodeError::FieldNotFound { prefix, .. } => DecodeError::FieldNotFound { prefix, reply },
            DecodeError::Malformed { reason, .. } => DecodeError::Malformed { reply, reason },
            other => other,
        }
    }
}

/// Link-level failure, tagged with the operation that failed.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Opening or closing the link failed.
    #[error("connect failed: {0:#}")]
    Connect(#[source] anyhow::Error),

    /// Writing a command failed.
    #[error("send failed: {0:#}")]
    Send(#[source] anyhow::Error),

    /// Reading a reply failed.
    #[error("receive failed: {0:#}")]
    Receive(#[source] anyhow::Error),

    /// Nothing arrived before the read timeout.
    #[error("no reply before the read timeout")]
    NoReply,
}
