//! Command codec shared by every instrument dialect.
//!
//! The protocol layer is pure: it turns semantic requests into wire-exact
//! command strings and replies back into typed values, without touching a
//! transport. Each dialect (see [`crate::instrument`]) supplies its own unit
//! tables, precision bands and verbs as data; the algorithms live here.
//!
//! - [`units`]: unit selection, truncation/rounding and suffixed-number decoding
//! - [`measurement`]: `MeasurementRequest` and its SCPI `MEAS:` encoding
//! - [`state_record`]: fixed-width positional status records
//! - [`error_status`]: bitmask status words to named error sets

pub mod error_status;
pub mod measurement;
pub mod state_record;
pub mod units;

use crate::error::{Bound, DecodeError, RangeError};
use crate::protocol::units::UnitTable;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// A wire-exact command string.
///
/// Only the codec can build one, so anything that reaches a transport has
/// passed range checking and formatting for its dialect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodedCommand(String);

impl EncodedCommand {
    pub(crate) fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// The command text, without any line terminator.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EncodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EncodedCommand {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A numeric setting that may be left to the instrument.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Setting {
    /// Let the instrument choose.
    #[default]
    Auto,
    /// The instrument's smallest allowed value.
    Min,
    /// The instrument's largest allowed value.
    Max,
    /// An explicit value in base units.
    Value(f64),
}

impl Setting {
    /// True for `Auto`.
    pub fn is_auto(&self) -> bool {
        matches!(self, Setting::Auto)
    }
}

impl From<f64> for Setting {
    fn from(value: f64) -> Self {
        Setting::Value(value)
    }
}

/// Inclusive numeric limits for one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    /// Parameter name reported in range errors.
    pub parameter: &'static str,
    /// Smallest accepted value.
    pub min: f64,
    /// Largest accepted value.
    pub max: f64,
}

impl Limits {
    /// Limits for `parameter` spanning `[min, max]`.
    pub const fn new(parameter: &'static str, min: f64, max: f64) -> Self {
        Self { parameter, min, max }
    }

    /// Same limits with a different upper bound.
    pub const fn with_max(self, max: f64) -> Self {
        Self { max, ..self }
    }

    /// Returns `value` unchanged when inside the limits.
    pub fn check(&self, value: f64) -> Result<f64, RangeError> {
        if value.is_nan() || value < self.min {
            return Err(RangeError {
                parameter: self.parameter.to_string(),
                value,
                bound: Bound::Min(self.min),
            });
        }
        if value > self.max {
            return Err(RangeError {
                parameter: self.parameter.to_string(),
                value,
                bound: Bound::Max(self.max),
            });
        }
        Ok(value)
    }

    /// Resolves a sentinel into a concrete value, checking explicit values.
    ///
    /// `Auto` has no concrete counterpart and yields `None`.
    pub fn resolve(&self, setting: Setting) -> Result<Option<f64>, RangeError> {
        match setting {
            Setting::Auto => Ok(None),
            Setting::Min => Ok(Some(self.min)),
            Setting::Max => Ok(Some(self.max)),
            Setting::Value(v) => self.check(v).map(Some),
        }
    }
}

/// Where a suffixed value sits inside a reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplyShape {
    /// Parameter prefix leading the field (`F` in `F1.5KHZ`).
    pub prefix: &'static str,
    /// Separator between fields of a multi-field reply.
    pub separator: char,
    /// Accepted unit suffixes.
    pub units: UnitTable,
}

/// Finds the field led by `prefix` in a (possibly multi-field) reply.
pub fn extract_field<'a>(
    reply: &'a str,
    prefix: &str,
    separator: char,
) -> Result<&'a str, DecodeError> {
    reply
        .split(separator)
        .map(str::trim)
        .find(|field| field.starts_with(prefix))
        .ok_or_else(|| DecodeError::FieldNotFound {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
        })
}

/// Decodes the value of `shape.prefix` from `reply` into base units.
pub fn decode(reply: &str, shape: &ReplyShape) -> Result<f64, DecodeError> {
    let field = extract_field(reply, shape.prefix, shape.separator)?;
    shape
        .units
        .parse(&field[shape.prefix.len()..])
        .map_err(|e| e.in_reply(reply))
}

#[allow(clippy::expect_used)]
static NUMBER_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*$")
        .expect("static number pattern")
});

/// Parses a bare numeric reply such as `+1.234560E-03`.
pub fn decode_f64(reply: &str) -> Result<f64, DecodeError> {
    let caps = NUMBER_REPLY
        .captures(reply)
        .ok_or_else(|| DecodeError::malformed(reply, "expected a number"))?;
    caps[1]
        .parse::<f64>()
        .map_err(|e| DecodeError::malformed(reply, e.to_string()))
}

/// Parses a boolean reply (`1`/`0`, `ON`/`OFF`).
pub fn decode_bool(reply: &str) -> Result<bool, DecodeError> {
    match reply.trim().to_ascii_uppercase().as_str() {
        "1" | "ON" | "+1" => Ok(true),
        "0" | "OFF" | "+0" => Ok(false),
        _ => Err(DecodeError::malformed(reply, "expected a boolean")),
    }
}
