//! Bitmask status words to named error sets.
//!
//! Instruments report error conditions as an integer whose bits each stand for
//! one condition. Several may be set at once, so decoding yields a list in
//! taxonomy order rather than a single code.

use crate::error::DecodeError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

#[allow(clippy::expect_used)]
static STATUS_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*\+?(\d+)(?:\.\d*)?\s*$").expect("static status-word pattern")
});

/// Parses a status word reply, dropping any fractional tail.
///
/// `"136.000000000"` yields 136.
pub fn parse_status_word(reply: &str) -> Result<u64, DecodeError> {
    let caps = STATUS_WORD
        .captures(reply)
        .ok_or_else(|| DecodeError::malformed(reply, "expected a non-negative status word"))?;
    caps[1]
        .parse::<u64>()
        .map_err(|e| DecodeError::malformed(reply, e.to_string()))
}

/// Every taxonomy entry whose mask bits are all set in `status`, in taxonomy
/// order.
pub fn decode_errors<K: Copy>(status: u64, taxonomy: &[(u64, K)]) -> Vec<K> {
    taxonomy
        .iter()
        .filter(|(mask, _)| *mask != 0 && status & mask == *mask)
        .map(|(_, kind)| *kind)
        .collect()
}

/// IEEE 488.2 standard event status register (`*ESR?`) bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardEvent {
    /// Operation complete.
    OperationComplete,
    /// Request control.
    RequestControl,
    /// Query error.
    QueryError,
    /// Device-dependent error.
    DeviceDependentError,
    /// Execution error.
    ExecutionError,
    /// Command error.
    CommandError,
    /// User request.
    UserRequest,
    /// Power on.
    PowerOn,
}

impl StandardEvent {
    /// True for the four error bits; the others are informational.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StandardEvent::QueryError
                | StandardEvent::DeviceDependentError
                | StandardEvent::ExecutionError
                | StandardEvent::CommandError
        )
    }
}

impl fmt::Display for StandardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StandardEvent::OperationComplete => "OPC",
            StandardEvent::RequestControl => "RQC",
            StandardEvent::QueryError => "QYE",
            StandardEvent::DeviceDependentError => "DDE",
            StandardEvent::ExecutionError => "EXE",
            StandardEvent::CommandError => "CME",
            StandardEvent::UserRequest => "URQ",
            StandardEvent::PowerOn => "PON",
        };
        f.write_str(name)
    }
}

/// Bit layout of the standard event status register.
pub const STANDARD_EVENTS: &[(u64, StandardEvent)] = &[
    (1, StandardEvent::OperationComplete),
    (2, StandardEvent::RequestControl),
    (4, StandardEvent::QueryError),
    (8, StandardEvent::DeviceDependentError),
    (16, StandardEvent::ExecutionError),
    (32, StandardEvent::CommandError),
    (64, StandardEvent::UserRequest),
    (128, StandardEvent::PowerOn),
];
