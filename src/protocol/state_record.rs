//! Fixed-width positional state records.
//!
//! Some instruments cannot be queried per parameter and instead report a single
//! record: a digit-only numeric region of fixed-width fields followed by one
//! character per boolean flag. The layout is data ([`RecordLayout`]); decoding
//! refuses to interpret anything unless the length matches exactly and the
//! numeric region is all digits. Problems inside the flag region or with
//! enumerated index values are reported as warnings, never as errors.

use crate::error::DecodeError;
use tracing::warn;

/// How the digits of a numeric field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Integer digits multiplied by `10^exponent`.
    Scaled {
        /// Power-of-ten scale factor.
        exponent: i32,
    },
    /// Index into an enumerated set; values outside `allowed` decode to `None`.
    Index {
        /// Accepted index values.
        allowed: &'static [u32],
    },
}

/// One numeric field of a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    /// Field name used for lookups.
    pub name: &'static str,
    /// Width in characters.
    pub width: usize,
    /// Interpretation of the digits.
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Integer field scaled by `10^exponent`.
    pub const fn scaled(name: &'static str, width: usize, exponent: i32) -> Self {
        Self {
            name,
            width,
            kind: FieldKind::Scaled { exponent },
        }
    }

    /// Enumerated index field.
    pub const fn index(name: &'static str, width: usize, allowed: &'static [u32]) -> Self {
        Self {
            name,
            width,
            kind: FieldKind::Index { allowed },
        }
    }
}

/// Complete layout: numeric fields in order, then one character per flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordLayout {
    /// Numeric fields from the start of the record.
    pub fields: &'static [FieldSpec],
    /// Flag names in record order.
    pub flags: &'static [&'static str],
}

impl RecordLayout {
    /// Width of the numeric region.
    pub fn numeric_width(&self) -> usize {
        self.fields.iter().map(|f| f.width).sum()
    }

    /// Exact record length.
    pub fn total_width(&self) -> usize {
        self.numeric_width() + self.flags.len()
    }
}

/// Decoded value of a numeric field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Scaled number.
    Number(f64),
    /// Enumerated index, `None` when outside the allowed set.
    Index(Option<u32>),
}

/// A tolerated anomaly found while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeWarning {
    /// Field or flag name.
    pub field: &'static str,
    /// Raw characters of the field.
    pub raw: String,
    /// What was wrong.
    pub reason: &'static str,
}

/// Result of decoding a state record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedState {
    values: Vec<(&'static str, FieldValue)>,
    flags: Vec<(&'static str, bool)>,
    warnings: Vec<DecodeWarning>,
}

impl DecodedState {
    /// Value of a scaled field.
    pub fn number(&self, name: &str) -> Option<f64> {
        self.values.iter().find(|(n, _)| *n == name).and_then(|(_, v)| match v {
            FieldValue::Number(x) => Some(*x),
            FieldValue::Index(_) => None,
        })
    }

    /// Value of an index field; `None` when absent or invalid.
    pub fn index(&self, name: &str) -> Option<u32> {
        self.values.iter().find(|(n, _)| *n == name).and_then(|(_, v)| match v {
            FieldValue::Index(i) => *i,
            FieldValue::Number(_) => None,
        })
    }

    /// State of a flag.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.flags.iter().find(|(n, _)| *n == name).map(|(_, b)| *b)
    }

    /// Anomalies tolerated while decoding.
    pub fn warnings(&self) -> &[DecodeWarning] {
        &self.warnings
    }
}

fn scale(raw: u64, exponent: i32) -> f64 {
    let factor = 10f64.powi(exponent.abs());
    if exponent >= 0 {
        raw as f64 * factor
    } else {
        raw as f64 / factor
    }
}

/// Decodes `record` according to `layout`.
pub fn decode_state(record: &str, layout: &RecordLayout) -> Result<DecodedState, DecodeError> {
    let bytes = record.as_bytes();
    let expected = layout.total_width();
    if bytes.len() != expected {
        return Err(DecodeError::RecordLength {
            expected,
            actual: bytes.len(),
            reply: record.to_string(),
        });
    }

    let numeric_width = layout.numeric_width();
    if let Some(offset) = bytes[..numeric_width]
        .iter()
        .position(|b| !b.is_ascii_digit())
    {
        return Err(DecodeError::NonDigit {
            offset,
            reply: record.to_string(),
        });
    }

    let mut state = DecodedState::default();
    let mut offset = 0;
    for field in layout.fields {
        let digits = &bytes[offset..offset + field.width];
        offset += field.width;
        // Digits only, checked above.
        let raw = digits
            .iter()
            .fold(0u64, |acc, d| acc * 10 + u64::from(d - b'0'));
        let value = match field.kind {
            FieldKind::Scaled { exponent } => FieldValue::Number(scale(raw, exponent)),
            FieldKind::Index { allowed } => {
                let index = u32::try_from(raw).ok().filter(|i| allowed.contains(i));
                if index.is_none() {
                    state.warnings.push(DecodeWarning {
                        field: field.name,
                        raw: String::from_utf8_lossy(digits).into_owned(),
                        reason: "index outside the enumerated set",
                    });
                }
                FieldValue::Index(index)
            }
        };
        state.values.push((field.name, value));
    }

    for (&name, byte) in layout.flags.iter().zip(&bytes[numeric_width..]) {
        let on = match byte {
            b'1' => true,
            b'0' => false,
            _ => {
                state.warnings.push(DecodeWarning {
                    field: name,
                    raw: String::from_utf8_lossy(&[*byte]).into_owned(),
                    reason: "flag is neither '0' nor '1'",
                });
                false
            }
        };
        state.flags.push((name, on));
    }

    for warning in &state.warnings {
        warn!(field = warning.field, raw = %warning.raw, "{}", warning.reason);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: RecordLayout = RecordLayout {
        fields: &[
            FieldSpec::scaled("carrier", 10, 1),
            FieldSpec::scaled("depth", 2, -2),
            FieldSpec::index("osc", 2, &[0, 1, 2, 3, 4]),
        ],
        flags: &["a", "b", "c"],
    };

    #[test]
    fn decodes_fields_and_flags() {
        let state = decode_state("01040000008502101", &LAYOUT).unwrap();
        assert_eq!(state.number("carrier"), Some(1.04e9));
        assert_eq!(state.number("depth"), Some(0.85));
        assert_eq!(state.index("osc"), Some(2));
        assert_eq!(state.flag("a"), Some(true));
        assert_eq!(state.flag("b"), Some(false));
        assert_eq!(state.flag("c"), Some(true));
        assert!(state.warnings().is_empty());
    }

    #[test]
    fn wrong_length_is_rejected() {
        let err = decode_state("0104000000850210", &LAYOUT).unwrap_err();
        assert_eq!(
            err,
            DecodeError::RecordLength {
                expected: 17,
                actual: 16,
                reply: "0104000000850210".into()
            }
        );
    }

    #[test]
    fn non_digit_in_numeric_region_is_rejected() {
        let err = decode_state("01040x0000850210 ", &LAYOUT).unwrap_err();
        assert!(matches!(err, DecodeError::NonDigit { offset: 5, .. }));
    }

    #[test]
    fn bad_flag_is_a_warning() {
        let state = decode_state("0104000000850210?", &LAYOUT).unwrap();
        assert_eq!(state.flag("c"), Some(false));
        assert_eq!(state.warnings().len(), 1);
        assert_eq!(state.warnings()[0].field, "c");
    }

    #[test]
    fn invalid_index_is_none_with_warning() {
        let state = decode_state("01040000008506101", &LAYOUT).unwrap();
        assert_eq!(state.index("osc"), None);
        assert_eq!(state.warnings()[0].field, "osc");
    }

    #[test]
    fn multibyte_text_does_not_panic() {
        assert!(decode_state("0104000000850210é", &LAYOUT).is_err());
    }
}
