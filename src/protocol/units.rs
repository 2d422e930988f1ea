//! Unit selection and numeric rendering.
//!
//! Dialects disagree on which unit to pick for a value. Some pick the largest
//! unit in which the magnitude is at least one (`433.5 MZ`), others stay in the
//! smallest unit until a crossover ceiling (`F1234HZ` up to 4 kHz). Both rules
//! are expressed as a [`UnitTable`] with a [`Precedence`]; the digit budget is a
//! [`Precision`] looked up on the unit-converted magnitude.

use crate::error::DecodeError;
use once_cell::sync::Lazy;
use regex::Regex;

/// One unit token of a dialect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    /// Wire token, e.g. `KHZ`.
    pub token: &'static str,
    /// Size of one unit in base units (Hz, V, ...).
    pub scale: f64,
    /// Magnitude (in base units) at which a smallest-first table moves on.
    pub ceiling: f64,
}

impl Unit {
    /// A unit without a crossover ceiling.
    pub const fn new(token: &'static str, scale: f64) -> Self {
        Self {
            token,
            scale,
            ceiling: f64::INFINITY,
        }
    }

    /// Same unit, left for the next one once the magnitude reaches `ceiling`.
    pub const fn until(self, ceiling: f64) -> Self {
        Self { ceiling, ..self }
    }
}

static UNITLESS: Unit = Unit::new("", 1.0);

/// Direction of unit selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precedence {
    /// Largest unit in which the magnitude is still >= 1.
    LargestFirst,
    /// Smallest unit whose ceiling is above the magnitude.
    SmallestFirst,
}

/// Units of one quantity in one dialect, ordered by ascending scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitTable {
    /// Units from smallest to largest.
    pub units: &'static [Unit],
    /// Selection rule.
    pub precedence: Precedence,
}

impl UnitTable {
    /// Table selecting the largest unit with magnitude >= 1.
    pub const fn largest_first(units: &'static [Unit]) -> Self {
        Self {
            units,
            precedence: Precedence::LargestFirst,
        }
    }

    /// Table staying in the smallest unit until its ceiling.
    pub const fn smallest_first(units: &'static [Unit]) -> Self {
        Self {
            units,
            precedence: Precedence::SmallestFirst,
        }
    }

    /// Picks the unit for `value` and returns the value expressed in it.
    ///
    /// An empty table means the quantity is sent without a suffix.
    pub fn select(&self, value: f64) -> (f64, &'static Unit) {
        let magnitude = value.abs();
        let unit = match self.precedence {
            Precedence::LargestFirst => self
                .units
                .iter()
                .rev()
                .find(|u| magnitude >= u.scale)
                .or(self.units.first()),
            Precedence::SmallestFirst => self
                .units
                .iter()
                .find(|u| magnitude < u.ceiling)
                .or(self.units.last()),
        }
        .unwrap_or(&UNITLESS);
        (value / unit.scale, unit)
    }

    /// Looks up a token, ignoring ASCII case.
    pub fn unit(&self, token: &str) -> Option<&'static Unit> {
        self.units
            .iter()
            .find(|u| u.token.eq_ignore_ascii_case(token))
    }

    /// Parses a suffixed number (`1.23KHZ`, `999MV`) into base units.
    pub fn parse(&self, text: &str) -> Result<f64, DecodeError> {
        let caps = SUFFIXED_NUMBER
            .captures(text)
            .ok_or_else(|| DecodeError::malformed(text, "expected a number with unit suffix"))?;
        let unit = self.unit(&caps[2]).ok_or_else(|| DecodeError::UnknownUnit {
            reply: text.to_string(),
        })?;
        let number = caps[1]
            .parse::<f64>()
            .map_err(|e| DecodeError::malformed(text, e.to_string()))?;
        Ok(number * unit.scale)
    }
}

#[allow(clippy::expect_used)]
static SUFFIXED_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*([A-Za-z]*)\s*$")
        .expect("static suffixed-number pattern")
});

/// How surplus digits are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Toward zero.
    Truncate,
    /// To nearest, ties to even.
    HalfEven,
}

/// How the kept digits are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notation {
    /// Shortest form; keeps one fractional digit when the budget allows any
    /// (`2.0`, `433.5`), bare integer otherwise (`250`).
    Minimal,
    /// Exactly the budgeted number of fractional digits (`1.00`).
    Fixed,
}

/// Digit budget for magnitudes at or above `at_least`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    /// Lower edge of the band, on the unit-converted magnitude.
    pub at_least: f64,
    /// Fractional digits kept inside the band.
    pub decimals: u32,
}

impl Band {
    /// Band starting at `at_least`.
    pub const fn new(at_least: f64, decimals: u32) -> Self {
        Self { at_least, decimals }
    }
}

/// Where the digit budget comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Precision {
    /// First band (in order) whose lower edge the magnitude reaches; the last
    /// band applies when none does.
    Bands(&'static [Band]),
    /// Fixed budget per unit token.
    PerUnit(&'static [(&'static str, u32)]),
}

impl Precision {
    /// Fractional digits for `converted` expressed in `unit`.
    pub fn decimals(&self, converted: f64, unit: &Unit) -> u32 {
        match self {
            Precision::Bands(bands) => {
                let magnitude = converted.abs();
                bands
                    .iter()
                    .find(|b| magnitude >= b.at_least)
                    .or(bands.last())
                    .map_or(0, |b| b.decimals)
            }
            Precision::PerUnit(table) => table
                .iter()
                .find(|(token, _)| *token == unit.token)
                .map_or(0, |(_, d)| *d),
        }
    }
}

/// Complete rendering rule for one quantity of one dialect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantityFormat {
    /// Unit selection.
    pub units: UnitTable,
    /// Digit budget.
    pub precision: Precision,
    /// Surplus digit handling.
    pub rounding: Rounding,
    /// Printing style.
    pub notation: Notation,
}

/// A value rendered for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    /// Digits as they go on the wire.
    pub digits: String,
    /// Selected unit.
    pub unit: &'static Unit,
    /// Quantized value in `unit`.
    pub quantized: f64,
    /// Fractional digits budgeted.
    pub decimals: u32,
}

impl QuantityFormat {
    /// Selects the unit, quantizes and prints `value` (in base units).
    pub fn render(&self, value: f64) -> Rendered {
        let (converted, unit) = self.units.select(value);
        let decimals = self.precision.decimals(converted, unit);
        let quantized = match self.rounding {
            Rounding::Truncate => truncate(converted, decimals),
            Rounding::HalfEven => round_half_even(converted, decimals),
        };
        Rendered {
            digits: print(quantized, decimals, self.notation),
            unit,
            quantized,
            decimals,
        }
    }
}

fn pow10(decimals: u32) -> f64 {
    10f64.powi(decimals as i32)
}

/// Truncates toward zero to `decimals` fractional digits.
///
/// Binary representation error is absorbed first: `0.29 * 100` is
/// `28.999999999999996` in f64 and must still truncate to 29.
pub fn truncate(value: f64, decimals: u32) -> f64 {
    let factor = pow10(decimals);
    let scaled = value * factor;
    let nearest = scaled.round();
    let snapped = if (scaled - nearest).abs() <= 1e-9 * nearest.abs().max(1.0) {
        nearest
    } else {
        scaled.trunc()
    };
    snapped / factor
}

/// Rounds to `decimals` fractional digits, ties to even.
pub fn round_half_even(value: f64, decimals: u32) -> f64 {
    let factor = pow10(decimals);
    (value * factor).round_ties_even() / factor
}

/// Prints an already quantized value.
pub fn print(value: f64, decimals: u32, notation: Notation) -> String {
    // Avoid "-0" on the wire.
    let value = if value == 0.0 { 0.0 } else { value };
    let text = format!("{:.*}", decimals as usize, value);
    match notation {
        Notation::Fixed => text,
        Notation::Minimal if decimals == 0 => text,
        Notation::Minimal => {
            let trimmed = text.trim_end_matches('0');
            if trimmed.ends_with('.') {
                format!("{}0", trimmed)
            } else {
                trimmed.to_string()
            }
        }
    }
}
