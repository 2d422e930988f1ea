//! Multimeter measurement requests and their SCPI `MEAS:` encoding.

use crate::error::{InstrError, InstrResult, RangeError};
use crate::protocol::{EncodedCommand, Limits, Setting};
use std::fmt;

/// AC or DC measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Coupling {
    /// Direct current / voltage.
    #[default]
    Dc,
    /// Alternating current / voltage (RMS).
    Ac,
}

impl Coupling {
    /// Dialect-neutral token (`DC` / `AC`).
    pub fn token(&self) -> &'static str {
        match self {
            Coupling::Dc => "DC",
            Coupling::Ac => "AC",
        }
    }
}

/// What a multimeter is asked to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Voltage with coupling.
    Voltage(Coupling),
    /// Current with coupling.
    Current(Coupling),
    /// Two-wire resistance.
    Resistance,
    /// Four-wire resistance.
    FourWireResistance,
    /// Frequency.
    Frequency,
    /// Period.
    Period,
    /// Capacitance.
    Capacitance,
    /// Continuity test.
    Continuity,
    /// Diode test.
    Diode,
    /// Temperature with the configured sensor.
    Temperature,
}

impl SignalKind {
    /// True when range and resolution may be specified for this signal.
    pub fn takes_range(&self) -> bool {
        matches!(
            self,
            SignalKind::Voltage(_)
                | SignalKind::Current(_)
                | SignalKind::Resistance
                | SignalKind::FourWireResistance
        )
    }

    fn scpi_path(&self) -> String {
        match self {
            SignalKind::Voltage(c) => format!("MEAS:VOLT:{}?", c.token()),
            SignalKind::Current(c) => format!("MEAS:CURR:{}?", c.token()),
            SignalKind::Resistance => "MEAS:RES?".to_string(),
            SignalKind::FourWireResistance => "MEAS:FRES?".to_string(),
            SignalKind::Frequency => "MEAS:FREQ?".to_string(),
            SignalKind::Period => "MEAS:PER?".to_string(),
            SignalKind::Capacitance => "MEAS:CAP?".to_string(),
            SignalKind::Continuity => "MEAS:CONT?".to_string(),
            SignalKind::Diode => "MEAS:DIOD?".to_string(),
            SignalKind::Temperature => "MEAS:TEMP?".to_string(),
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Voltage(c) => write!(f, "{} voltage", c.token()),
            SignalKind::Current(c) => write!(f, "{} current", c.token()),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A validated measurement request.
///
/// A resolution can only be given together with a range; the constructor
/// rejects other combinations before anything is encoded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementRequest {
    signal: SignalKind,
    range: Setting,
    resolution: Setting,
}

impl MeasurementRequest {
    /// Builds a request, rejecting invalid parameter combinations.
    pub fn new(signal: SignalKind, range: Setting, resolution: Setting) -> InstrResult<Self> {
        if !signal.takes_range() && !(range.is_auto() && resolution.is_auto()) {
            return Err(InstrError::Construction(format!(
                "{} measurements do not accept range or resolution",
                signal
            )));
        }
        if range.is_auto() && !resolution.is_auto() {
            return Err(InstrError::Construction(
                "a resolution requires an explicit range".to_string(),
            ));
        }
        Ok(Self {
            signal,
            range,
            resolution,
        })
    }

    /// Auto-ranged request with default resolution.
    pub fn auto(signal: SignalKind) -> Self {
        Self {
            signal,
            range: Setting::Auto,
            resolution: Setting::Auto,
        }
    }

    /// Requested signal.
    pub fn signal(&self) -> SignalKind {
        self.signal
    }

    /// Requested range.
    pub fn range(&self) -> Setting {
        self.range
    }

    /// Requested resolution.
    pub fn resolution(&self) -> Setting {
        self.resolution
    }
}

/// Range and resolution limits for one ranged signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeLimits {
    /// Accepted range values.
    pub range: Limits,
    /// Accepted resolution values.
    pub resolution: Limits,
}

fn scpi_operand(setting: Setting, limits: Option<&Limits>) -> Result<String, RangeError> {
    Ok(match setting {
        Setting::Auto => "AUTO".to_string(),
        Setting::Min => "MIN".to_string(),
        Setting::Max => "MAX".to_string(),
        Setting::Value(v) => {
            if let Some(limits) = limits {
                limits.check(v)?;
            }
            format!("{}", v)
        }
    })
}

/// Encodes a request in the SCPI `MEAS:` grammar.
///
/// `MEAS:VOLT:DC? AUTO`, `MEAS:VOLT:DC? 10`, `MEAS:VOLT:DC? 10,0.001`,
/// `MEAS:CURR:AC? MAX,MIN`. Resistance takes the same operand; the other
/// signals are sent without one.
pub fn encode_scpi(
    request: &MeasurementRequest,
    limits: Option<&RangeLimits>,
) -> Result<EncodedCommand, RangeError> {
    let mut command = request.signal.scpi_path();
    if request.signal.takes_range() {
        let range = scpi_operand(request.range, limits.map(|l| &l.range))?;
        command.push(' ');
        command.push_str(&range);
        if !request.resolution.is_auto() {
            let resolution = scpi_operand(request.resolution, limits.map(|l| &l.resolution))?;
            command.push(',');
            command.push_str(&resolution);
        }
    }
    Ok(EncodedCommand::new(command))
}
