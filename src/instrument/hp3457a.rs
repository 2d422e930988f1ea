//! HP 3457A multimeter (HP-IB dialect)
//!
//! Usually reached through a USB-GPIB adapter whose read terminator has to be
//! switched to LF before the first query. Function commands take optional
//! range and resolution operands (`DCV 10,1`); a reading is obtained by
//! configuring, issuing a single trigger and reading the reply, all under one
//! session lock.

use super::capabilities::{Current, HasTrigger, Instrument, Measures, Voltage};
use crate::adapters::{DummyTransport, GpibAdapterCommand, ReadTerminator, Transport};
use crate::cache::CachedParameter;
use crate::error::{InstrError, InstrResult};
use crate::protocol::error_status::{decode_errors, parse_status_word};
use crate::protocol::measurement::{Coupling, MeasurementRequest, RangeLimits, SignalKind};
use crate::protocol::{decode_bool, decode_f64, EncodedCommand, Limits};
use crate::session::{Handshake, Link, Session, SessionCore};
use async_trait::async_trait;
use std::fmt;
use tracing::{debug, info};

/// Identification reply expected from `ID?`.
pub const EXPECTED_ID: &str = "HP3457A";

const RESOLUTION_LIMITS: Limits = Limits::new("resolution", 1.0, 100.0);

/// Voltage ranges and resolution (percent of range).
pub const VOLTAGE_LIMITS: RangeLimits = RangeLimits {
    range: Limits::new("voltage_range", 1e-6, 300.0),
    resolution: RESOLUTION_LIMITS,
};

/// Current ranges and resolution (percent of range).
pub const CURRENT_LIMITS: RangeLimits = RangeLimits {
    range: Limits::new("current_range", 1e-6, 1.5),
    resolution: RESOLUTION_LIMITS,
};

/// Resistance ranges and resolution (percent of range).
pub const RESISTANCE_LIMITS: RangeLimits = RangeLimits {
    range: Limits::new("resistance_range", 30.0, 3e9),
    resolution: RESOLUTION_LIMITS,
};

const NPLC_LIMITS: Limits = Limits::new("nplc", 0.0, 100.0);

/// Trigger source (`TRIG <n>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Free running.
    Auto,
    /// External trigger input.
    External,
    /// One reading now.
    Single,
    /// Hold.
    Hold,
    /// Synchronous with the bus.
    Synchronous,
}

impl TriggerMode {
    /// Numeric code on the wire.
    pub fn code(&self) -> u8 {
        match self {
            TriggerMode::Auto => 1,
            TriggerMode::External => 2,
            TriggerMode::Single => 3,
            TriggerMode::Hold => 4,
            TriggerMode::Synchronous => 5,
        }
    }
}

/// Input terminal selection (`TERM <n>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminals {
    /// Inputs disconnected.
    Off,
    /// Front panel.
    Front,
    /// Rear panel.
    Rear,
    /// Plug-in scanner card.
    Scanner,
}

impl Terminals {
    /// Numeric code on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Terminals::Off => 0,
            Terminals::Front => 1,
            Terminals::Rear => 2,
            Terminals::Scanner => 3,
        }
    }
}

/// Conditions reported by `ERR?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Bit 0.
    Hardware,
    /// Bit 1.
    CalibrationOrAcal,
    /// Bit 2.
    TriggerTooFast,
    /// Bit 3.
    Syntax,
    /// Bit 4.
    UnknownCommand,
    /// Bit 5.
    UnknownParameter,
    /// Bit 6.
    ParameterOutOfRange,
    /// Bit 7.
    ParameterMissing,
    /// Bit 8.
    ParameterIgnored,
    /// Bit 9.
    OutOfCalibration,
    /// Bit 10.
    AutocalRequired,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCode::Hardware => "hardware error",
            ErrorCode::CalibrationOrAcal => "error in calibration or autocal",
            ErrorCode::TriggerTooFast => "trigger too fast",
            ErrorCode::Syntax => "syntax error",
            ErrorCode::UnknownCommand => "unknown command",
            ErrorCode::UnknownParameter => "unknown parameter",
            ErrorCode::ParameterOutOfRange => "parameter out of range",
            ErrorCode::ParameterMissing => "required parameter missing",
            ErrorCode::ParameterIgnored => "parameter ignored",
            ErrorCode::OutOfCalibration => "out of calibration",
            ErrorCode::AutocalRequired => "autocal required",
        };
        f.write_str(text)
    }
}

/// Bit layout of the `ERR?` status word.
pub const ERROR_CODES: &[(u64, ErrorCode)] = &[
    (1, ErrorCode::Hardware),
    (2, ErrorCode::CalibrationOrAcal),
    (4, ErrorCode::TriggerTooFast),
    (8, ErrorCode::Syntax),
    (16, ErrorCode::UnknownCommand),
    (32, ErrorCode::UnknownParameter),
    (64, ErrorCode::ParameterOutOfRange),
    (128, ErrorCode::ParameterMissing),
    (256, ErrorCode::ParameterIgnored),
    (512, ErrorCode::OutOfCalibration),
    (1024, ErrorCode::AutocalRequired),
];

fn function_token(signal: SignalKind) -> InstrResult<(&'static str, Option<&'static RangeLimits>)> {
    Ok(match signal {
        SignalKind::Voltage(Coupling::Dc) => ("DCV", Some(&VOLTAGE_LIMITS)),
        SignalKind::Voltage(Coupling::Ac) => ("ACV", Some(&VOLTAGE_LIMITS)),
        SignalKind::Current(Coupling::Dc) => ("DCI", Some(&CURRENT_LIMITS)),
        SignalKind::Current(Coupling::Ac) => ("ACI", Some(&CURRENT_LIMITS)),
        SignalKind::Resistance => ("OHM", Some(&RESISTANCE_LIMITS)),
        SignalKind::FourWireResistance => ("OHMF", Some(&RESISTANCE_LIMITS)),
        SignalKind::Frequency => ("FREQ", None),
        SignalKind::Period => ("PER", None),
        other => {
            return Err(InstrError::Construction(format!(
                "the HP 3457A cannot measure {}",
                other
            )))
        }
    })
}

/// Function command for `request`: `DCV`, `DCV 10`, `DCV 10,1`.
///
/// `Auto` leaves an operand out; `Min`/`Max` are sent as the limit value.
pub fn encode_function(request: &MeasurementRequest) -> InstrResult<EncodedCommand> {
    let (token, limits) = function_token(request.signal())?;
    let mut command = token.to_string();
    if let Some(limits) = limits {
        if let Some(range) = limits.range.resolve(request.range())? {
            command.push_str(&format!(" {}", range));
            if let Some(resolution) = limits.resolution.resolve(request.resolution())? {
                command.push_str(&format!(",{}", resolution));
            }
        }
    }
    Ok(EncodedCommand::new(command))
}

/// `NPLC <v>`.
pub fn encode_nplc(nplc: f64) -> InstrResult<EncodedCommand> {
    NPLC_LIMITS.check(nplc)?;
    Ok(EncodedCommand::new(format!("NPLC {}", nplc)))
}

/// Driver-private state.
#[derive(Debug)]
pub struct Hp3457aState {
    reset_after_connect: bool,
    nplc: CachedParameter<f64>,
    fixed_impedance: CachedParameter<bool>,
}

impl Default for Hp3457aState {
    fn default() -> Self {
        Self {
            reset_after_connect: false,
            nplc: CachedParameter::unconfirmed(10.0),
            fixed_impedance: CachedParameter::unconfirmed(false),
        }
    }
}

#[async_trait]
impl Handshake for Hp3457aState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        core.adapter_command(GpibAdapterCommand::SetReadTerminator(ReadTerminator::Lf))
            .await?;
        let id = core.query(&EncodedCommand::new("ID?")).await?;
        let id = id.trim();
        if id != EXPECTED_ID {
            return Err(InstrError::WrongDevice {
                instrument: core.name().to_string(),
                expected: EXPECTED_ID.to_string(),
                actual: id.to_string(),
            });
        }
        if self.reset_after_connect {
            info!(instrument = %core.name(), "Resetting instrument");
            core.send(&EncodedCommand::new("RESET")).await?;
            self.nplc.invalidate();
            self.fixed_impedance.invalidate();
        }
        Ok(())
    }
}

/// HP 3457A driver.
#[derive(Debug)]
pub struct Hp3457a {
    session: Session<Hp3457aState>,
}

impl Hp3457a {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(name, transport, Hp3457aState::default()),
        }
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self {
            session: Session::dummy_with(name, Box::new(transport), Hp3457aState::default()),
        }
    }

    /// Sends `RESET` after a successful identity check.
    pub fn with_reset_after_connect(mut self, reset: bool) -> Self {
        self.session.state_mut().reset_after_connect = reset;
        self
    }

    async fn send(&self, command: EncodedCommand) -> InstrResult<()> {
        self.session.lock().await.core.send(&command).await
    }

    /// Selects the measurement function, range and resolution.
    pub async fn configure(&self, request: &MeasurementRequest) -> InstrResult<()> {
        let command = encode_function(request)?;
        self.send(command).await
    }

    /// Selects the trigger source.
    pub async fn configure_trigger(&self, mode: TriggerMode) -> InstrResult<()> {
        self.send(EncodedCommand::new(format!("TRIG {}", mode.code())))
            .await
    }

    /// Selects the input terminals.
    pub async fn configure_terminals(&self, terminals: Terminals) -> InstrResult<()> {
        self.send(EncodedCommand::new(format!("TERM {}", terminals.code())))
            .await
    }

    /// Integration time in power-line cycles.
    pub async fn set_nplc(&self, nplc: f64) -> InstrResult<()> {
        let command = encode_nplc(nplc)?;
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.nplc.record_write(nplc);
        core.send(&command).await
    }

    /// Integration time as reported by the instrument.
    pub async fn nplc(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.nplc, &EncodedCommand::new("NPLC?"), decode_f64)
            .await
    }

    /// Fixes the DCV input impedance at 10 MΩ (`true`) or lets it float.
    pub async fn set_fixed_impedance(&self, fixed: bool) -> InstrResult<()> {
        let command = EncodedCommand::new(if fixed { "FIXEDZ ON" } else { "FIXEDZ OFF" });
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.fixed_impedance.record_write(fixed);
        core.send(&command).await
    }

    /// Whether the input impedance is fixed.
    pub async fn fixed_impedance(&self) -> InstrResult<bool> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(
            &mut state.fixed_impedance,
            &EncodedCommand::new("FIXEDZ?"),
            decode_bool,
        )
        .await
    }

    /// Beeps at `frequency_hz` for `duration_s` seconds.
    pub async fn tone(&self, frequency_hz: u32, duration_s: f64) -> InstrResult<()> {
        self.send(EncodedCommand::new(format!("TONE {},{}", frequency_hz, duration_s)))
            .await
    }

    /// Configures for `request`, triggers once and reads the value.
    pub async fn measure_request(&self, request: &MeasurementRequest) -> InstrResult<f64> {
        let configure = encode_function(request)?;
        let trigger = EncodedCommand::new(format!("TRIG {}", TriggerMode::Single.code()));
        let mut guard = self.session.lock().await;
        let core = &mut guard.core;
        core.send(&configure).await?;
        core.send(&trigger).await?;
        let reply = core.receive().await?;
        let value = decode_f64(&reply)?;
        debug!(instrument = %core.name(), signal = %request.signal(), value, "Reading");
        Ok(value)
    }

    /// Auto-ranged voltage reading.
    pub async fn voltage(&self, coupling: Coupling) -> InstrResult<f64> {
        self.measure_request(&MeasurementRequest::auto(SignalKind::Voltage(coupling)))
            .await
    }

    /// Auto-ranged current reading.
    pub async fn current(&self, coupling: Coupling) -> InstrResult<f64> {
        self.measure_request(&MeasurementRequest::auto(SignalKind::Current(coupling)))
            .await
    }

    /// Polls `ERR?` and decodes the status word.
    pub async fn error_codes(&self) -> InstrResult<Vec<ErrorCode>> {
        let reply = self
            .session
            .lock()
            .await
            .core
            .query(&EncodedCommand::new("ERR?"))
            .await?;
        let status = parse_status_word(&reply)?;
        Ok(decode_errors(status, ERROR_CODES))
    }

    /// Polls `ERR?`, turning any reported condition into an error.
    pub async fn check_errors(&self) -> InstrResult<()> {
        let errors = self.error_codes().await?;
        if errors.is_empty() {
            return Ok(());
        }
        Err(InstrError::DeviceReported {
            instrument: self.session.name().to_string(),
            errors: errors.iter().map(ToString::to_string).collect(),
        })
    }
}

#[async_trait]
impl Instrument for Hp3457a {
    fn name(&self) -> &str {
        self.session.name()
    }

    async fn connect(&self) -> InstrResult<()> {
        self.session.connect().await
    }

    async fn disconnect(&self) -> InstrResult<()> {
        self.session.disconnect().await
    }

    async fn is_connected(&self) -> bool {
        self.session.is_connected().await
    }
}

#[async_trait]
impl Measures<Voltage> for Hp3457a {
    async fn measure(&self, coupling: Coupling) -> InstrResult<f64> {
        self.voltage(coupling).await
    }
}

#[async_trait]
impl Measures<Current> for Hp3457a {
    async fn measure(&self, coupling: Coupling) -> InstrResult<f64> {
        self.current(coupling).await
    }
}

#[async_trait]
impl HasTrigger for Hp3457a {
    type Mode = TriggerMode;

    async fn set_trigger(&self, mode: TriggerMode) -> InstrResult<()> {
        self.configure_trigger(mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Bound;
    use crate::protocol::Setting;

    fn encode(signal: SignalKind, range: Setting, resolution: Setting) -> InstrResult<String> {
        let request = MeasurementRequest::new(signal, range, resolution)?;
        Ok(encode_function(&request)?.as_str().to_string())
    }

    #[test]
    fn function_operands() {
        let dcv = SignalKind::Voltage(Coupling::Dc);
        assert_eq!(encode(dcv, Setting::Auto, Setting::Auto).unwrap(), "DCV");
        assert_eq!(
            encode(dcv, Setting::Value(10.0), Setting::Value(1.0)).unwrap(),
            "DCV 10,1"
        );
        assert_eq!(
            encode(SignalKind::Current(Coupling::Dc), Setting::Value(1.5), Setting::Value(1.0))
                .unwrap(),
            "DCI 1.5,1"
        );
        assert_eq!(
            encode(SignalKind::Voltage(Coupling::Ac), Setting::Max, Setting::Auto).unwrap(),
            "ACV 300"
        );
        assert_eq!(
            encode(SignalKind::Current(Coupling::Ac), Setting::Value(0.1), Setting::Min).unwrap(),
            "ACI 0.1,1"
        );
        assert_eq!(
            encode(SignalKind::Frequency, Setting::Auto, Setting::Auto).unwrap(),
            "FREQ"
        );
    }

    #[test]
    fn out_of_range_operands_are_rejected() {
        let dcv = SignalKind::Voltage(Coupling::Dc);
        let err = encode(dcv, Setting::Value(1000.0), Setting::Value(1.0)).unwrap_err();
        assert!(matches!(
            err,
            InstrError::Range(ref e) if e.bound == Bound::Max(300.0)
        ));
        let err = encode(dcv, Setting::Value(10.0), Setting::Value(120.0)).unwrap_err();
        assert!(matches!(err, InstrError::Range(ref e) if e.parameter == "resolution"));
        assert!(encode_nplc(101.0).is_err());
        assert_eq!(encode_nplc(1.0).unwrap().as_str(), "NPLC 1");
    }

    #[test]
    fn unsupported_signal_is_construction_error() {
        let err = encode(SignalKind::Capacitance, Setting::Auto, Setting::Auto).unwrap_err();
        assert!(err.is_pre_io());
        assert!(matches!(err, InstrError::Construction(_)));
    }

    #[test]
    fn status_word_taxonomy() {
        assert_eq!(
            decode_errors(136, ERROR_CODES),
            vec![ErrorCode::Syntax, ErrorCode::ParameterMissing]
        );
        assert_eq!(
            decode_errors(288, ERROR_CODES),
            vec![ErrorCode::UnknownParameter, ErrorCode::ParameterIgnored]
        );
        assert!(decode_errors(0, ERROR_CODES).is_empty());
    }

    #[test]
    fn trigger_and_terminal_codes() {
        assert_eq!(TriggerMode::Synchronous.code(), 5);
        assert_eq!(Terminals::Scanner.code(), 3);
    }
}
