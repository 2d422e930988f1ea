//! OR-X 402A programmable waveform generator
//!
//! The 402A drops commands that follow each other too closely, so every send
//! goes through a [`DispatchGate`] with a 50 ms interval. Its replies to
//! queries are unreliable, so each parameter is cached and only re-queried
//! after a command may have changed it.
//!
//! ## Wire format
//!
//! | Parameter | Command | Example |
//! |-----------|---------|---------|
//! | Frequency | `F<v><HZ\|KHZ>` | `F1234KHZ`, `F4.32KHZ` |
//! | Amplitude | `A<v><MV\|V>` | `A999MV`, `A1.23V` |
//! | Offset | `O<v><MV\|V>` | `O0MV`, `O4.00V` |
//! | Waveform | `W0`..`W3` | DC, sine, square, triangle |
//! | Output | `N0` / `N1` | |
//!
//! Queries are `?F ?A ?O ?W ?N`; `?*` answers all of them `;`-separated.
//!
//! The frequency stays in Hz up to 4 kHz. When the first printed digit is 4 or
//! more the front panel only holds three significant digits.

use super::capabilities::{HasOutput, Instrument, SignalSource};
use crate::adapters::{DummyTransport, Transport};
use crate::cache::CachedParameter;
use crate::config::TimeoutSettings;
use crate::dispatch::DispatchGate;
use crate::error::{DecodeError, InstrResult, RangeError};
use crate::protocol::units::{
    print, round_half_even, Band, Notation, Precision, QuantityFormat, Rendered, Rounding, Unit,
    UnitTable,
};
use crate::protocol::{decode, extract_field, EncodedCommand, Limits, ReplyShape};
use crate::session::{Handshake, Link, Session, SessionCore};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Minimum spacing between two commands.
pub const COMMAND_INTERVAL: Duration = Duration::from_millis(50);

const FREQUENCY_LIMITS: Limits = Limits::new("frequency", 0.004, 9.99e6);
const AMPLITUDE_LIMITS: Limits = Limits::new("amplitude", 10e-3, 9.99);
const MAX_OUTPUT_SWING: f64 = 4.99;

const FREQUENCY_UNITS: UnitTable =
    UnitTable::smallest_first(&[Unit::new("HZ", 1.0).until(4e3), Unit::new("KHZ", 1e3)]);

const VOLTAGE_UNITS: UnitTable =
    UnitTable::smallest_first(&[Unit::new("MV", 1e-3).until(1.0), Unit::new("V", 1.0)]);

const FREQUENCY_FORMAT: QuantityFormat = QuantityFormat {
    units: FREQUENCY_UNITS,
    precision: Precision::Bands(&[
        Band::new(1000.0, 0),
        Band::new(100.0, 1),
        Band::new(10.0, 2),
        Band::new(1.0, 3),
        Band::new(0.0, 4),
    ]),
    rounding: Rounding::Truncate,
    notation: Notation::Minimal,
};

const VOLTAGE_FORMAT: QuantityFormat = QuantityFormat {
    units: VOLTAGE_UNITS,
    precision: Precision::PerUnit(&[("MV", 0), ("V", 2)]),
    rounding: Rounding::HalfEven,
    notation: Notation::Fixed,
};

const FREQUENCY_REPLY: ReplyShape = ReplyShape {
    prefix: "F",
    separator: ';',
    units: FREQUENCY_UNITS,
};

const AMPLITUDE_REPLY: ReplyShape = ReplyShape {
    prefix: "A",
    separator: ';',
    units: VOLTAGE_UNITS,
};

const OFFSET_REPLY: ReplyShape = ReplyShape {
    prefix: "O",
    separator: ';',
    units: VOLTAGE_UNITS,
};

/// Output waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Waveform {
    /// DC level only.
    Dc,
    /// Sine.
    #[default]
    Sine,
    /// Square.
    Square,
    /// Triangle.
    Triangle,
}

impl Waveform {
    const ALL: [Waveform; 4] = [
        Waveform::Dc,
        Waveform::Sine,
        Waveform::Square,
        Waveform::Triangle,
    ];

    /// Wire token.
    pub fn token(&self) -> &'static str {
        match self {
            Waveform::Dc => "W0",
            Waveform::Sine => "W1",
            Waveform::Square => "W2",
            Waveform::Triangle => "W3",
        }
    }
}

/// Amplitude scale the output stage switches to for `volts`.
fn voltage_range(volts: f64) -> f64 {
    if volts >= 1.0 {
        1.0
    } else if volts >= 0.1 {
        0.1
    } else {
        0.01
    }
}

/// Cuts the printed frequency to three significant digits when it leads with
/// a digit of 4 or more.
fn limit_significant_digits(rendered: &Rendered) -> String {
    let leading = rendered
        .digits
        .chars()
        .next()
        .and_then(|c| c.to_digit(10))
        .unwrap_or(0);
    if leading < 4 {
        return rendered.digits.clone();
    }
    if rendered.quantized.fract() != 0.0 {
        return print(round_half_even(rendered.quantized, 2), 2, Notation::Minimal);
    }
    if rendered.decimals > 0 {
        return rendered.digits.clone();
    }
    let mut digits = rendered.digits.clone();
    digits.pop();
    digits.push('0');
    digits
}

/// `F<v><unit>` for `hz`.
pub fn encode_frequency(hz: f64) -> Result<EncodedCommand, RangeError> {
    FREQUENCY_LIMITS.check(hz)?;
    let rendered = FREQUENCY_FORMAT.render(hz);
    Ok(EncodedCommand::new(format!(
        "F{}{}",
        limit_significant_digits(&rendered),
        rendered.unit.token
    )))
}

/// Amplitude limits given the current offset.
///
/// A positive offset eats into the output swing: the amplitude may then be at
/// most `2 * (4.99 * range(amplitude) - offset)`.
pub fn amplitude_limits(volts: f64, offset: f64) -> Limits {
    if offset > 0.0 {
        AMPLITUDE_LIMITS.with_max(2.0 * (MAX_OUTPUT_SWING * voltage_range(volts) - offset))
    } else {
        AMPLITUDE_LIMITS
    }
}

/// Offset limits given the current amplitude: `|offset| <= 4.99 * range(amplitude) - amplitude / 2`.
pub fn offset_limits(amplitude: f64) -> Limits {
    let max = MAX_OUTPUT_SWING * voltage_range(amplitude) - 0.5 * amplitude;
    Limits::new("offset", -max, max)
}

fn encode_voltage(verb: char, volts: f64) -> EncodedCommand {
    let rendered = VOLTAGE_FORMAT.render(volts);
    EncodedCommand::new(format!("{}{}{}", verb, rendered.digits, rendered.unit.token))
}

/// `A<v><unit>` for `volts`, checked against the current `offset`.
pub fn encode_amplitude(volts: f64, offset: f64) -> Result<EncodedCommand, RangeError> {
    amplitude_limits(volts, offset).check(volts)?;
    Ok(encode_voltage('A', volts))
}

/// `O<v><unit>` for `volts`, checked against the current `amplitude`.
///
/// The offset is set in 10 mV steps. Negative offsets pick their unit by
/// magnitude like positive ones (`O-2.00V`, `O-100MV`); the vendor's own
/// control software sends every negative offset in millivolts (`O-2000MV`),
/// which the instrument reads as the same value.
pub fn encode_offset(volts: f64, amplitude: f64) -> Result<EncodedCommand, RangeError> {
    offset_limits(amplitude).check(volts)?;
    Ok(encode_voltage('O', round_half_even(volts, 2)))
}

fn decode_waveform(reply: &str) -> Result<Waveform, DecodeError> {
    let field = extract_field(reply, "W", ';')?;
    Waveform::ALL
        .into_iter()
        .find(|w| w.token() == field)
        .ok_or_else(|| DecodeError::malformed(reply, "unknown waveform"))
}

fn decode_output(reply: &str) -> Result<bool, DecodeError> {
    match extract_field(reply, "N", ';')? {
        "N1" => Ok(true),
        "N0" => Ok(false),
        _ => Err(DecodeError::malformed(reply, "unknown output state")),
    }
}

/// Tracked device state.
#[derive(Debug)]
pub struct OrxState {
    frequency: CachedParameter<f64>,
    amplitude: CachedParameter<f64>,
    offset: CachedParameter<f64>,
    waveform: CachedParameter<Waveform>,
    output: CachedParameter<bool>,
    settle: Duration,
}

impl Default for OrxState {
    fn default() -> Self {
        Self {
            frequency: CachedParameter::unconfirmed(0.0),
            amplitude: CachedParameter::unconfirmed(0.0),
            offset: CachedParameter::unconfirmed(0.0),
            waveform: CachedParameter::unconfirmed(Waveform::Sine),
            output: CachedParameter::unconfirmed(false),
            settle: Duration::from_secs(3),
        }
    }
}

impl OrxState {
    /// Confirms every cache from a `?*` reply. Nothing is stored unless all
    /// fields decode.
    fn seed(&mut self, reply: &str) -> Result<(), DecodeError> {
        let frequency = decode(reply, &FREQUENCY_REPLY)?;
        let amplitude = decode(reply, &AMPLITUDE_REPLY)?;
        let offset = decode(reply, &OFFSET_REPLY)?;
        let waveform = decode_waveform(reply)?;
        let output = decode_output(reply)?;
        self.frequency.confirm(frequency);
        self.amplitude.confirm(amplitude);
        self.offset.confirm(offset);
        self.waveform.confirm(waveform);
        self.output.confirm(output);
        Ok(())
    }
}

#[async_trait]
impl Handshake for OrxState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        // Shows the GPIB address on the display.
        core.send(&EncodedCommand::new("Z488")).await?;
        // Commands right after the first one fail with "ERROR 9-1".
        tokio::time::sleep(self.settle).await;
        core.send(&EncodedCommand::new("N0")).await?;
        let reply = core.query(&EncodedCommand::new("?*")).await?;
        self.seed(&reply)?;
        debug!(instrument = %core.name(), state = %reply, "Seeded parameter cache");
        Ok(())
    }
}

/// OR-X 402A driver.
#[derive(Debug)]
pub struct Orx402a {
    session: Session<OrxState>,
}

impl Orx402a {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self::gated(Session::new(name, transport, OrxState::default()))
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self::gated(Session::dummy_with(
            name,
            Box::new(transport),
            OrxState::default(),
        ))
    }

    fn gated(session: Session<OrxState>) -> Self {
        let defaults = TimeoutSettings::default();
        Self {
            session: session.with_gate(Self::gate(&defaults)),
        }
    }

    fn gate(timeouts: &TimeoutSettings) -> DispatchGate {
        DispatchGate::new(
            COMMAND_INTERVAL,
            timeouts.gate_send_wait(),
            timeouts.gate_read_wait(),
        )
    }

    /// Applies configured gate waits and settle delay.
    pub fn with_timeouts(mut self, timeouts: &TimeoutSettings) -> Self {
        self.session = self.session.with_gate(Self::gate(timeouts));
        self.session.state_mut().settle = timeouts.connect_settle();
        self
    }

    /// Pause between the first command and the rest of the handshake.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.session.state_mut().settle = settle;
        self
    }

    async fn write<F>(&self, command: EncodedCommand, record: F) -> InstrResult<()>
    where
        F: FnOnce(&mut OrxState) + Send,
    {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        // Anything the command touches is unconfirmed from here on, even if
        // the write fails half way.
        record(state);
        core.send(&command).await
    }

    /// Sets the output frequency in Hz.
    pub async fn set_frequency(&self, hz: f64) -> InstrResult<()> {
        let command = encode_frequency(hz)?;
        self.write(command, |s| s.frequency.record_write(hz)).await
    }

    /// Output frequency in Hz.
    pub async fn frequency(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.frequency, &EncodedCommand::new("?F"), |r| {
            decode(r, &FREQUENCY_REPLY)
        })
        .await
    }

    /// Sets the peak-to-peak amplitude in volts.
    pub async fn set_amplitude(&self, volts: f64) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        let command = encode_amplitude(volts, *state.offset.peek())?;
        state.amplitude.record_write(volts);
        state.offset.invalidate();
        core.send(&command).await
    }

    /// Amplitude in volts.
    pub async fn amplitude(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.amplitude, &EncodedCommand::new("?A"), |r| {
            decode(r, &AMPLITUDE_REPLY)
        })
        .await
    }

    /// Sets the DC offset in volts.
    pub async fn set_offset(&self, volts: f64) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        let command = encode_offset(volts, *state.amplitude.peek())?;
        state.offset.record_write(round_half_even(volts, 2));
        state.amplitude.invalidate();
        core.send(&command).await
    }

    /// Offset in volts.
    pub async fn offset(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.offset, &EncodedCommand::new("?O"), |r| {
            decode(r, &OFFSET_REPLY)
        })
        .await
    }

    /// Selects the waveform.
    pub async fn set_waveform(&self, waveform: Waveform) -> InstrResult<()> {
        let command = EncodedCommand::new(waveform.token());
        self.write(command, |s| s.waveform.record_write(waveform))
            .await
    }

    /// Selected waveform.
    pub async fn waveform(&self) -> InstrResult<Waveform> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.waveform, &EncodedCommand::new("?W"), decode_waveform)
            .await
    }

    async fn set_output(&self, on: bool) -> InstrResult<()> {
        let command = EncodedCommand::new(if on { "N1" } else { "N0" });
        self.write(command, |s| s.output.record_write(on)).await
    }

    /// Re-reads every parameter with a single `?*` query.
    pub async fn refresh_all(&self) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        let reply = core.query(&EncodedCommand::new("?*")).await?;
        state.seed(&reply)?;
        Ok(())
    }
}

#[async_trait]
impl Instrument for Orx402a {
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
impl HasOutput for Orx402a {
    async fn enable_output(&self) -> InstrResult<()> {
        self.set_output(true).await
    }

    async fn disable_output(&self) -> InstrResult<()> {
        self.set_output(false).await
    }

    async fn output_enabled(&self) -> InstrResult<bool> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.output, &EncodedCommand::new("?N"), decode_output)
            .await
    }
}

#[async_trait]
impl SignalSource for Orx402a {
    async fn set_frequency(&self, hz: f64) -> InstrResult<()> {
        Orx402a::set_frequency(self, hz).await
    }

    async fn frequency(&self) -> InstrResult<f64> {
        Orx402a::frequency(self).await
    }

    async fn set_amplitude(&self, volts: f64) -> InstrResult<()> {
        Orx402a::set_amplitude(self, volts).await
    }

    async fn amplitude(&self) -> InstrResult<f64> {
        Orx402a::amplitude(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Bound;

    fn command(result: Result<EncodedCommand, RangeError>) -> String {
        result.unwrap().as_str().to_string()
    }

    #[test]
    fn frequency_commands() {
        let cases = [
            (1.234, "F1.234HZ"),
            (1234.0, "F1234HZ"),
            (1234e3, "F1234KHZ"),
            (4320.0, "F4.32KHZ"),
            (4320e3, "F4320KHZ"),
            (5430.0, "F5.43KHZ"),
            (5430e3, "F5430KHZ"),
            (9870.0, "F9.87KHZ"),
            (9870e3, "F9870KHZ"),
        ];
        for (hz, expected) in cases {
            assert_eq!(command(encode_frequency(hz)), expected, "{} Hz", hz);
        }
    }

    #[test]
    fn frequency_keeps_three_significant_digits() {
        assert_eq!(command(encode_frequency(4567e3)), "F4560KHZ");
        assert_eq!(command(encode_frequency(3999.0)), "F3999HZ");
        assert_eq!(command(encode_frequency(0.5)), "F0.5HZ");
    }

    #[test]
    fn frequency_limits() {
        let err = encode_frequency(10e6).unwrap_err();
        assert_eq!(err.parameter, "frequency");
        assert_eq!(err.bound, Bound::Max(9.99e6));
        assert_eq!(
            encode_frequency(0.001).unwrap_err().bound,
            Bound::Min(0.004)
        );
    }

    #[test]
    fn amplitude_commands() {
        let cases = [
            (1.0, "A1.00V"),
            (0.999, "A999MV"),
            (1.234, "A1.23V"),
            (0.9, "A900MV"),
            (0.01, "A10MV"),
        ];
        for (volts, expected) in cases {
            assert_eq!(command(encode_amplitude(volts, 0.0)), expected);
        }
    }

    #[test]
    fn positive_offset_shrinks_amplitude_range() {
        // 2 * (4.99 * 1 - 4) = 1.98
        let err = encode_amplitude(2.0, 4.0).unwrap_err();
        assert_eq!(err.parameter, "amplitude");
        assert!(matches!(err.bound, Bound::Max(max) if (max - 1.98).abs() < 1e-9));
        assert!(encode_amplitude(1.5, 4.0).is_ok());
        assert!(encode_amplitude(0.005, 0.0).is_err());
    }

    #[test]
    fn offset_commands() {
        let cases = [
            (1.0, "O1.00V"),
            (1.001, "O1.00V"),
            (0.1, "O100MV"),
            (0.01, "O10MV"),
            (0.0, "O0MV"),
            (3.99, "O3.99V"),
            (3.999, "O4.00V"),
            (3.993, "O3.99V"),
            (-2.0, "O-2.00V"),
        ];
        for (volts, expected) in cases {
            assert_eq!(command(encode_offset(volts, 1.0)), expected, "{} V", volts);
        }
    }

    #[test]
    fn offset_limited_by_amplitude() {
        // 4.99 * 1 - 0.5 = 4.49
        assert!(encode_offset(4.49, 1.0).is_ok());
        assert!(matches!(
            encode_offset(4.5, 1.0).unwrap_err().bound,
            Bound::Max(_)
        ));
        assert!(matches!(
            encode_offset(-4.5, 1.0).unwrap_err().bound,
            Bound::Min(_)
        ));
    }

    #[test]
    fn decodes_combined_status_reply() {
        let mut state = OrxState::default();
        state
            .seed("F1.234KHZ;A999MV;O-100MV;W2;N1")
            .unwrap();
        assert_eq!(*state.frequency.peek(), 1234.0);
        assert!((state.amplitude.peek() - 0.999).abs() < 1e-12);
        assert!((state.offset.peek() + 0.1).abs() < 1e-12);
        assert_eq!(*state.waveform.peek(), Waveform::Square);
        assert!(*state.output.peek());
        assert!(!state.frequency.is_dirty());
    }

    #[test]
    fn partial_status_reply_stores_nothing() {
        let mut state = OrxState::default();
        let err = state.seed("F1.234KHZ;A999MV;W2;N1").unwrap_err();
        assert!(matches!(err, DecodeError::FieldNotFound { ref prefix, .. } if prefix == "O"));
        assert!(state.frequency.is_dirty());
    }

    #[test]
    fn unknown_unit_in_reply() {
        assert!(matches!(
            decode("F12MHZ", &FREQUENCY_REPLY),
            Err(DecodeError::UnknownUnit { .. })
        ));
    }

    /// Log-spaced sweep from `start` to `end` (inclusive of `start`).
    fn sweep(start: f64, end: f64, factor: f64) -> Vec<f64> {
        let mut values = Vec::new();
        let mut value = start;
        while value <= end {
            values.push(value);
            value *= factor;
        }
        values.push(end);
        values
    }

    #[test]
    fn frequency_reads_back_within_its_digit_budget() {
        for hz in sweep(0.004, 9.99e6, 1.0371) {
            let sent = encode_frequency(hz).unwrap();
            let read_back = decode(sent.as_str(), &FREQUENCY_REPLY).unwrap();
            let rendered = FREQUENCY_FORMAT.render(hz);
            let magnitude = rendered.quantized.abs();
            let mut step = 10f64.powi(-(rendered.decimals as i32));
            if rendered.digits.starts_with(['4', '5', '6', '7', '8', '9']) {
                step += 10f64.powi(magnitude.log10().floor() as i32 - 2);
            }
            let tolerance = step * rendered.unit.scale + 1e-9 * hz;
            assert!(
                (read_back - hz).abs() <= tolerance,
                "{} Hz sent as {} read back as {}",
                hz,
                sent,
                read_back
            );
        }
    }

    #[test]
    fn amplitude_reads_back_within_half_a_step() {
        for volts in sweep(0.01, 9.99, 1.0213) {
            let sent = encode_amplitude(volts, 0.0).unwrap();
            let read_back = decode(sent.as_str(), &AMPLITUDE_REPLY).unwrap();
            let rendered = VOLTAGE_FORMAT.render(volts);
            let half_step = 0.5 * 10f64.powi(-(rendered.decimals as i32)) * rendered.unit.scale;
            assert!(
                (read_back - volts).abs() <= half_step + 1e-12,
                "{} V sent as {} read back as {}",
                volts,
                sent,
                read_back
            );
        }
    }

    #[test]
    fn offset_reads_back_to_the_nearest_10_mv() {
        let positive = sweep(0.01, 4.49, 1.0317);
        let values = positive
            .iter()
            .flat_map(|v| [*v, -*v])
            .chain([0.0]);
        for volts in values {
            let sent = encode_offset(volts, 1.0).unwrap();
            let read_back = decode(sent.as_str(), &OFFSET_REPLY).unwrap();
            assert!(
                (read_back - volts).abs() <= 0.005 + 1e-12,
                "{} V sent as {} read back as {}",
                volts,
                sent,
                read_back
            );
        }
    }
}
