//! HP 6632B system power supply (SCPI)

use super::capabilities::{Current, HasOutput, Instrument, Measures, PowerSupply, Voltage};
use super::scpi;
use crate::adapters::{DummyTransport, Transport};
use crate::cache::CachedParameter;
use crate::error::{Bound, InstrError, InstrResult, RangeError, TransportError};
use crate::protocol::error_status::StandardEvent;
use crate::protocol::measurement::Coupling;
use crate::protocol::{decode_bool, decode_f64, EncodedCommand, Limits};
use crate::session::{Handshake, Link, Session, SessionCore};
use async_trait::async_trait;
use tracing::warn;

/// Model field expected in the `*IDN?` reply.
pub const EXPECTED_MODEL: &str = "6632B";

/// Identification attempts before giving up.
const IDENTIFY_ATTEMPTS: usize = 3;

/// Characters the front-panel display can show.
pub const DISPLAY_CHARS: usize = 14;

const VOLTAGE_LIMITS: Limits = Limits::new("voltage", 0.0, 20.0);
const CURRENT_LIMITS: Limits = Limits::new("current", 0.0, 5.0);

/// `VOLT <v>`.
pub fn encode_voltage(volts: f64) -> Result<EncodedCommand, RangeError> {
    VOLTAGE_LIMITS.check(volts)?;
    Ok(EncodedCommand::new(format!("VOLT {}", volts)))
}

/// `CURR <a>`.
pub fn encode_current(amps: f64) -> Result<EncodedCommand, RangeError> {
    CURRENT_LIMITS.check(amps)?;
    Ok(EncodedCommand::new(format!("CURR {}", amps)))
}

/// `DISPLAY:TEXT "<text>"`, with embedded quotes doubled.
pub fn encode_display_text(text: &str) -> Result<EncodedCommand, RangeError> {
    let length = text.chars().count();
    if length > DISPLAY_CHARS {
        return Err(RangeError {
            parameter: "display_text_length".to_string(),
            value: length as f64,
            bound: Bound::Max(DISPLAY_CHARS as f64),
        });
    }
    Ok(EncodedCommand::new(format!(
        "DISPLAY:TEXT \"{}\"",
        text.replace('"', "\"\"")
    )))
}

fn is_missing_reply(err: &InstrError) -> bool {
    matches!(
        err,
        InstrError::Transport {
            source: TransportError::NoReply | TransportError::Receive(_),
            ..
        }
    )
}

/// Driver-private state.
#[derive(Debug)]
pub struct Hp6632bState {
    voltage: CachedParameter<f64>,
    current: CachedParameter<f64>,
    output: CachedParameter<bool>,
    display_text_mode: bool,
}

impl Default for Hp6632bState {
    fn default() -> Self {
        Self {
            voltage: CachedParameter::unconfirmed(0.0),
            current: CachedParameter::unconfirmed(0.0),
            output: CachedParameter::unconfirmed(false),
            display_text_mode: false,
        }
    }
}

#[async_trait]
impl Handshake for Hp6632bState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        let mut attempt = 1;
        loop {
            match scpi::identify(core, EXPECTED_MODEL).await {
                Ok(()) => break,
                Err(e) if is_missing_reply(&e) && attempt < IDENTIFY_ATTEMPTS => {
                    warn!(instrument = %core.name(), attempt, "No identification reply, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        core.send(&EncodedCommand::new("DISPLAY:MODE NORMAL")).await?;
        self.display_text_mode = false;
        Ok(())
    }
}

/// HP 6632B driver.
#[derive(Debug)]
pub struct Hp6632b {
    session: Session<Hp6632bState>,
}

impl Hp6632b {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(name, transport, Hp6632bState::default()),
        }
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self {
            session: Session::dummy_with(name, Box::new(transport), Hp6632bState::default()),
        }
    }

    async fn query_f64(&self, command: &str) -> InstrResult<f64> {
        let reply = self
            .session
            .lock()
            .await
            .core
            .query(&EncodedCommand::new(command))
            .await?;
        Ok(decode_f64(&reply)?)
    }

    /// Sets the output voltage.
    pub async fn set_voltage(&self, volts: f64) -> InstrResult<()> {
        let command = encode_voltage(volts)?;
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.voltage.record_write(volts);
        core.send(&command).await
    }

    /// Programmed output voltage.
    pub async fn voltage(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.voltage, &EncodedCommand::new("VOLT?"), decode_f64)
            .await
    }

    /// Sets the current limit.
    pub async fn set_current(&self, amps: f64) -> InstrResult<()> {
        let command = encode_current(amps)?;
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.current.record_write(amps);
        core.send(&command).await
    }

    /// Programmed current limit.
    pub async fn current(&self) -> InstrResult<f64> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.current, &EncodedCommand::new("CURR?"), decode_f64)
            .await
    }

    /// Measured output voltage.
    pub async fn measured_voltage(&self) -> InstrResult<f64> {
        self.query_f64("MEAS:VOLT?").await
    }

    /// Measured output current.
    pub async fn measured_current(&self) -> InstrResult<f64> {
        self.query_f64("MEAS:CURR?").await
    }

    async fn set_output(&self, on: bool) -> InstrResult<()> {
        let command = EncodedCommand::new(if on { "OUTP ON" } else { "OUTP OFF" });
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.output.record_write(on);
        core.send(&command).await
    }

    /// Shows `text` instead of the voltage/current readout.
    pub async fn display_text(&self, text: &str) -> InstrResult<()> {
        let command = encode_display_text(text)?;
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        if !state.display_text_mode {
            core.send(&EncodedCommand::new("DISPLAY:MODE TEXT")).await?;
            state.display_text_mode = true;
        }
        core.send(&command).await
    }

    /// Returns the display to the voltage/current readout.
    pub async fn display_normal(&self) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.send(&EncodedCommand::new("DISPLAY:MODE NORMAL")).await?;
        state.display_text_mode = false;
        Ok(())
    }

    /// Reads and clears the standard event status register.
    pub async fn standard_events(&self) -> InstrResult<Vec<StandardEvent>> {
        scpi::standard_events(&mut self.session.lock().await.core).await
    }

    /// Fails with the error bits of the event register, if any are set.
    pub async fn check_errors(&self) -> InstrResult<()> {
        let events = self.standard_events().await?;
        scpi::ensure_no_errors(self.session.name(), &events)
    }
}

#[async_trait]
impl Instrument for Hp6632b {
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
impl HasOutput for Hp6632b {
    async fn enable_output(&self) -> InstrResult<()> {
        self.set_output(true).await
    }

    async fn disable_output(&self) -> InstrResult<()> {
        self.set_output(false).await
    }

    async fn output_enabled(&self) -> InstrResult<bool> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.read_cached(&mut state.output, &EncodedCommand::new("OUTP?"), decode_bool)
            .await
    }
}

// The supply only measures DC; the coupling argument is ignored.
#[async_trait]
impl Measures<Voltage> for Hp6632b {
    async fn measure(&self, _coupling: Coupling) -> InstrResult<f64> {
        self.measured_voltage().await
    }
}

#[async_trait]
impl Measures<Current> for Hp6632b {
    async fn measure(&self, _coupling: Coupling) -> InstrResult<f64> {
        self.measured_current().await
    }
}

#[async_trait]
impl PowerSupply for Hp6632b {
    async fn set_voltage(&self, volts: f64) -> InstrResult<()> {
        Hp6632b::set_voltage(self, volts).await
    }

    async fn voltage_setpoint(&self) -> InstrResult<f64> {
        self.voltage().await
    }

    async fn set_current_limit(&self, amps: f64) -> InstrResult<()> {
        self.set_current(amps).await
    }

    async fn current_limit(&self) -> InstrResult<f64> {
        self.current().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoints_are_range_checked() {
        assert_eq!(encode_voltage(12.5).unwrap().as_str(), "VOLT 12.5");
        assert_eq!(encode_current(0.0).unwrap().as_str(), "CURR 0");
        assert_eq!(encode_voltage(20.5).unwrap_err().bound, Bound::Max(20.0));
        assert_eq!(encode_current(-0.1).unwrap_err().bound, Bound::Min(0.0));
    }

    #[test]
    fn display_text_quotes_and_length() {
        assert_eq!(
            encode_display_text("HELLO").unwrap().as_str(),
            "DISPLAY:TEXT \"HELLO\""
        );
        assert_eq!(
            encode_display_text("SAY \"HI\"").unwrap().as_str(),
            "DISPLAY:TEXT \"SAY \"\"HI\"\"\""
        );
        let err = encode_display_text("FIFTEEN CHARS!!").unwrap_err();
        assert_eq!(err.parameter, "display_text_length");
        assert_eq!(err.value, 15.0);
        assert_eq!(err.bound, Bound::Max(14.0));
    }
}
