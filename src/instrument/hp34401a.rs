//! HP 34401A multimeter (SCPI)
//!
//! Every reading is a single `MEAS:` query; the instrument configures itself,
//! triggers and answers in one step.

use super::capabilities::{Current, Instrument, Measures, Voltage};
use super::scpi;
use crate::adapters::{DummyTransport, Transport};
use crate::error::InstrResult;
use crate::protocol::error_status::StandardEvent;
use crate::protocol::measurement::{
    encode_scpi, Coupling, MeasurementRequest, RangeLimits, SignalKind,
};
use crate::protocol::{decode_f64, EncodedCommand, Limits};
use crate::session::{Handshake, Session, SessionCore};
use async_trait::async_trait;
use tracing::debug;

/// Model field expected in the `*IDN?` reply.
pub const EXPECTED_MODEL: &str = "34401A";

const fn limits(parameter: &'static str, min: f64, max: f64) -> RangeLimits {
    RangeLimits {
        range: Limits::new(parameter, min, max),
        resolution: Limits::new("resolution", 0.0, max),
    }
}

/// DC voltage ranges.
pub const DC_VOLTAGE_LIMITS: RangeLimits = limits("dc_voltage_range", 0.1, 1000.0);
/// AC voltage ranges.
pub const AC_VOLTAGE_LIMITS: RangeLimits = limits("ac_voltage_range", 0.1, 750.0);
/// DC current ranges.
pub const DC_CURRENT_LIMITS: RangeLimits = limits("dc_current_range", 0.01, 3.0);
/// AC current ranges.
pub const AC_CURRENT_LIMITS: RangeLimits = limits("ac_current_range", 1.0, 3.0);
/// Resistance ranges (two- and four-wire).
pub const RESISTANCE_LIMITS: RangeLimits = limits("resistance_range", 100.0, 100e6);

fn limits_for(signal: SignalKind) -> Option<&'static RangeLimits> {
    match signal {
        SignalKind::Voltage(Coupling::Dc) => Some(&DC_VOLTAGE_LIMITS),
        SignalKind::Voltage(Coupling::Ac) => Some(&AC_VOLTAGE_LIMITS),
        SignalKind::Current(Coupling::Dc) => Some(&DC_CURRENT_LIMITS),
        SignalKind::Current(Coupling::Ac) => Some(&AC_CURRENT_LIMITS),
        SignalKind::Resistance | SignalKind::FourWireResistance => Some(&RESISTANCE_LIMITS),
        _ => None,
    }
}

/// `MEAS:` query for `request`, range-checked against this model.
pub fn encode_measurement(request: &MeasurementRequest) -> InstrResult<EncodedCommand> {
    Ok(encode_scpi(request, limits_for(request.signal()))?)
}

/// Handshake state; the 34401A keeps nothing else on the host side.
#[derive(Debug, Default)]
pub struct Hp34401aState;

#[async_trait]
impl Handshake for Hp34401aState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        scpi::identify(core, EXPECTED_MODEL).await
    }
}

/// HP 34401A driver.
#[derive(Debug)]
pub struct Hp34401a {
    session: Session<Hp34401aState>,
}

impl Hp34401a {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(name, transport, Hp34401aState),
        }
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self {
            session: Session::dummy_with(name, Box::new(transport), Hp34401aState),
        }
    }

    /// Takes one reading as described by `request`.
    pub async fn measure_request(&self, request: &MeasurementRequest) -> InstrResult<f64> {
        let command = encode_measurement(request)?;
        let mut guard = self.session.lock().await;
        let reply = guard.core.query(&command).await?;
        let value = decode_f64(&reply)?;
        debug!(instrument = %guard.core.name(), signal = %request.signal(), value, "Reading");
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
impl Instrument for Hp34401a {
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
impl Measures<Voltage> for Hp34401a {
    async fn measure(&self, coupling: Coupling) -> InstrResult<f64> {
        self.voltage(coupling).await
    }
}

#[async_trait]
impl Measures<Current> for Hp34401a {
    async fn measure(&self, coupling: Coupling) -> InstrResult<f64> {
        self.current(coupling).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Bound, InstrError};
    use crate::protocol::Setting;

    fn encode(signal: SignalKind, range: Setting, resolution: Setting) -> InstrResult<String> {
        let request = MeasurementRequest::new(signal, range, resolution)?;
        Ok(encode_measurement(&request)?.as_str().to_string())
    }

    #[test]
    fn model_specific_limits() {
        let acv = SignalKind::Voltage(Coupling::Ac);
        assert_eq!(
            encode(acv, Setting::Value(750.0), Setting::Auto).unwrap(),
            "MEAS:VOLT:AC? 750"
        );
        let err = encode(acv, Setting::Value(1000.0), Setting::Auto).unwrap_err();
        assert!(matches!(err, InstrError::Range(ref e) if e.bound == Bound::Max(750.0)));

        let aci = SignalKind::Current(Coupling::Ac);
        let err = encode(aci, Setting::Value(0.5), Setting::Auto).unwrap_err();
        assert!(matches!(err, InstrError::Range(ref e) if e.bound == Bound::Min(1.0)));
    }

    #[test]
    fn sentinels_pass_through() {
        assert_eq!(
            encode(SignalKind::Current(Coupling::Dc), Setting::Min, Setting::Max).unwrap(),
            "MEAS:CURR:DC? MIN,MAX"
        );
        assert_eq!(
            encode(SignalKind::FourWireResistance, Setting::Auto, Setting::Auto).unwrap(),
            "MEAS:FRES? AUTO"
        );
        assert_eq!(
            encode(SignalKind::Temperature, Setting::Auto, Setting::Auto).unwrap(),
            "MEAS:TEMP?"
        );
    }
}
