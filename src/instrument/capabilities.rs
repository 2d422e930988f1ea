//! Capability traits implemented per concrete driver.
//!
//! A driver implements only what its instrument can actually do; callers that
//! need, say, any DC voltmeter take `&dyn Measures<Voltage>`.

use crate::error::InstrResult;
use crate::protocol::measurement::Coupling;
use async_trait::async_trait;

/// Lifecycle shared by every instrument.
#[async_trait]
pub trait Instrument: Send + Sync {
    /// Friendly name (the configured id).
    fn name(&self) -> &str;
    /// Opens the link and confirms the instrument's identity.
    async fn connect(&self) -> InstrResult<()>;
    /// Releases the link.
    async fn disconnect(&self) -> InstrResult<()>;
    /// True between a successful `connect` and `disconnect`.
    async fn is_connected(&self) -> bool;
}

/// A physical quantity an instrument can measure.
pub trait Quantity: Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;
    /// Base unit symbol.
    const UNIT: &'static str;
}

/// Electrical potential, in volts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voltage;

/// Electrical current, in amperes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Current;

impl Quantity for Voltage {
    const NAME: &'static str = "voltage";
    const UNIT: &'static str = "V";
}

impl Quantity for Current {
    const NAME: &'static str = "current";
    const UNIT: &'static str = "A";
}

/// Capability for instruments that measure `Q`, auto-ranged.
#[async_trait]
pub trait Measures<Q: Quantity>: Instrument {
    /// One reading in the quantity's base unit.
    async fn measure(&self, coupling: Coupling) -> InstrResult<f64>;
}

/// Capability for instruments with a switchable output.
#[async_trait]
pub trait HasOutput: Instrument {
    /// Switches the output on.
    async fn enable_output(&self) -> InstrResult<()>;
    /// Switches the output off.
    async fn disable_output(&self) -> InstrResult<()>;
    /// Current output state.
    async fn output_enabled(&self) -> InstrResult<bool>;
}

/// Capability for instruments with a selectable trigger source.
#[async_trait]
pub trait HasTrigger: Instrument {
    /// Model-specific trigger source.
    type Mode: Send + 'static;
    /// Selects the trigger source.
    async fn set_trigger(&self, mode: Self::Mode) -> InstrResult<()>;
}

/// Capability for signal generators.
#[async_trait]
pub trait SignalSource: HasOutput {
    /// Sets the output frequency in Hz.
    async fn set_frequency(&self, hz: f64) -> InstrResult<()>;
    /// Output frequency in Hz.
    async fn frequency(&self) -> InstrResult<f64>;
    /// Sets the output amplitude in volts.
    async fn set_amplitude(&self, volts: f64) -> InstrResult<()>;
    /// Output amplitude in volts.
    async fn amplitude(&self) -> InstrResult<f64>;
}

/// Capability for programmable power supplies.
#[async_trait]
pub trait PowerSupply: HasOutput + Measures<Voltage> + Measures<Current> {
    /// Programs the output voltage.
    async fn set_voltage(&self, volts: f64) -> InstrResult<()>;
    /// Programmed output voltage.
    async fn voltage_setpoint(&self) -> InstrResult<f64>;
    /// Programs the current limit.
    async fn set_current_limit(&self, amps: f64) -> InstrResult<()>;
    /// Programmed current limit.
    async fn current_limit(&self) -> InstrResult<f64>;
}
