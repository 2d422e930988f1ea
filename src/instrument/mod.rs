//! Instrument drivers and config-driven construction.
//!
//! Each driver owns one [`Session`](crate::session::Session) and implements
//! the capability traits from [`capabilities`] that its hardware supports.
//! [`build`] turns an [`InstrumentDefinition`] from the configuration file into
//! a typed driver wrapped in [`AnyInstrument`]:
//!
//! ```toml
//! [[instruments]]
//! id = "dmm"
//! model = "hp3457a"
//! reset_after_connect = true
//! transport = { kind = "usb_tmc", vendor_product = "03eb:2065", serial = "HP3457A" }
//! ```

pub mod capabilities;
pub mod hp34401a;
pub mod hp3457a;
pub mod hp6632b;
pub mod hp8954a;
pub mod marconi_2019;
pub mod orx_402a;
pub mod scpi;

pub use capabilities::{
    Current, HasOutput, HasTrigger, Instrument, Measures, PowerSupply, Quantity, SignalSource,
    Voltage,
};
pub use hp34401a::Hp34401a;
pub use hp3457a::Hp3457a;
pub use hp6632b::Hp6632b;
pub use hp8954a::Hp8954a;
pub use marconi_2019::Marconi2019;
pub use orx_402a::Orx402a;

use crate::adapters::{open_transport, DummyTransport};
use crate::config::{InstrumentDefinition, InstrumentModel, Settings, TimeoutSettings, TransportConfig};
use crate::error::{InstrError, InstrResult, TransportError};
use futures::future::join_all;
use tracing::{debug, info};

/// A configured driver of any supported model.
#[derive(Debug)]
pub enum AnyInstrument {
    /// OR-X 402A waveform generator.
    Orx402a(Orx402a),
    /// Marconi 2019 signal generator.
    Marconi2019(Marconi2019),
    /// HP 3457A multimeter.
    Hp3457a(Hp3457a),
    /// HP 34401A multimeter.
    Hp34401a(Hp34401a),
    /// HP 6632B power supply.
    Hp6632b(Hp6632b),
    /// HP 8954A transceiver interface.
    Hp8954a(Hp8954a),
}

impl AnyInstrument {
    /// Lifecycle view of the driver.
    pub fn as_instrument(&self) -> &dyn Instrument {
        match self {
            AnyInstrument::Orx402a(i) => i,
            AnyInstrument::Marconi2019(i) => i,
            AnyInstrument::Hp3457a(i) => i,
            AnyInstrument::Hp34401a(i) => i,
            AnyInstrument::Hp6632b(i) => i,
            AnyInstrument::Hp8954a(i) => i,
        }
    }

    /// Configured model.
    pub fn model(&self) -> InstrumentModel {
        match self {
            AnyInstrument::Orx402a(_) => InstrumentModel::Orx402a,
            AnyInstrument::Marconi2019(_) => InstrumentModel::Marconi2019,
            AnyInstrument::Hp3457a(_) => InstrumentModel::Hp3457a,
            AnyInstrument::Hp34401a(_) => InstrumentModel::Hp34401a,
            AnyInstrument::Hp6632b(_) => InstrumentModel::Hp6632b,
            AnyInstrument::Hp8954a(_) => InstrumentModel::Hp8954a,
        }
    }

    /// Instrument name (the configured id).
    pub fn name(&self) -> &str {
        self.as_instrument().name()
    }

    /// Signal generator view, if the model is one.
    pub fn as_signal_source(&self) -> Option<&dyn SignalSource> {
        match self {
            AnyInstrument::Orx402a(i) => Some(i),
            AnyInstrument::Marconi2019(i) => Some(i),
            _ => None,
        }
    }

    /// Voltmeter view, if the model measures voltage.
    pub fn as_voltmeter(&self) -> Option<&dyn Measures<Voltage>> {
        match self {
            AnyInstrument::Hp3457a(i) => Some(i),
            AnyInstrument::Hp34401a(i) => Some(i),
            AnyInstrument::Hp6632b(i) => Some(i),
            _ => None,
        }
    }

    /// Ammeter view, if the model measures current.
    pub fn as_ammeter(&self) -> Option<&dyn Measures<Current>> {
        match self {
            AnyInstrument::Hp3457a(i) => Some(i),
            AnyInstrument::Hp34401a(i) => Some(i),
            AnyInstrument::Hp6632b(i) => Some(i),
            _ => None,
        }
    }

    /// Power supply view, if the model is one.
    pub fn as_power_supply(&self) -> Option<&dyn PowerSupply> {
        match self {
            AnyInstrument::Hp6632b(i) => Some(i),
            _ => None,
        }
    }
}

/// Builds the driver for `definition`. The transport is created but not
/// opened; call [`Instrument::connect`] on the result.
pub fn build(definition: &InstrumentDefinition, timeouts: &TimeoutSettings) -> InstrResult<AnyInstrument> {
    let id = definition.id.clone();
    let instrument = if let TransportConfig::Dummy = definition.transport {
        debug!(instrument = %id, model = ?definition.model, "Building dummy instrument");
        let transport = DummyTransport::new();
        match definition.model {
            InstrumentModel::Orx402a => {
                AnyInstrument::Orx402a(Orx402a::dummy(id, transport).with_timeouts(timeouts))
            }
            InstrumentModel::Marconi2019 => {
                AnyInstrument::Marconi2019(Marconi2019::dummy(id, transport))
            }
            InstrumentModel::Hp3457a => AnyInstrument::Hp3457a(
                Hp3457a::dummy(id, transport)
                    .with_reset_after_connect(definition.reset_after_connect),
            ),
            InstrumentModel::Hp34401a => AnyInstrument::Hp34401a(Hp34401a::dummy(id, transport)),
            InstrumentModel::Hp6632b => AnyInstrument::Hp6632b(Hp6632b::dummy(id, transport)),
            InstrumentModel::Hp8954a => AnyInstrument::Hp8954a(Hp8954a::dummy(id, transport)),
        }
    } else {
        let transport = open_transport(&definition.transport, timeouts).map_err(|e| {
            InstrError::Transport {
                instrument: id.clone(),
                source: TransportError::Connect(e),
            }
        })?;
        match definition.model {
            InstrumentModel::Orx402a => {
                AnyInstrument::Orx402a(Orx402a::new(id, transport).with_timeouts(timeouts))
            }
            InstrumentModel::Marconi2019 => {
                AnyInstrument::Marconi2019(Marconi2019::new(id, transport))
            }
            InstrumentModel::Hp3457a => AnyInstrument::Hp3457a(
                Hp3457a::new(id, transport)
                    .with_reset_after_connect(definition.reset_after_connect),
            ),
            InstrumentModel::Hp34401a => AnyInstrument::Hp34401a(Hp34401a::new(id, transport)),
            InstrumentModel::Hp6632b => AnyInstrument::Hp6632b(Hp6632b::new(id, transport)),
            InstrumentModel::Hp8954a => AnyInstrument::Hp8954a(Hp8954a::new(id, transport)),
        }
    };
    if definition.reset_after_connect && definition.model != InstrumentModel::Hp3457a {
        debug!(instrument = %definition.id, "reset_after_connect is only supported by the HP 3457A");
    }
    Ok(instrument)
}

/// Builds every enabled instrument of `settings`, in file order.
pub fn build_all(settings: &Settings) -> InstrResult<Vec<AnyInstrument>> {
    let instruments = settings
        .enabled_instruments()
        .into_iter()
        .map(|definition| build(definition, &settings.timeouts))
        .collect::<InstrResult<Vec<_>>>()?;
    info!(count = instruments.len(), "Instruments built");
    Ok(instruments)
}

/// Connects every instrument concurrently. Results are in input order; one
/// failing handshake does not stop the others.
pub async fn connect_all(instruments: &[AnyInstrument]) -> Vec<InstrResult<()>> {
    join_all(instruments.iter().map(|i| i.as_instrument().connect())).await
}
