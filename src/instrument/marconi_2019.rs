//! Marconi Instruments 2019 signal generator
//!
//! The 2019 has no identification or per-parameter queries. Whenever it is
//! addressed to talk it sends a 42-character state record:
//!
//! ```text
//! AAAAAAAAAA BBBBBBBB CC DDDDDD EE FF GG PRSTUVWXYZ
//! 0104000000 00000000 00 006021 06 08 02 0000000000
//! ```
//!
//! carrier frequency (deca-Hz), FM deviation (deca-Hz), AM depth (percent),
//! RF level (dB relative, three implied decimals), log/linear level units,
//! internal modulation oscillator index, then ten flags. The record is read on
//! connect and again by any getter after a command may have changed it.
//!
//! Setting the RF level switches the output on unless the command carries the
//! `, OF` suffix.

use super::capabilities::{HasOutput, Instrument, SignalSource};
use crate::adapters::{DummyTransport, Transport};
use crate::cache::CachedParameter;
use crate::error::{DecodeError, InstrError, InstrResult, RangeError};
use crate::protocol::state_record::{decode_state, FieldSpec, RecordLayout};
use crate::protocol::units::{
    print, truncate, Band, Notation, Precision, QuantityFormat, Rounding, Unit, UnitTable,
};
use crate::protocol::{EncodedCommand, Limits};
use crate::session::{Handshake, Link, Session, SessionCore};
use async_trait::async_trait;
use tracing::debug;

const CARRIER_LIMITS: Limits = Limits::new("carrier_frequency", 80e3, 1040e6);
const LEVEL_VOLT_LIMITS: Limits = Limits::new("level_volts", 0.1e-6, 1.0);
const LEVEL_DB_LIMITS: Limits = Limits::new("level_db", -127.0, 13.0);
const DEVIATION_LIMITS: Limits = Limits::new("fm_deviation", 10.0, 1e6);
const AM_DEPTH_LIMITS: Limits = Limits::new("am_depth", 0.0, 0.99);

const FREQUENCY_UNITS: UnitTable = UnitTable::largest_first(&[
    Unit::new("HZ", 1.0),
    Unit::new("KZ", 1e3),
    Unit::new("MZ", 1e6),
]);

const CARRIER_FORMAT: QuantityFormat = QuantityFormat {
    units: FREQUENCY_UNITS,
    precision: Precision::Bands(&[Band::new(0.0, 8)]),
    rounding: Rounding::Truncate,
    notation: Notation::Minimal,
};

const LEVEL_FORMAT: QuantityFormat = QuantityFormat {
    units: UnitTable::largest_first(&[
        Unit::new("UV", 1e-6),
        Unit::new("MV", 1e-3),
        Unit::new("VL", 1.0),
    ]),
    precision: Precision::Bands(&[
        Band::new(200.0, 0),
        Band::new(20.0, 1),
        Band::new(2.0, 2),
        Band::new(1.0, 3),
        Band::new(0.0, 2),
    ]),
    rounding: Rounding::Truncate,
    notation: Notation::Minimal,
};

const DEVIATION_FORMAT: QuantityFormat = QuantityFormat {
    units: FREQUENCY_UNITS,
    precision: Precision::Bands(&[Band::new(100.0, 0), Band::new(10.0, 1), Band::new(0.0, 2)]),
    rounding: Rounding::Truncate,
    notation: Notation::Minimal,
};

/// Length of the state record.
pub const STATE_RECORD_LENGTH: usize = 42;

/// Valid internal oscillator indices.
const OSCILLATOR_INDICES: &[u32] = &[0, 1, 2, 3, 4];

/// Positional layout of the state record.
pub const STATE_LAYOUT: RecordLayout = RecordLayout {
    fields: &[
        FieldSpec::scaled("carrier_hz", 10, 1),
        FieldSpec::scaled("fm_deviation_hz", 8, 1),
        FieldSpec::scaled("am_depth", 2, -2),
        FieldSpec::scaled("rf_level_rel_db", 6, -3),
        FieldSpec::scaled("rf_level_log_unit", 2, 0),
        FieldSpec::scaled("rf_level_lin_unit", 2, 0),
        FieldSpec::index("mod_oscillator", 2, OSCILLATOR_INDICES),
    ],
    flags: &[
        "fm_on",
        "ext_fm_source",
        "fm_alc_on",
        "am_on",
        "ext_am_source",
        "am_alc_on",
        "pulse_mod_on",
        "carrier_on",
        "ext_standard",
        "offset_on",
    ],
};

/// Internal modulation oscillator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oscillator {
    /// 300 Hz.
    F300,
    /// 400 Hz.
    F400,
    /// 1 kHz.
    F1k,
    /// 3 kHz.
    F3k,
    /// 6 kHz.
    F6k,
}

impl Oscillator {
    /// Index used on the wire and in the state record.
    pub fn index(&self) -> u32 {
        match self {
            Oscillator::F300 => 0,
            Oscillator::F400 => 1,
            Oscillator::F1k => 2,
            Oscillator::F3k => 3,
            Oscillator::F6k => 4,
        }
    }

    /// Oscillator for a state-record index.
    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Oscillator::F300),
            1 => Some(Oscillator::F400),
            2 => Some(Oscillator::F1k),
            3 => Some(Oscillator::F3k),
            4 => Some(Oscillator::F6k),
            _ => None,
        }
    }

    /// Oscillator frequency in Hz.
    pub fn hz(&self) -> f64 {
        match self {
            Oscillator::F300 => 300.0,
            Oscillator::F400 => 400.0,
            Oscillator::F1k => 1000.0,
            Oscillator::F3k => 3000.0,
            Oscillator::F6k => 6000.0,
        }
    }
}

/// Where the modulating signal comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModulationSource {
    /// One of the internal oscillators.
    Internal(Oscillator),
    /// The external modulation input.
    External,
}

/// Modulation currently being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModulationKind {
    /// Frequency modulation.
    Fm,
    /// Amplitude modulation.
    #[default]
    Am,
}

impl ModulationKind {
    fn verb(&self) -> &'static str {
        match self {
            ModulationKind::Fm => "FM",
            ModulationKind::Am => "AM",
        }
    }
}

/// RF output level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Level {
    /// EMF in volts.
    Volts(f64),
    /// Decibels.
    Db(f64),
}

fn output_suffix(keep_output_off: bool) -> &'static str {
    if keep_output_off {
        ", OF"
    } else {
        ""
    }
}

/// `CF <v> <HZ|KZ|MZ>`.
pub fn encode_carrier(hz: f64) -> Result<EncodedCommand, RangeError> {
    CARRIER_LIMITS.check(hz)?;
    let rendered = CARRIER_FORMAT.render(hz);
    Ok(EncodedCommand::new(format!(
        "CF {} {}",
        rendered.digits, rendered.unit.token
    )))
}

/// `LV <v> <UV|MV|VL>` or `LV <n> DB`, optionally keeping the output off.
pub fn encode_level(level: Level, keep_output_off: bool) -> Result<EncodedCommand, RangeError> {
    let suffix = output_suffix(keep_output_off);
    let text = match level {
        Level::Volts(volts) => {
            LEVEL_VOLT_LIMITS.check(volts)?;
            let rendered = LEVEL_FORMAT.render(volts);
            // The output flag goes between number and unit on this dialect.
            format!("LV {}{} {}", rendered.digits, suffix, rendered.unit.token)
        }
        Level::Db(db) => {
            LEVEL_DB_LIMITS.check(db)?;
            // Levels in (-1, 0] truncate to negative zero, which must go out as "0".
            let whole = print(truncate(db, 0), 0, Notation::Minimal);
            format!("LV {} DB{}", whole, suffix)
        }
    };
    Ok(EncodedCommand::new(text))
}

/// `FM <v> <unit>`.
pub fn encode_fm(deviation_hz: f64) -> Result<EncodedCommand, RangeError> {
    DEVIATION_LIMITS.check(deviation_hz)?;
    let rendered = DEVIATION_FORMAT.render(deviation_hz);
    Ok(EncodedCommand::new(format!(
        "FM {} {}",
        rendered.digits, rendered.unit.token
    )))
}

/// `AM <percent> PC` for a modulation depth in [0, 0.99].
pub fn encode_am(depth: f64) -> Result<EncodedCommand, RangeError> {
    AM_DEPTH_LIMITS.check(depth)?;
    Ok(EncodedCommand::new(format!(
        "AM {} PC",
        truncate(depth * 100.0, 0)
    )))
}

/// `FM|AM IT, M<n>` or `FM|AM XT`.
pub fn encode_modulation_source(kind: ModulationKind, source: ModulationSource) -> EncodedCommand {
    EncodedCommand::new(match source {
        ModulationSource::Internal(osc) => format!("{} IT, M{}", kind.verb(), osc.index()),
        ModulationSource::External => format!("{} XT", kind.verb()),
    })
}

/// Decoded state record.
#[derive(Debug, Clone, PartialEq)]
pub struct MarconiStatus {
    /// Carrier frequency in Hz.
    pub carrier_hz: f64,
    /// FM deviation in Hz.
    pub fm_deviation_hz: f64,
    /// AM depth, 0 to 0.99.
    pub am_depth: f64,
    /// RF level in dB relative to half the minimum level.
    pub rf_level_rel_db: f64,
    /// Logarithmic level unit code (0-6).
    pub rf_level_log_unit: u32,
    /// Linear level unit code.
    pub rf_level_lin_unit: u32,
    /// Internal oscillator; `None` when the record holds an invalid index.
    pub oscillator: Option<Oscillator>,
    /// FM on.
    pub fm_on: bool,
    /// External FM source selected.
    pub ext_fm_source: bool,
    /// FM ALC on.
    pub fm_alc_on: bool,
    /// AM on.
    pub am_on: bool,
    /// External AM source selected.
    pub ext_am_source: bool,
    /// AM ALC on.
    pub am_alc_on: bool,
    /// Pulse modulation on.
    pub pulse_mod_on: bool,
    /// Carrier (RF output) on.
    pub carrier_on: bool,
    /// External frequency standard selected.
    pub ext_standard: bool,
    /// Level offset on.
    pub offset_on: bool,
}

impl MarconiStatus {
    /// Decodes a raw state record.
    pub fn decode(record: &str) -> Result<Self, DecodeError> {
        let state = decode_state(record, &STATE_LAYOUT)?;
        let number = |name: &str| {
            state
                .number(name)
                .ok_or_else(|| DecodeError::malformed(record, format!("missing field {}", name)))
        };
        let flag = |name: &str| {
            state
                .flag(name)
                .ok_or_else(|| DecodeError::malformed(record, format!("missing flag {}", name)))
        };
        Ok(Self {
            carrier_hz: number("carrier_hz")?,
            fm_deviation_hz: number("fm_deviation_hz")?,
            am_depth: number("am_depth")?,
            rf_level_rel_db: number("rf_level_rel_db")?,
            rf_level_log_unit: number("rf_level_log_unit")? as u32,
            rf_level_lin_unit: number("rf_level_lin_unit")? as u32,
            oscillator: state.index("mod_oscillator").and_then(Oscillator::from_index),
            fm_on: flag("fm_on")?,
            ext_fm_source: flag("ext_fm_source")?,
            fm_alc_on: flag("fm_alc_on")?,
            am_on: flag("am_on")?,
            ext_am_source: flag("ext_am_source")?,
            am_alc_on: flag("am_alc_on")?,
            pulse_mod_on: flag("pulse_mod_on")?,
            carrier_on: flag("carrier_on")?,
            ext_standard: flag("ext_standard")?,
            offset_on: flag("offset_on")?,
        })
    }

    /// Modulation source the record reports for `kind`.
    pub fn modulation_source(&self, kind: ModulationKind) -> Option<ModulationSource> {
        let external = match kind {
            ModulationKind::Fm => self.ext_fm_source,
            ModulationKind::Am => self.ext_am_source,
        };
        if external {
            Some(ModulationSource::External)
        } else {
            self.oscillator.map(ModulationSource::Internal)
        }
    }
}

/// Driver-private state: the last record plus what cannot be read back.
#[derive(Debug)]
pub struct MarconiState {
    status: CachedParameter<Option<MarconiStatus>>,
    level: Option<Level>,
    modulation: ModulationKind,
}

impl Default for MarconiState {
    fn default() -> Self {
        Self {
            status: CachedParameter::unconfirmed(None),
            level: None,
            modulation: ModulationKind::default(),
        }
    }
}

async fn read_record(core: &mut SessionCore) -> InstrResult<MarconiStatus> {
    let record = core.receive().await?;
    Ok(MarconiStatus::decode(&record)?)
}

#[async_trait]
impl Handshake for MarconiState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        let status = read_record(core).await?;
        debug!(instrument = %core.name(), carrier_hz = status.carrier_hz, "State record received");
        self.status.confirm(Some(status));
        Ok(())
    }
}

/// Marconi 2019 driver.
#[derive(Debug)]
pub struct Marconi2019 {
    session: Session<MarconiState>,
}

impl Marconi2019 {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(name, transport, MarconiState::default()),
        }
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self {
            session: Session::dummy_with(name, Box::new(transport), MarconiState::default()),
        }
    }

    async fn write<F>(&self, command: EncodedCommand, record: F) -> InstrResult<()>
    where
        F: FnOnce(&mut MarconiState) + Send,
    {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        state.status.invalidate();
        record(state);
        core.send(&command).await
    }

    /// Current state record, read from the instrument when stale.
    pub async fn status(&self) -> InstrResult<MarconiStatus> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        let status = state
            .status
            .get_or_refresh(move || async move { read_record(core).await.map(Some) })
            .await?;
        status.ok_or_else(|| InstrError::NotConnected(self.session.name().to_string()))
    }

    /// Sets the carrier frequency in Hz.
    pub async fn set_frequency(&self, hz: f64) -> InstrResult<()> {
        self.write(encode_carrier(hz)?, |_| {}).await
    }

    /// Carrier frequency in Hz, from the state record.
    pub async fn frequency(&self) -> InstrResult<f64> {
        Ok(self.status().await?.carrier_hz)
    }

    /// Sets the RF level. Unless `keep_output_off` is set this also switches
    /// the output on.
    pub async fn set_level(&self, level: Level, keep_output_off: bool) -> InstrResult<()> {
        let command = encode_level(level, keep_output_off)?;
        self.write(command, |s| s.level = Some(level)).await
    }

    /// Last commanded RF level; the instrument cannot report it in these units.
    pub async fn level(&self) -> Option<Level> {
        self.session.lock().await.state.level
    }

    /// Enables FM with `deviation_hz` and makes FM the modulation being
    /// configured.
    pub async fn set_fm(&self, deviation_hz: f64) -> InstrResult<()> {
        let command = encode_fm(deviation_hz)?;
        self.write(command, |s| s.modulation = ModulationKind::Fm)
            .await
    }

    /// Enables AM with modulation `depth` (0 to 0.99).
    pub async fn set_am(&self, depth: f64) -> InstrResult<()> {
        let command = encode_am(depth)?;
        self.write(command, |s| s.modulation = ModulationKind::Am)
            .await
    }

    /// Selects the source of the active modulation.
    pub async fn set_modulation_source(&self, source: ModulationSource) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        let command = encode_modulation_source(state.modulation, source);
        state.status.invalidate();
        core.send(&command).await
    }

    /// Source of the active modulation, from the state record.
    pub async fn modulation_source(&self) -> InstrResult<Option<ModulationSource>> {
        let kind = self.session.lock().await.state.modulation;
        Ok(self.status().await?.modulation_source(kind))
    }

    /// Switches ALC for the active modulation.
    pub async fn set_alc(&self, on: bool) -> InstrResult<()> {
        let command = EncodedCommand::new(if on { "A1" } else { "A0" });
        self.write(command, |_| {}).await
    }

    /// ALC state of the active modulation, from the state record.
    pub async fn alc(&self) -> InstrResult<bool> {
        let kind = self.session.lock().await.state.modulation;
        let status = self.status().await?;
        Ok(match kind {
            ModulationKind::Fm => status.fm_alc_on,
            ModulationKind::Am => status.am_alc_on,
        })
    }
}

#[async_trait]
impl Instrument for Marconi2019 {
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
impl HasOutput for Marconi2019 {
    async fn enable_output(&self) -> InstrResult<()> {
        self.write(EncodedCommand::new("LV ON"), |_| {}).await
    }

    async fn disable_output(&self) -> InstrResult<()> {
        self.write(EncodedCommand::new("LV OF"), |_| {}).await
    }

    async fn output_enabled(&self) -> InstrResult<bool> {
        Ok(self.status().await?.carrier_on)
    }
}

#[async_trait]
impl SignalSource for Marconi2019 {
    async fn set_frequency(&self, hz: f64) -> InstrResult<()> {
        Marconi2019::set_frequency(self, hz).await
    }

    async fn frequency(&self) -> InstrResult<f64> {
        Marconi2019::frequency(self).await
    }

    async fn set_amplitude(&self, volts: f64) -> InstrResult<()> {
        self.set_level(Level::Volts(volts), false).await
    }

    async fn amplitude(&self) -> InstrResult<f64> {
        match self.level().await {
            Some(Level::Volts(volts)) => Ok(volts),
            Some(Level::Db(_)) => Err(InstrError::Construction(
                "RF level was last set in dB, not volts".to_string(),
            )),
            None => Err(InstrError::Construction(
                "RF level has not been set".to_string(),
            )),
        }
    }
}
