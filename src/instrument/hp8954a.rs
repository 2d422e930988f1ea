//! HP 8954A transceiver interface
//!
//! An RF switch with a transmit key, transmit/receive path selection, two RF
//! monitor outputs and sixteen auxiliary relays. Apart from its identity the
//! unit cannot be queried, so every setting is remembered locally after it has
//! been written.

use super::capabilities::Instrument;
use crate::adapters::{DummyTransport, Transport};
use crate::error::{InstrError, InstrResult};
use crate::protocol::EncodedCommand;
use crate::session::{Handshake, Link, Session, SessionCore};
use async_trait::async_trait;

/// Prefix of the `ID` reply.
pub const EXPECTED_ID: &str = "8954A";

const RELAY_TOKENS: &[char] = &[
    '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G',
];

/// Signal path through the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Path {
    /// Receive path.
    #[default]
    Receive,
    /// Transmit path.
    Transmit,
}

/// RF monitor output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfMonitor {
    /// Monitor 1 (`F1`).
    Mon1,
    /// Monitor 2 (`F2`).
    Mon2,
}

/// One auxiliary relay, A2K1 to A2K16, addressed as `1`-`9` and `A`-`G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AuxRelay(usize);

impl AuxRelay {
    /// Relay for a front-panel token (case-insensitive).
    pub fn parse(token: char) -> InstrResult<Self> {
        let upper = token.to_ascii_uppercase();
        RELAY_TOKENS
            .iter()
            .position(|&t| t == upper)
            .map(AuxRelay)
            .ok_or_else(|| {
                InstrError::Construction(format!(
                    "auxiliary relay '{}' does not exist (expected 1-9 or A-G)",
                    token
                ))
            })
    }

    /// Every auxiliary relay in address order.
    pub fn all() -> impl Iterator<Item = AuxRelay> {
        (0..RELAY_TOKENS.len()).map(AuxRelay)
    }

    /// Wire token.
    pub fn token(&self) -> char {
        RELAY_TOKENS[self.0]
    }
}

/// Everything written to the switch so far.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SwitchState {
    /// Transmit key on.
    pub transmit_key: bool,
    /// Selected path.
    pub path: Path,
    /// Selected RF monitor, if one was chosen.
    pub rf_monitor: Option<RfMonitor>,
    /// Open state of each auxiliary relay, indexed like [`AuxRelay::all`].
    pub relays_open: [bool; 16],
}

#[async_trait]
impl Handshake for SwitchState {
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
        let id = core.query(&EncodedCommand::new("ID")).await?;
        if !id.trim_start().starts_with(EXPECTED_ID) {
            return Err(InstrError::WrongDevice {
                instrument: core.name().to_string(),
                expected: EXPECTED_ID.to_string(),
                actual: id.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// HP 8954A driver.
#[derive(Debug)]
pub struct Hp8954a {
    session: Session<SwitchState>,
}

impl Hp8954a {
    /// Driver over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self {
            session: Session::new(name, transport, SwitchState::default()),
        }
    }

    /// Offline driver; commands are recorded on `transport`.
    pub fn dummy(name: impl Into<String>, transport: DummyTransport) -> Self {
        Self {
            session: Session::dummy_with(name, Box::new(transport), SwitchState::default()),
        }
    }

    async fn write<F>(&self, command: &str, apply: F) -> InstrResult<()>
    where
        F: FnOnce(&mut SwitchState) + Send,
    {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        core.send(&EncodedCommand::new(command)).await?;
        apply(state);
        Ok(())
    }

    /// Keys the transmitter; this also selects the transmit path.
    pub async fn transmit_key_on(&self) -> InstrResult<()> {
        self.write("K1", |s| {
            s.transmit_key = true;
            s.path = Path::Transmit;
        })
        .await
    }

    /// Releases the transmit key.
    pub async fn transmit_key_off(&self) -> InstrResult<()> {
        self.write("K0", |s| s.transmit_key = false).await
    }

    /// Selects the transmit path without keying.
    pub async fn transmit_mode(&self) -> InstrResult<()> {
        self.write("XM", |s| s.path = Path::Transmit).await
    }

    /// Selects the receive path; the transmit key drops.
    pub async fn receive_mode(&self) -> InstrResult<()> {
        self.write("RC", |s| {
            s.transmit_key = false;
            s.path = Path::Receive;
        })
        .await
    }

    /// Routes the selected RF monitor output.
    pub async fn select_rf_monitor(&self, monitor: RfMonitor) -> InstrResult<()> {
        let command = match monitor {
            RfMonitor::Mon1 => "F1",
            RfMonitor::Mon2 => "F2",
        };
        self.write(command, |s| s.rf_monitor = Some(monitor)).await
    }

    /// Opens (`V<r>`) or closes (`U<r>`) one auxiliary relay.
    pub async fn set_aux_relay(&self, relay: AuxRelay, open: bool) -> InstrResult<()> {
        self.set_aux_relays(&[(relay, open)]).await
    }

    /// Sets several relays in order without releasing the session in between.
    pub async fn set_aux_relays(&self, relays: &[(AuxRelay, bool)]) -> InstrResult<()> {
        let mut guard = self.session.lock().await;
        let Link { core, state } = &mut *guard;
        for &(relay, open) in relays {
            let verb = if open { 'V' } else { 'U' };
            core.send(&EncodedCommand::new(format!("{}{}", verb, relay.token())))
                .await?;
            state.relays_open[relay.0] = open;
        }
        Ok(())
    }

    /// Snapshot of what has been written.
    pub async fn state(&self) -> SwitchState {
        self.session.lock().await.state.clone()
    }
}

#[async_trait]
impl Instrument for Hp8954a {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_tokens() {
        assert_eq!(AuxRelay::parse('7').unwrap().token(), '7');
        assert_eq!(AuxRelay::parse('c').unwrap().token(), 'C');
        assert_eq!(AuxRelay::all().count(), 16);
        assert!(matches!(
            AuxRelay::parse('0'),
            Err(InstrError::Construction(_))
        ));
        assert!(AuxRelay::parse('H').is_err());
    }

    #[tokio::test]
    async fn state_is_tracked_per_instance() {
        let first = Hp8954a::dummy("sw1", DummyTransport::new());
        let second = Hp8954a::dummy("sw2", DummyTransport::new());
        first.connect().await.unwrap();
        second.connect().await.unwrap();

        first.transmit_key_on().await.unwrap();
        first
            .set_aux_relay(AuxRelay::parse('A').unwrap(), true)
            .await
            .unwrap();

        let state = first.state().await;
        assert!(state.transmit_key);
        assert_eq!(state.path, Path::Transmit);
        assert!(state.relays_open[9]);
        assert_eq!(second.state().await, SwitchState::default());
    }
}
