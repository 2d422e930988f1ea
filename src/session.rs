//! Instrument session: one transport, one lock, one connected flag.
//!
//! A [`Session`] owns exactly one [`Transport`] together with the driver's
//! private state (cached parameters and the like). Both sit behind a single
//! async mutex as a [`Link`], so a command and the reply it expects are never
//! interleaved with another caller's traffic on the same instrument. Composite
//! operations (configure, trigger, read) take the lock once and run every step
//! through the same guard.
//!
//! Commands are refused while the session is disconnected, except from inside
//! the connect handshake. Sessions in dummy mode connect without a handshake and
//! are backed by a [`DummyTransport`].

use crate::adapters::{DummyTransport, GpibAdapterCommand, Transport};
use crate::cache::CachedParameter;
use crate::dispatch::DispatchGate;
use crate::error::{DecodeError, InstrError, InstrResult, TransportError};
use crate::protocol::EncodedCommand;
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

/// Transport, gate and lifecycle flags of a session.
pub struct SessionCore {
    name: String,
    transport: Box<dyn Transport>,
    connected: bool,
    handshaking: bool,
    dummy: bool,
    gate: Option<DispatchGate>,
}

impl SessionCore {
    /// Friendly instrument name used in logs and errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the handshake succeeded (or immediately in dummy mode).
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// True for offline substitution.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Gate applied to every send, if the instrument is rate-limited.
    pub fn gate(&self) -> Option<&DispatchGate> {
        self.gate.as_ref()
    }

    fn ensure_open(&self) -> InstrResult<()> {
        if self.connected || self.handshaking {
            Ok(())
        } else {
            Err(InstrError::NotConnected(self.name.clone()))
        }
    }

    fn transport_error(&self, source: TransportError) -> InstrError {
        InstrError::Transport {
            instrument: self.name.clone(),
            source,
        }
    }

    /// Writes one command, waiting at the gate first.
    pub async fn send(&mut self, command: &EncodedCommand) -> InstrResult<()> {
        self.ensure_open()?;
        if let Some(gate) = &self.gate {
            gate.admit().await;
        }
        debug!(instrument = %self.name, command = %command, "Sending command");
        self.transport
            .send(command.as_str())
            .await
            .map_err(|e| self.transport_error(TransportError::Send(e)))
    }

    /// Reads one reply line. No reply before the read timeout is an error.
    pub async fn receive(&mut self) -> InstrResult<String> {
        self.ensure_open()?;
        if let Some(gate) = &self.gate {
            gate.await_clear().await;
        }
        let received = self.transport.receive().await;
        match received {
            Ok(Some(reply)) => {
                trace!(instrument = %self.name, reply = %reply, "Received reply");
                Ok(reply)
            }
            Ok(None) => Err(self.transport_error(TransportError::NoReply)),
            Err(e) => Err(self.transport_error(TransportError::Receive(e))),
        }
    }

    /// Reads exactly `count` raw bytes.
    pub async fn receive_raw(&mut self, count: usize) -> InstrResult<Vec<u8>> {
        self.ensure_open()?;
        if let Some(gate) = &self.gate {
            gate.await_clear().await;
        }
        self.transport
            .receive_raw(count)
            .await
            .map_err(|e| self.transport_error(TransportError::Receive(e)))
    }

    /// Sends `command` and reads its reply line.
    pub async fn query(&mut self, command: &EncodedCommand) -> InstrResult<String> {
        self.send(command).await?;
        self.receive().await
    }

    /// Serves `cache`, querying with `command` and decoding with `parse`
    /// only when it is dirty.
    pub async fn read_cached<T, F>(
        &mut self,
        cache: &mut CachedParameter<T>,
        command: &EncodedCommand,
        parse: F,
    ) -> InstrResult<T>
    where
        T: Clone + Send,
        F: FnOnce(&str) -> Result<T, DecodeError> + Send,
    {
        cache
            .get_or_refresh(move || async move {
                let reply = self.query(command).await?;
                Ok(parse(&reply)?)
            })
            .await
    }

    /// Forwards a control command to a USB-GPIB adapter on the link.
    pub async fn adapter_command(
        &mut self,
        command: GpibAdapterCommand,
    ) -> InstrResult<Option<String>> {
        self.ensure_open()?;
        debug!(instrument = %self.name, command = %command, "Adapter command");
        self.transport
            .adapter_command(command)
            .await
            .map_err(|e| self.transport_error(TransportError::Send(e)))
    }
}

/// The lock-guarded pair of session core and driver state.
pub struct Link<S> {
    /// Transport, gate and flags.
    pub core: SessionCore,
    /// Driver-private state.
    pub state: S,
}

/// Identity check run by [`Session::connect`] after the transport opened.
///
/// Commands sent from here bypass the connected check. Returning an error
/// leaves the session disconnected and closes the transport.
#[async_trait]
pub trait Handshake: Send {
    /// Confirms the instrument's identity and seeds any state.
    async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()>;
}

/// One instrument reached over one exclusively owned transport.
pub struct Session<S> {
    name: String,
    link: Mutex<Link<S>>,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("name", &self.name).finish()
    }
}

impl<S: Send> Session<S> {
    /// Session over `transport`, not yet connected.
    pub fn new(name: impl Into<String>, transport: Box<dyn Transport>, state: S) -> Self {
        Self::build(name.into(), transport, false, state)
    }

    /// Offline session backed by a fresh [`DummyTransport`].
    pub fn dummy(name: impl Into<String>, state: S) -> Self {
        Self::build(name.into(), Box::new(DummyTransport::new()), true, state)
    }

    /// Offline session over a caller-supplied transport (usually a
    /// [`DummyTransport`] clone the caller keeps for inspection).
    pub fn dummy_with(name: impl Into<String>, transport: Box<dyn Transport>, state: S) -> Self {
        Self::build(name.into(), transport, true, state)
    }

    fn build(name: String, transport: Box<dyn Transport>, dummy: bool, state: S) -> Self {
        let core = SessionCore {
            name: name.clone(),
            transport,
            connected: false,
            handshaking: false,
            dummy,
            gate: None,
        };
        Self {
            name,
            link: Mutex::new(Link { core, state }),
        }
    }

    /// Rate-limits every send through `gate`.
    pub fn with_gate(mut self, gate: DispatchGate) -> Self {
        self.link.get_mut().core.gate = Some(gate);
        self
    }

    /// Driver state, for configuration before the session is shared.
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.link.get_mut().state
    }

    /// Friendly instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Takes the session lock for a composite operation.
    pub async fn lock(&self) -> MutexGuard<'_, Link<S>> {
        self.link.lock().await
    }

    /// True once connected.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.core.connected
    }

    /// True for offline substitution.
    pub async fn is_dummy(&self) -> bool {
        self.link.lock().await.core.dummy
    }

    /// Opens the transport and runs the identity handshake.
    ///
    /// Connecting an already connected session is a no-op.
    pub async fn connect(&self) -> InstrResult<()>
    where
        S: Handshake,
    {
        let mut guard = self.link.lock().await;
        let Link { core, state } = &mut *guard;
        if core.connected {
            return Ok(());
        }

        let address = core.transport.address().to_string();
        if let Err(e) = core.transport.connect().await {
            error!(instrument = %core.name, address = %address, error = %e, "Failed to open link");
            return Err(core.transport_error(TransportError::Connect(e)));
        }

        if core.dummy {
            core.connected = true;
            info!(instrument = %core.name, "Connected (dummy mode)");
            return Ok(());
        }

        core.handshaking = true;
        let result = state.handshake(core).await;
        core.handshaking = false;

        match result {
            Ok(()) => {
                core.connected = true;
                info!(instrument = %core.name, address = %address, "Connected");
                Ok(())
            }
            Err(e) => {
                error!(instrument = %core.name, error = %e, "Handshake failed");
                if let Err(close) = core.transport.disconnect().await {
                    debug!(instrument = %core.name, error = %close, "Closing after failed handshake");
                }
                Err(e)
            }
        }
    }

    /// Marks the session disconnected and releases the transport.
    pub async fn disconnect(&self) -> InstrResult<()> {
        let mut guard = self.link.lock().await;
        let core = &mut guard.core;
        let was_connected = core.connected;
        core.connected = false;
        core.transport
            .disconnect()
            .await
            .map_err(|e| core.transport_error(TransportError::Connect(e)))?;
        if was_connected {
            info!(instrument = %core.name, "Disconnected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::dummy::FailPoint;
    use tracing_test::traced_test;

    struct IdentityCheck {
        expect: &'static str,
    }

    #[async_trait]
    impl Handshake for IdentityCheck {
        async fn handshake(&mut self, core: &mut SessionCore) -> InstrResult<()> {
            let reply = core.query(&EncodedCommand::new("ID?")).await?;
            if reply == self.expect {
                Ok(())
            } else {
                Err(InstrError::WrongDevice {
                    instrument: core.name().to_string(),
                    expected: self.expect.to_string(),
                    actual: reply,
                })
            }
        }
    }

    fn session(dummy: &DummyTransport) -> Session<IdentityCheck> {
        Session::new("dmm", Box::new(dummy.clone()), IdentityCheck { expect: "HP3457A" })
    }

    #[tokio::test]
    async fn commands_are_refused_before_connect() {
        let dummy = DummyTransport::new();
        let session = session(&dummy);
        let mut link = session.lock().await;
        let err = link.core.send(&EncodedCommand::new("DCV")).await.unwrap_err();
        assert!(matches!(err, InstrError::NotConnected(name) if name == "dmm"));
        assert_eq!(dummy.io_calls(), 0);
    }

    #[traced_test]
    #[tokio::test]
    async fn handshake_gates_connection() {
        let dummy = DummyTransport::new();
        dummy.push_reply("HP3457A");
        let session = session(&dummy);
        session.connect().await.unwrap();
        assert!(session.is_connected().await);
        assert_eq!(dummy.sent(), vec!["ID?"]);
        assert!(logs_contain("Sending command"));

        // Second connect does nothing.
        session.connect().await.unwrap();
        assert_eq!(dummy.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_handshake_leaves_session_closed() {
        let dummy = DummyTransport::new();
        dummy.push_reply("HP3478A");
        let session = session(&dummy);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, InstrError::WrongDevice { actual, .. } if actual == "HP3478A"));
        assert!(!session.is_connected().await);
        assert!(!dummy.is_connected());
    }

    #[tokio::test]
    async fn missing_reply_is_a_transport_error() {
        let dummy = DummyTransport::new();
        let session = session(&dummy);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            InstrError::Transport {
                source: TransportError::NoReply,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn open_failure_is_reported_as_connect_error() {
        let dummy = DummyTransport::new();
        dummy.fail_next(FailPoint::Connect);
        let session = session(&dummy);
        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            InstrError::Transport {
                source: TransportError::Connect(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn dummy_sessions_skip_the_handshake() {
        let session = Session::dummy("offline", IdentityCheck { expect: "never" });
        session.connect().await.unwrap();
        assert!(session.is_dummy().await);
        let mut link = session.lock().await;
        link.core.send(&EncodedCommand::new("N1")).await.unwrap();
        drop(link);
        session.disconnect().await.unwrap();
        assert!(!session.is_connected().await);
    }
}
