//! Offline transport
//!
//! `DummyTransport` stands in for a real link when an instrument runs in
//! substitution mode, and doubles as the test harness for the drivers:
//! - Every sent command is logged with the instant it reached the "wire"
//! - Replies are scripted (queue) or computed from the last command
//! - Failures can be injected for the next connect, send or receive
//!
//! Clones share state, so a test keeps one handle while the session owns
//! another.

use super::{GpibAdapterCommand, Transport};
use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    /// Next `connect`.
    Connect,
    /// Next `send`.
    Send,
    /// Next `receive` or `receive_raw`.
    Receive,
}

/// A command as it reached the dummy link.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    /// Command text without terminator.
    pub command: String,
    /// When it was written.
    pub at: Instant,
}

#[derive(Default)]
struct DummyState {
    connected: bool,
    sent: Vec<SentCommand>,
    replies: VecDeque<String>,
    raw: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    adapter_commands: Vec<GpibAdapterCommand>,
    fail_next: Vec<FailPoint>,
    io_calls: usize,
}

/// Shared-handle offline transport.
#[derive(Clone, Default)]
pub struct DummyTransport {
    state: Arc<Mutex<DummyState>>,
}

impl std::fmt::Debug for DummyTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DummyTransport")
            .field("connected", &state.connected)
            .field("sent", &state.sent.len())
            .field("pending_replies", &state.replies.len())
            .finish()
    }
}

impl DummyTransport {
    /// New unconnected dummy link with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a reply line for the next `receive`.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.state.lock().replies.push_back(reply.into());
    }

    /// Queues raw bytes for the next `receive_raw`.
    pub fn push_raw(&self, bytes: impl Into<Vec<u8>>) {
        self.state.lock().raw.push_back(bytes.into());
    }

    /// Computes replies from the last sent command once the queue is empty.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    /// Makes the next call of the given kind fail.
    pub fn fail_next(&self, point: FailPoint) {
        self.state.lock().fail_next.push(point);
    }

    /// Commands sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|s| s.command.clone())
            .collect()
    }

    /// Commands sent so far, with timestamps.
    pub fn sent_log(&self) -> Vec<SentCommand> {
        self.state.lock().sent.clone()
    }

    /// Most recent command.
    pub fn last_sent(&self) -> Option<String> {
        self.state.lock().sent.last().map(|s| s.command.clone())
    }

    /// Forgets the command log and the I/O call counter.
    pub fn clear_sent(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.io_calls = 0;
    }

    /// Number of send/receive calls that reached the link.
    pub fn io_calls(&self) -> usize {
        self.state.lock().io_calls
    }

    /// Adapter commands received so far.
    pub fn adapter_commands(&self) -> Vec<GpibAdapterCommand> {
        self.state.lock().adapter_commands.clone()
    }

    /// Scripted replies not consumed yet.
    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    /// True between `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn take_failure(state: &mut DummyState, point: FailPoint) -> bool {
        match state.fail_next.iter().position(|p| *p == point) {
            Some(i) => {
                state.fail_next.remove(i);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for DummyTransport {
    fn address(&self) -> &str {
        "dummy"
    }

    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if Self::take_failure(&mut state, FailPoint::Connect) {
            bail!("Injected connect failure");
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.io_calls += 1;
        if Self::take_failure(&mut state, FailPoint::Send) {
            bail!("Injected send failure");
        }
        if !state.connected {
            bail!("Dummy link is not open");
        }
        state.sent.push(SentCommand {
            command: command.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.io_calls += 1;
        if Self::take_failure(&mut state, FailPoint::Receive) {
            bail!("Injected receive failure");
        }
        if let Some(reply) = state.replies.pop_front() {
            return Ok(Some(reply));
        }
        let last = state.sent.last().map(|s| s.command.clone());
        Ok(match (&state.responder, last) {
            (Some(responder), Some(command)) => responder(&command),
            _ => None,
        })
    }

    async fn receive_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.io_calls += 1;
        if Self::take_failure(&mut state, FailPoint::Receive) {
            bail!("Injected receive failure");
        }
        match state.raw.pop_front() {
            Some(mut bytes) => {
                bytes.resize(count, 0);
                Ok(bytes)
            }
            None => bail!("No raw bytes scripted"),
        }
    }

    async fn adapter_command(&mut self, command: GpibAdapterCommand) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.adapter_commands.push(command);
        Ok(if command.is_query() {
            state.replies.pop_front()
        } else {
            None
        })
    }
}
