//! Minimum spacing between commands to rate-limited instruments.
//!
//! Some instruments drop or garble commands that arrive too quickly after the
//! previous one. A [`DispatchGate`] holds a single permit: sending takes it and
//! a background task gives it back once the interval has elapsed, so two
//! commands admitted through the same gate are always at least one interval
//! apart. Waiting for the permit is bounded; when the bound is hit the caller
//! proceeds anyway and the event is logged.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::warn;

/// Outcome of waiting at the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The gate was clear (and, for sends, a new blackout started).
    Granted,
    /// The wait bound elapsed; the caller proceeds best-effort.
    TimedOut,
}

/// Single-permit gate with timed release.
#[derive(Debug, Clone)]
pub struct DispatchGate {
    token: Arc<Semaphore>,
    interval: Duration,
    send_wait: Duration,
    read_wait: Duration,
}

impl DispatchGate {
    /// Gate enforcing `interval` between sends.
    ///
    /// `send_wait` bounds how long a send waits for the permit, `read_wait`
    /// how long a read waits for the gate to clear.
    pub fn new(interval: Duration, send_wait: Duration, read_wait: Duration) -> Self {
        Self {
            token: Arc::new(Semaphore::new(1)),
            interval,
            send_wait,
            read_wait,
        }
    }

    /// Minimum spacing between sends.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True when a send would be admitted immediately.
    pub fn is_clear(&self) -> bool {
        self.token.available_permits() > 0
    }

    /// Waits for the permit and starts a new blackout interval.
    ///
    /// A send admitted after the wait bound still gets its own blackout: the
    /// permit is taken as soon as the previous interval ends and held until
    /// one interval after this send.
    pub async fn admit(&self) -> Admission {
        let sent_at = Instant::now();
        match tokio::time::timeout(self.send_wait, self.token.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                let interval = self.interval;
                tokio::spawn(async move {
                    tokio::time::sleep(interval).await;
                    drop(permit);
                });
                Admission::Granted
            }
            // The semaphore is never closed; treat it like a timeout.
            Ok(Err(_)) | Err(_) => {
                warn!(
                    wait_ms = self.send_wait.as_millis() as u64,
                    "Dispatch gate still blocked, sending anyway"
                );
                let token = self.token.clone();
                let release_at = sent_at + self.send_wait + self.interval;
                tokio::spawn(async move {
                    if let Ok(permit) = token.acquire_owned().await {
                        tokio::time::sleep_until(release_at).await;
                        drop(permit);
                    }
                });
                Admission::TimedOut
            }
        }
    }

    /// Waits for the gate to clear without starting a blackout.
    pub async fn await_clear(&self) -> Admission {
        match tokio::time::timeout(self.read_wait, self.token.acquire()).await {
            Ok(Ok(_permit)) => Admission::Granted,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    wait_ms = self.read_wait.as_millis() as u64,
                    "Dispatch gate still blocked, reading anyway"
                );
                Admission::TimedOut
            }
        }
    }
}
