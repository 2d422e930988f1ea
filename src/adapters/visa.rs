//! VISA transport for USB-TMC and GPIB resources.
//!
//! VISA calls block, so every I/O runs on Tokio's blocking pool against a
//! shared handle. Reads are bounded by the VISA timeout set on the resource
//! before each call; an expired read with nothing received is reported as no
//! reply. When the resource is a USB-GPIB adapter (Xyphro firmware),
//! adapter control commands are written to the same handle.
//!
//! Without the `instrument_visa` feature the transport still builds (so
//! configurations can name VISA resources) but refuses to connect.

use super::{GpibAdapterCommand, Transport};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(not(feature = "instrument_visa"))]
use anyhow::bail;
#[cfg(feature = "instrument_visa")]
use anyhow::{anyhow, Context};
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;

#[cfg(feature = "instrument_visa")]
type Handle = Arc<parking_lot::Mutex<visa_rs::Instrument>>;

/// Link to a VISA resource.
pub struct VisaTransport {
    resource: String,
    timeout: Duration,
    gpib_adapter: bool,
    #[cfg(feature = "instrument_visa")]
    handle: Option<Handle>,
}

impl VisaTransport {
    /// Link to `resource` (e.g. `USB0::0x0957::0x0607::MY123::INSTR`).
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(1),
            gpib_adapter: false,
            #[cfg(feature = "instrument_visa")]
            handle: None,
        }
    }

    /// Read timeout for replies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Marks the resource as a USB-GPIB adapter that accepts `!` commands.
    pub fn with_gpib_adapter(mut self, present: bool) -> Self {
        self.gpib_adapter = present;
        self
    }

    /// Read timeout for replies.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// True when adapter commands are forwarded.
    pub fn has_gpib_adapter(&self) -> bool {
        self.gpib_adapter
    }
}

/// True when a VISA I/O error is the resource's own timeout (`VI_ERROR_TMO`).
#[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
fn is_visa_timeout(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::TimedOut || err.to_string().contains("TMO")
}

#[cfg(feature = "instrument_visa")]
mod io {
    use super::{is_visa_timeout, Handle};
    use anyhow::{bail, Context, Result};
    use std::ffi::CString;
    use std::io::{Read, Write};
    use std::sync::Arc;
    use std::time::Duration;
    use visa_rs::prelude::*;

    pub(super) fn open(resource: &str, timeout: Duration) -> Result<Handle> {
        let rm = DefaultRM::new().context("Failed to initialize VISA resource manager")?;
        let c_string = CString::new(resource).context("Failed to create CString")?;
        let visa_string = visa_rs::VisaString::from(c_string);
        let mut instr = rm
            .open(&visa_string, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
            .with_context(|| format!("Failed to open VISA resource: {}", resource))?;
        instr
            .set_timeout(timeout.as_millis() as u32)
            .context("Failed to set VISA timeout")?;
        Ok(Arc::new(parking_lot::Mutex::new(instr)))
    }

    pub(super) fn write(handle: &Handle, payload: &[u8], timeout: Duration) -> Result<()> {
        let mut instr = handle.lock();
        instr
            .set_timeout(timeout.as_millis() as u32)
            .context("Failed to set VISA timeout")?;
        instr
            .write_all(payload)
            .context("Failed to write VISA command")
    }

    /// One reply line, or `None` when the VISA timeout expired before any
    /// byte arrived. The lock is released when the resource gives up.
    pub(super) fn read_line(handle: &Handle, timeout: Duration) -> Result<Option<String>> {
        let mut instr = handle.lock();
        instr
            .set_timeout(timeout.as_millis() as u32)
            .context("Failed to set VISA timeout")?;
        let mut line = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = match instr.read(&mut buf) {
                Ok(n) => n,
                Err(e) if is_visa_timeout(&e) && line.is_empty() => return Ok(None),
                Err(e) if is_visa_timeout(&e) => {
                    bail!("VISA reply cut off after {} bytes by the read timeout", line.len())
                }
                Err(e) => return Err(e).context("Failed to read VISA response"),
            };
            if n == 0 {
                break;
            }
            line.extend_from_slice(&buf[..n]);
            if line.ends_with(b"\n") {
                break;
            }
        }
        Ok(Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\0', '\r', '\n'])
                .to_string(),
        ))
    }

    pub(super) fn read_exact(handle: &Handle, count: usize, timeout: Duration) -> Result<Vec<u8>> {
        let mut instr = handle.lock();
        instr
            .set_timeout(timeout.as_millis() as u32)
            .context("Failed to set VISA timeout")?;
        let mut buf = vec![0u8; count];
        instr
            .read_exact(&mut buf)
            .with_context(|| format!("Failed to read {} raw VISA bytes", count))?;
        Ok(buf)
    }
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    fn handle(&self) -> Result<Handle> {
        self.handle
            .clone()
            .ok_or_else(|| anyhow!("VISA resource '{}' is not open", self.resource))
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let handle = self.handle()?;
        let timeout = self.timeout;
        let payload = format!("{}\n", line).into_bytes();
        tokio::task::spawn_blocking(move || io::write(&handle, &payload, timeout))
            .await
            .context("VISA write task failed")?
    }

    // The read is bounded by the resource's own timeout, never by dropping the
    // blocking task, so a late reply cannot be consumed by a detached read.
    async fn read_line(&self) -> Result<Option<String>> {
        let handle = self.handle()?;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || io::read_line(&handle, timeout))
            .await
            .context("VISA read task failed")?
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl Transport for VisaTransport {
    fn address(&self) -> &str {
        &self.resource
    }

    async fn connect(&mut self) -> Result<()> {
        let resource = self.resource.clone();
        let timeout = self.timeout;
        let handle = tokio::task::spawn_blocking(move || io::open(&resource, timeout))
            .await
            .context("VISA open task failed")??;
        self.handle = Some(handle);
        tracing::debug!(resource = %self.resource, "VISA resource open");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.handle = None;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        self.write_line(command).await
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        self.read_line().await
    }

    async fn receive_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        let handle = self.handle()?;
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || io::read_exact(&handle, count, timeout))
            .await
            .context("VISA read task failed")?
    }

    async fn adapter_command(&mut self, command: GpibAdapterCommand) -> Result<Option<String>> {
        if !self.gpib_adapter {
            return Ok(None);
        }
        self.write_line(&command.to_string()).await?;
        if command.is_query() {
            self.read_line().await
        } else {
            Ok(None)
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl Transport for VisaTransport {
    fn address(&self) -> &str {
        &self.resource
    }

    async fn connect(&mut self) -> Result<()> {
        bail!(
            "VISA support not enabled for '{}'. Rebuild with --features instrument_visa",
            self.resource
        )
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, _command: &str) -> Result<()> {
        bail!("VISA resource '{}' is not open", self.resource)
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        bail!("VISA resource '{}' is not open", self.resource)
    }

    async fn receive_raw(&mut self, _count: usize) -> Result<Vec<u8>> {
        bail!("VISA resource '{}' is not open", self.resource)
    }

    async fn adapter_command(&mut self, _command: GpibAdapterCommand) -> Result<Option<String>> {
        if self.gpib_adapter {
            bail!("VISA resource '{}' is not open", self.resource)
        }
        Ok(None)
    }
}
