//! Byte-stream transports
//!
//! This module contains implementations of the [`Transport`] trait, providing
//! line-oriented I/O for the different links bench instruments are reachable
//! over: an offline/test double, raw TCP (telnet-style), serial ports (direct
//! or through a Prologix GPIB controller) and VISA resources (USB-TMC, GPIB).

pub mod dummy;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod telnet;
pub mod visa;

pub use dummy::DummyTransport;
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;
pub use telnet::TelnetTransport;
pub use visa::VisaTransport;

use crate::config::{TimeoutSettings, TransportConfig};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

/// Line-oriented link to one instrument.
///
/// Implementations own the underlying handle; a transport is used by exactly
/// one session, which serializes all calls.
#[async_trait]
pub trait Transport: Send {
    /// Address of the link (resource string, port name, `host:port`).
    fn address(&self) -> &str;

    /// Opens the link.
    async fn connect(&mut self) -> Result<()>;

    /// Releases the link. Closing an unopened link is not an error.
    async fn disconnect(&mut self) -> Result<()>;

    /// Writes one command followed by the link's terminator.
    async fn send(&mut self, command: &str) -> Result<()>;

    /// Reads one reply line without its terminator; `None` when nothing
    /// arrived before the read timeout.
    async fn receive(&mut self) -> Result<Option<String>>;

    /// Reads exactly `count` raw bytes.
    async fn receive_raw(&mut self, count: usize) -> Result<Vec<u8>>;

    /// Sends a control command to a USB-GPIB adapter sitting between host and
    /// instrument. Links without such an adapter ignore it.
    async fn adapter_command(&mut self, _command: GpibAdapterCommand) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Read termination used by a USB-GPIB adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTerminator {
    /// Carriage return.
    Cr,
    /// Line feed.
    Lf,
    /// GPIB EOI line.
    Eoi,
}

/// Automatic instrument identification behaviour of the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoIdMode {
    /// Enabled.
    On,
    /// Disabled.
    Off,
    /// Enabled with slow timing.
    Slow,
    /// Enabled with slower timing.
    Slower,
    /// Enabled with slowest timing.
    Slowest,
}

/// USB-GPIB adapter (Xyphro firmware) control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpibAdapterCommand {
    /// Firmware version query.
    Version,
    /// Select the read terminator.
    SetReadTerminator(ReadTerminator),
    /// Persist the current terminator setting.
    StoreReadTerminator,
    /// Query the read terminator.
    QueryReadTerminator,
    /// Configure automatic identification.
    SetAutoId(AutoIdMode),
    /// Query automatic identification.
    QueryAutoId,
    /// Short or normal string mode.
    SetShortStrings(bool),
    /// Query string mode.
    QueryStringMode,
    /// Reset the adapter.
    Reset,
}

impl GpibAdapterCommand {
    /// True when the adapter answers the command.
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            GpibAdapterCommand::Version
                | GpibAdapterCommand::QueryReadTerminator
                | GpibAdapterCommand::QueryAutoId
                | GpibAdapterCommand::QueryStringMode
        )
    }
}

impl fmt::Display for GpibAdapterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpibAdapterCommand::Version => f.write_str("!ver?"),
            GpibAdapterCommand::SetReadTerminator(t) => {
                let t = match t {
                    ReadTerminator::Cr => "cr",
                    ReadTerminator::Lf => "lf",
                    ReadTerminator::Eoi => "eoi",
                };
                write!(f, "!term {}", t)
            }
            GpibAdapterCommand::StoreReadTerminator => f.write_str("!term store"),
            GpibAdapterCommand::QueryReadTerminator => f.write_str("!term?"),
            GpibAdapterCommand::SetAutoId(mode) => {
                let mode = match mode {
                    AutoIdMode::On => "on",
                    AutoIdMode::Off => "off",
                    AutoIdMode::Slow => "slow",
                    AutoIdMode::Slower => "slower",
                    AutoIdMode::Slowest => "slowest",
                };
                write!(f, "!autoid {}", mode)
            }
            GpibAdapterCommand::QueryAutoId => f.write_str("!autoid?"),
            GpibAdapterCommand::SetShortStrings(true) => f.write_str("!string short"),
            GpibAdapterCommand::SetShortStrings(false) => f.write_str("!string normal"),
            GpibAdapterCommand::QueryStringMode => f.write_str("!string?"),
            GpibAdapterCommand::Reset => f.write_str("!reset"),
        }
    }
}

/// Appends `::INSTR` to USB resource strings that lack it.
pub fn normalize_resource(resource: &str) -> String {
    let resource = resource.trim();
    if resource.to_ascii_uppercase().starts_with("USB") && !resource.ends_with("::INSTR") {
        format!("{}::INSTR", resource)
    } else {
        resource.to_string()
    }
}

/// Builds a USB-TMC resource string from a `vid:pid` pair and serial number.
pub fn usb_tmc_resource(vendor_product: &str, serial: &str) -> Result<String> {
    let (vendor, product) = vendor_product
        .split_once(':')
        .ok_or_else(|| anyhow!("USB id '{}' is not of the form vid:pid", vendor_product))?;
    let parse = |hex: &str| {
        u16::from_str_radix(hex.trim().trim_start_matches("0x"), 16)
            .with_context(|| format!("Invalid USB id component '{}'", hex))
    };
    let (vendor, product) = (parse(vendor)?, parse(product)?);
    if serial.trim().is_empty() {
        bail!("USB-TMC serial number is empty");
    }
    Ok(format!(
        "USB::0x{:04x}::0x{:04x}::{}::INSTR",
        vendor,
        product,
        serial.trim()
    ))
}

/// Reads one line with a timeout, stripping `\r\n`.
pub(crate) async fn read_line<S>(stream: &mut S, timeout: Duration) -> Result<Option<String>>
where
    S: AsyncBufRead + Unpin + Send,
{
    let mut line = String::new();
    match tokio::time::timeout(timeout, stream.read_line(&mut line)).await {
        Err(_) => Ok(None),
        Ok(Ok(0)) => bail!("Link closed by peer"),
        Ok(Ok(_)) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
        Ok(Err(e)) => Err(e).context("Failed to read reply line"),
    }
}

/// Reads exactly `count` bytes with a timeout.
pub(crate) async fn read_exact<S>(stream: &mut S, count: usize, timeout: Duration) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; count];
    tokio::time::timeout(timeout, stream.read_exact(&mut buf))
        .await
        .map_err(|_| anyhow!("Timed out waiting for {} raw bytes", count))?
        .context("Failed to read raw bytes")?;
    Ok(buf)
}

/// Builds the transport described by `config`, not yet connected.
pub fn open_transport(
    config: &TransportConfig,
    timeouts: &TimeoutSettings,
) -> Result<Box<dyn Transport>> {
    let read_timeout = Duration::from_millis(timeouts.read_timeout_ms);
    Ok(match config {
        TransportConfig::Dummy => Box::new(DummyTransport::new()),
        TransportConfig::Telnet { host } => {
            Box::new(TelnetTransport::new(host.clone()).with_timeout(read_timeout))
        }
        TransportConfig::Visa { resource } => {
            Box::new(VisaTransport::new(normalize_resource(resource)).with_timeout(read_timeout))
        }
        TransportConfig::UsbTmc {
            vendor_product,
            serial,
        } => Box::new(
            VisaTransport::new(usb_tmc_resource(vendor_product, serial)?)
                .with_timeout(read_timeout)
                .with_gpib_adapter(true),
        ),
        #[cfg(feature = "instrument_serial")]
        TransportConfig::Serial { port, baud_rate } => {
            Box::new(SerialTransport::new(port.clone(), *baud_rate).with_timeout(read_timeout))
        }
        #[cfg(feature = "instrument_serial")]
        TransportConfig::Prologix { port, gpib_address } => Box::new(
            SerialTransport::prologix(port.clone(), *gpib_address).with_timeout(read_timeout),
        ),
        #[cfg(not(feature = "instrument_serial"))]
        TransportConfig::Serial { .. } | TransportConfig::Prologix { .. } => {
            bail!("Serial support not enabled. Rebuild with --features instrument_serial")
        }
    })
}
