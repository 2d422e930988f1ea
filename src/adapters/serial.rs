//! Serial transport for RS-232 / USB-serial instruments
//!
//! Also drives Prologix GPIB-USB controllers, which appear as a 9600 8N1
//! serial port and take `++` prefixed control commands. In that mode the
//! controller is put into controller mode and addressed on connect, and every
//! read is preceded by `++read eoi`.

use super::{read_exact, read_line, Transport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 1000;
const PROLOGIX_BAUD: u32 = 9600;

/// Serial link, optionally through a Prologix GPIB controller.
pub struct SerialTransport {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    /// GPIB address when talking through a Prologix controller.
    prologix_address: Option<u8>,
    port: Option<BufStream<SerialStream>>,
}

impl SerialTransport {
    /// Direct serial link with `\r\n` line termination.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(DEFAULT_SERIAL_TIMEOUT_MS),
            line_terminator: "\r\n".to_string(),
            prologix_address: None,
            port: None,
        }
    }

    /// Link to the instrument at `gpib_address` behind a Prologix controller.
    pub fn prologix(port_name: impl Into<String>, gpib_address: u8) -> Self {
        Self {
            line_terminator: "\n".to_string(),
            prologix_address: Some(gpib_address),
            ..Self::new(port_name, PROLOGIX_BAUD)
        }
    }

    /// Read timeout for replies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Terminator appended to every command.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let payload = format!("{}{}", line, self.line_terminator);
        let port_name = self.port_name.clone();
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", port_name))?;
        port.write_all(payload.as_bytes())
            .await
            .with_context(|| format!("Failed to write to serial port '{}'", port_name))?;
        port.flush().await.context("Failed to flush serial port")?;
        Ok(())
    }

    fn port(&mut self) -> Result<&mut BufStream<SerialStream>> {
        let port_name = &self.port_name;
        self.port
            .as_mut()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", port_name))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn address(&self) -> &str {
        &self.port_name
    }

    async fn connect(&mut self) -> Result<()> {
        let port = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port '{}'", self.port_name))?;
        self.port = Some(BufStream::new(port));
        debug!(port = %self.port_name, baud = self.baud_rate, "Serial port open");

        if let Some(address) = self.prologix_address {
            let setup = [
                "++mode 1".to_string(),
                format!("++addr {}", address),
                "++auto 0".to_string(),
                "++eoi 1".to_string(),
            ];
            for line in &setup {
                self.write_line(line).await?;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.port = None;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        self.write_line(command).await
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        if self.prologix_address.is_some() {
            self.write_line("++read eoi").await?;
        }
        let timeout = self.timeout;
        read_line(self.port()?, timeout).await
    }

    async fn receive_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        if self.prologix_address.is_some() {
            self.write_line("++read eoi").await?;
        }
        let timeout = self.timeout;
        read_exact(self.port()?, count, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prologix_defaults() {
        let link = SerialTransport::prologix("/dev/ttyUSB0", 22);
        assert_eq!(link.baud_rate, 9600);
        assert_eq!(link.prologix_address, Some(22));
        assert_eq!(link.line_terminator, "\n");
        assert_eq!(link.address(), "/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let mut link = SerialTransport::new("/dev/null-does-not-exist", 9600);
        assert!(link.send("*IDN?").await.is_err());
    }
}
