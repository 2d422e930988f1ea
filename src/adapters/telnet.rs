//! Raw TCP transport for instruments or LAN-GPIB bridges listening on a
//! telnet-style port.

use super::{read_exact, read_line, Transport};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-oriented TCP link to `host:port`.
pub struct TelnetTransport {
    host: String,
    stream: Option<BufStream<TcpStream>>,
    timeout: Duration,
    line_terminator: String,
}

impl TelnetTransport {
    /// Link to `host` (`address:port`), not yet connected.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            stream: None,
            timeout: Duration::from_secs(1),
            line_terminator: "\n".to_string(),
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

    fn stream(&mut self) -> Result<&mut BufStream<TcpStream>> {
        let host = &self.host;
        self.stream
            .as_mut()
            .ok_or_else(|| anyhow!("Link to '{}' is not open", host))
    }
}

#[async_trait]
impl Transport for TelnetTransport {
    fn address(&self) -> &str {
        &self.host
    }

    async fn connect(&mut self) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.host))
            .await
            .map_err(|_| anyhow!("Timed out connecting to '{}'", self.host))?
            .with_context(|| format!("Failed to connect to '{}'", self.host))?;
        stream.set_nodelay(true).ok();
        debug!(host = %self.host, "TCP link open");
        self.stream = Some(BufStream::new(stream));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown().await.ok();
        }
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<()> {
        let payload = format!("{}{}", command, self.line_terminator);
        let host = self.host.clone();
        let stream = self.stream()?;
        stream
            .write_all(payload.as_bytes())
            .await
            .with_context(|| format!("Failed to write to '{}'", host))?;
        stream.flush().await.context("Failed to flush TCP link")?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Option<String>> {
        let timeout = self.timeout;
        read_line(self.stream()?, timeout).await
    }

    async fn receive_raw(&mut self, count: usize) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        read_exact(self.stream()?, count, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, "*IDN?");
            write
                .write_all(b"HEWLETT-PACKARD,34401A,0,11-5-2\r\n")
                .await
                .unwrap();
        });

        let mut link = TelnetTransport::new(addr.to_string()).with_timeout(Duration::from_secs(2));
        link.connect().await.unwrap();
        link.send("*IDN?").await.unwrap();
        assert_eq!(
            link.receive().await.unwrap().as_deref(),
            Some("HEWLETT-PACKARD,34401A,0,11-5-2")
        );
        server.await.unwrap();
        link.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let mut link = TelnetTransport::new("127.0.0.1:1");
        assert!(link.send("*IDN?").await.is_err());
    }
}
