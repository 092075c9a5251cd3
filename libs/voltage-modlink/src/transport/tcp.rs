//! TCP Transport Implementation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{Transport, TransportError};

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TcpTransportConfig {
    /// Remote host address or name
    pub host: String,
    /// Remote port number
    pub port: u16,
    /// Socket connect timeout
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// TCP no-delay (Nagle algorithm off)
    pub no_delay: bool,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            connect_timeout: Duration::from_secs(10),
            no_delay: true,
        }
    }
}

impl TcpTransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::ConfigError(
                "Host cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::ConfigError(
                "Port cannot be zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(TransportError::ConfigError(
                "Connect timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Millisecond (de)serialization for `Duration` fields
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// TCP transport implementation
#[derive(Debug)]
pub struct TcpTransport {
    config: TcpTransportConfig,
    endpoint: String,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self {
            endpoint: config.endpoint(),
            config,
            stream: None,
        })
    }

    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!("Connecting to TCP endpoint: {}", self.endpoint);

        match timeout(self.config.connect_timeout, TcpStream::connect(&self.endpoint)).await {
            Ok(Ok(stream)) => {
                if self.config.no_delay {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {e}");
                    }
                }
                self.stream = Some(stream);
                info!("TCP connected: {}", self.endpoint);
                Ok(())
            },
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!(
                "Failed to connect to {}: {e}",
                self.endpoint
            ))),
            Err(_) => Err(TransportError::Timeout(format!(
                "Connection to {} timed out",
                self.endpoint
            ))),
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown: {e}");
            }
            info!("TCP disconnected: {}", self.endpoint);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        stream
            .write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(
            hex_data = %hex::encode(data),
            length = data.len(),
            direction = "send",
            "[TCP] Raw packet"
        );
        Ok(data.len())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let n = stream
            .read(buffer)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        trace!(
            hex_data = %hex::encode(&buffer[..n]),
            length = n,
            direction = "recv",
            "[TCP] Raw packet"
        );
        Ok(n)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_config_validation() {
        assert!(TcpTransportConfig::default().validate().is_ok());
        assert!(TcpTransportConfig::new("", 502).validate().is_err());
        assert!(TcpTransportConfig::new("localhost", 0).validate().is_err());
    }

    #[tokio::test]
    async fn test_send_receive_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let echo = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut transport = TcpTransport::new(TcpTransportConfig::new("127.0.0.1", port)).unwrap();
        assert!(matches!(
            transport.send(&[1]).await,
            Err(TransportError::NotConnected)
        ));

        transport.connect().await.unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.send(&[0x01, 0x02, 0x03]).await.unwrap(), 3);

        let mut buf = [0u8; 16];
        let n = transport.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);

        echo.await.unwrap();
        // Peer closed: end of stream reads as zero bytes
        assert_eq!(transport.receive(&mut buf).await.unwrap(), 0);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TcpTransport::new(TcpTransportConfig::new("127.0.0.1", port)).unwrap();
        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
    }
}
