//! Serial Transport Implementation
//!
//! RS-232/RS-485 links via tokio-serial. RTU and ASCII framing both run on
//! top of this transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

use super::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialTransportConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub device: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Assert RTS after opening to enable an RS-485 line driver
    pub rs485_driver_enable: bool,
}

impl Default for SerialTransportConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
            rs485_driver_enable: false,
        }
    }
}

impl SerialTransportConfig {
    pub fn new(device: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.device.is_empty() {
            return Err(TransportError::ConfigError(
                "Port path cannot be empty".to_string(),
            ));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::ConfigError(
                "Baud rate must be greater than zero".to_string(),
            ));
        }
        if ![5, 6, 7, 8].contains(&self.data_bits) {
            return Err(TransportError::ConfigError(format!(
                "Invalid data bits: {}",
                self.data_bits
            )));
        }
        if ![1, 2].contains(&self.stop_bits) {
            return Err(TransportError::ConfigError(format!(
                "Invalid stop bits: {}",
                self.stop_bits
            )));
        }
        Ok(())
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }

    fn flow_control(&self) -> tokio_serial::FlowControl {
        match self.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        }
    }

    /// Open the port with these settings
    pub fn open(&self) -> Result<SerialStream, TransportError> {
        let mut port = tokio_serial::new(&self.device, self.baud_rate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .flow_control(self.flow_control())
            .open_native_async()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!(
                    "Failed to open serial port {}: {e}",
                    self.device
                ))
            })?;

        #[cfg(unix)]
        port.set_exclusive(false)
            .map_err(|e| TransportError::IoError(format!("Failed to set exclusive mode: {e}")))?;

        if self.rs485_driver_enable {
            port.write_request_to_send(true)
                .map_err(|e| TransportError::IoError(format!("Failed to assert RTS: {e}")))?;
        }

        Ok(port)
    }
}

/// Serial transport implementation
#[derive(Debug)]
pub struct SerialTransport {
    config: SerialTransportConfig,
    port: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(config: SerialTransportConfig) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self { config, port: None })
    }

    pub fn config(&self) -> &SerialTransportConfig {
        &self.config
    }
}

/// Teardown is best effort: a failed RTS release is logged, the close goes on
fn release_driver(device: &str, result: Result<(), tokio_serial::Error>) {
    if let Err(e) = result {
        debug!("{device}: RTS release failed: {e}");
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    fn name(&self) -> &str {
        &self.config.device
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!("Opening serial port: {}", self.config.device);
        self.port = Some(self.config.open()?);
        info!(
            "Serial opened: {} @ {} baud",
            self.config.device, self.config.baud_rate
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(mut port) = self.port.take() {
            if self.config.rs485_driver_enable {
                // Release the line driver before closing
                release_driver(&self.config.device, port.write_request_to_send(false));
            }
            info!("Serial closed: {}", self.config.device);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        port.flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        trace!(
            hex_data = %hex::encode(data),
            length = data.len(),
            direction = "send",
            "[Serial] Raw packet"
        );
        Ok(data.len())
    }

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        let n = port
            .read(buffer)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        trace!(
            hex_data = %hex::encode(&buffer[..n]),
            length = n,
            direction = "recv",
            "[Serial] Raw packet"
        );
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_config_validation() {
        assert!(SerialTransportConfig::default().validate().is_ok());

        let mut config = SerialTransportConfig::new("/dev/ttyS0", 19200);
        config.data_bits = 9;
        assert!(config.validate().is_err());

        config.data_bits = 7;
        config.stop_bits = 3;
        assert!(config.validate().is_err());

        assert!(SerialTransportConfig::new("", 9600).validate().is_err());
        assert!(SerialTransportConfig::new("/dev/ttyS0", 0).validate().is_err());
    }

    #[test]
    fn test_setting_conversion() {
        let config = SerialTransportConfig {
            data_bits: 7,
            stop_bits: 2,
            parity: Parity::Even,
            flow_control: FlowControl::Hardware,
            ..SerialTransportConfig::default()
        };
        assert_eq!(config.data_bits(), tokio_serial::DataBits::Seven);
        assert_eq!(config.stop_bits(), tokio_serial::StopBits::Two);
        assert_eq!(config.parity(), tokio_serial::Parity::Even);
        assert_eq!(config.flow_control(), tokio_serial::FlowControl::Hardware);
    }

    #[tokio::test]
    async fn test_missing_device_fails_to_open() {
        let mut transport =
            SerialTransport::new(SerialTransportConfig::new("/dev/modlink-does-not-exist", 9600))
                .unwrap_or_else(|e| panic!("{e}"));
        assert!(matches!(
            transport.connect().await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert!(!transport.is_connected());
    }

    #[test]
    #[traced_test]
    fn test_failed_rts_release_is_logged() {
        release_driver("/dev/ttyUSB0", Ok(()));
        assert!(!logs_contain("RTS release failed"));

        let gone = tokio_serial::Error::new(tokio_serial::ErrorKind::NoDevice, "device removed");
        release_driver("/dev/ttyUSB0", Err(gone));
        assert!(logs_contain("/dev/ttyUSB0: RTS release failed: device removed"));
    }
}
