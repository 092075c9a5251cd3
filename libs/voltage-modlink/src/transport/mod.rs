//! Transport Layer
//!
//! Byte-stream links underneath a Modbus connection. A transport only moves
//! bytes: framing lives in the codec, timeouts and reconnect policy live in
//! the connection.
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   ModbusConnection (queue + worker)   │
//! └───────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌───────────────────────────────────────┐
//! │          Transport (trait)            │
//! │  connect(), disconnect(), send(),     │
//! │  receive()                            │
//! └───────────────────────────────────────┘
//!          │                     │
//!          ▼                     ▼
//!   ┌─────────────┐      ┌──────────────┐
//!   │ TcpTransport│      │SerialTransport│
//!   └─────────────┘      └──────────────┘
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod serial;
pub mod tcp;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockEvent, MockTransport};
pub use serial::{FlowControl, Parity, SerialTransport, SerialTransportConfig};
pub use tcp::{TcpTransport, TcpTransportConfig};

use async_trait::async_trait;
use std::fmt;

pub use crate::error::TransportError;

/// Core transport trait implemented by every physical link
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Transport type identifier ("tcp", "serial", ...)
    fn transport_type(&self) -> &str;

    /// Human-readable endpoint name
    fn name(&self) -> &str;

    /// Open the link
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the link; closing a closed link is a no-op
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Write all of `data`
    ///
    /// # Returns
    ///
    /// `Ok(bytes_sent)` if successful, `Err` otherwise
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever is available into `buffer`
    ///
    /// # Returns
    ///
    /// `Ok(0)` when the peer closed the stream, otherwise the number of bytes read
    async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, TransportError>;
}
