//! VoltageEMS Modbus Link
//!
//! Modbus RTU, ASCII and TCP codecs plus a connection that serializes
//! concurrent requests onto one serial port or TCP socket.
//!
//! # Layers
//!
//! - `checksum` - CRC16 (RTU) and LRC (ASCII)
//! - `codec` - framing, completeness predicates, response validation and
//!   the responder-side request/response codec for each transport
//! - `transport` - raw byte links (TCP, serial, in-memory mock)
//! - `connection` - FIFO queue, single worker, reconnect back-off, idle close
//! - `client` - typed operations over a codec and a connection
//! - `server` - simulated device and proxy handlers, stream/TCP server
//!
//! # Features
//!
//! - `test-utils` - exports `MockTransport` for downstream tests

pub mod checksum;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod logging;
pub mod server;
pub mod transport;
pub mod types;

pub use client::ModbusClient;
pub use codec::{
    AduHeader, AsciiProtocol, ModbusProtocol, ProtocolKind, Request, Response, RtuProtocol,
    TcpProtocol,
};
pub use config::{load_link_config, LinkConfig, TransportConfig};
pub use connection::{ConnectionOptions, ConnectionState, ModbusConnection};
pub use error::{ModbusError, ModbusResult, TransportError};
pub use server::{
    serve_stream, DeviceHandler, ModbusTcpServer, ProxyHandler, RegisterStore, RequestHandler,
    WriteNotification,
};
pub use types::{
    Coil, DeviceIdentification, DeviceIdentificationCategory, DeviceIdentificationRaw,
    DeviceIdentity, DiscreteInput, ExceptionCode, HoldingRegister, InputRegister, ModbusObject,
};

// Re-exported so callers need no direct tokio-util dependency
pub use tokio_util::sync::CancellationToken;
