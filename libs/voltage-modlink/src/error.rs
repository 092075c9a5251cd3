//! Modbus Link Error Types
//!
//! One error enum covers the whole request path. Variants are grouped by
//! origin so callers can tell a bad argument from a broken frame, a device
//! exception reply, a transport failure, a cancellation or a disposed link.

use thiserror::Error;

use crate::types::ExceptionCode;

/// Result type for voltage-modlink operations
pub type ModbusResult<T> = std::result::Result<T, ModbusError>;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Send operation failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Receive operation failed
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Timeout occurred
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::IoError(err.to_string())
    }
}

/// Modbus link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModbusError {
    /// Caller-side precondition violation (null/duplicate/gapped lists, empty requests)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Count, address or enum value outside the permitted range
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Malformed or inconsistent frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// Device answered with an exception reply
    #[error("Remote exception on function 0x{function_code:02X}: {code}")]
    Exception {
        function_code: u8,
        code: ExceptionCode,
    },

    /// Transport failures (connect, read, write, timeouts)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Peer closed the stream before the response was complete
    #[error("End of stream reached before the response was complete")]
    EndOfStream,

    /// Request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Connection has been disposed
    #[error("Connection disposed")]
    Disposed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::Transport(TransportError::from(err))
    }
}

impl From<figment::Error> for ModbusError {
    fn from(err: figment::Error) -> Self {
        ModbusError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl ModbusError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        ModbusError::InvalidArgument(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        ModbusError::OutOfRange(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        ModbusError::Framing(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ModbusError::Config(msg.into())
    }

    /// Remote exception code, when the failure is a device exception reply
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        match self {
            ModbusError::Exception { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Check if this error came from the transport layer
    pub fn is_transport(&self) -> bool {
        matches!(self, ModbusError::Transport(_) | ModbusError::EndOfStream)
    }

    /// Check if the link may hold stale bytes after this error and must be reopened
    pub fn needs_reconnect(&self) -> bool {
        matches!(
            self,
            ModbusError::Transport(_) | ModbusError::EndOfStream | ModbusError::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_only_on_remote_errors() {
        let err = ModbusError::Exception {
            function_code: 0x03,
            code: ExceptionCode::IllegalDataAddress,
        };
        assert_eq!(err.exception_code(), Some(ExceptionCode::IllegalDataAddress));
        assert!(err.to_string().contains("0x03"));

        assert_eq!(ModbusError::framing("bad crc").exception_code(), None);
        assert_eq!(ModbusError::Disposed.exception_code(), None);
    }

    #[test]
    fn test_io_error_becomes_transport_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = ModbusError::from(io);
        assert!(err.is_transport());
        assert!(err.needs_reconnect());
    }

    #[test]
    fn test_argument_errors_do_not_reset_link() {
        assert!(!ModbusError::invalid_argument("x").needs_reconnect());
        assert!(!ModbusError::out_of_range("x").needs_reconnect());
        assert!(!ModbusError::framing("x").needs_reconnect());
    }
}
