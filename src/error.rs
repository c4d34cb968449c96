//! Error taxonomy shared by the transport, arbiter, client and polling layers.

use crate::protocol::LinkKey;
use std::{fmt, io};

/// Represents all possible errors of a single register access.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A slave id, register address or count failed its static bounds.
    /// Raised before any I/O and never retried.
    #[error("{what} {value} out of range {min}..={max}")]
    OutOfRange {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// The link is known to be down; the caller has to connect again.
    #[error("link {0} is not connected")]
    NotConnected(LinkKey),

    /// Opening the socket or serial port failed.
    #[error("cannot connect to {link}: {source}")]
    Connect {
        link: LinkKey,
        #[source]
        source: io::Error,
    },

    /// Socket or serial failure, timeout or malformed response.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device answered with a Modbus exception. This is a final answer
    /// and is never retried.
    #[error("Modbus exception: {0}")]
    Protocol(#[from] tokio_modbus::ExceptionCode),
}

impl Error {
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    pub(crate) fn invalid_data(message: impl Into<String>) -> Self {
        Error::Io(io::Error::new(io::ErrorKind::InvalidData, message.into()))
    }
}

impl From<tokio_modbus::Error> for Error {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(err) => Error::Io(err),
            // Mismatched or garbled responses are a transport problem too.
            other => Error::invalid_data(other.to_string()),
        }
    }
}

/// The result type for register access.
pub type Result<T> = std::result::Result<T, Error>;

/// Operation of a device facade, used to name the failing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Disconnect,
    ReadInt,
    ReadFloat,
    ReadValue,
    WriteInt,
    WriteFloat,
    WriteU16,
    WriteValue,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::ReadInt => "read int",
            Operation::ReadFloat => "read float",
            Operation::ReadValue => "read value",
            Operation::WriteInt => "write int",
            Operation::WriteFloat => "write float",
            Operation::WriteU16 => "write u16",
            Operation::WriteValue => "write value",
        })
    }
}

/// A failure of a device facade operation, naming the device and operation.
#[derive(thiserror::Error, Debug)]
#[error("{device}: {operation} failed: {error}")]
pub struct DeviceError {
    pub device: String,
    pub operation: Operation,
    #[source]
    pub error: Error,
}

/// Terminal error of a polling session whose scheduled read failed.
#[derive(thiserror::Error, Debug)]
#[error("device {device} disconnected: {error}")]
pub struct DeviceDisconnectedError {
    pub device: String,
    #[source]
    pub error: DeviceError,
}
