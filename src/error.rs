use std::fmt;

use crate::types::DeviceIdentity;

/// Problems found while decoding a status frame. These are recovered by the
/// listener (resync) and never end a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    HeaderMismatch,
    ChecksumInvalid { expected: u8, actual: u8 },
    CrcInvalid { expected: u16, actual: u16 },
    UnknownEnum { field: &'static str, code: u8 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::HeaderMismatch => write!(f, "frame header mismatch"),
            FrameError::ChecksumInvalid { expected, actual } => {
                write!(f, "invalid checksum (expected {expected:02x}, actual {actual:02x})")
            }
            FrameError::CrcInvalid { expected, actual } => {
                write!(f, "invalid CRC (expected {expected:04x}, actual {actual:04x})")
            }
            FrameError::UnknownEnum { field, code } => write!(f, "unknown {field} code: {code}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Debug)]
pub enum Error {
    TransportTimeout,
    TransportConnectFailed { addr: String, source: std::io::Error },
    /// The gateway answered with a non-zero `err` field.
    Gateway(i64),
    Protocol(String),
    UnknownDevice(DeviceIdentity),
    InvalidArgument(String),
    Io(std::io::Error),
}

impl Error {
    /// Timeouts and refused connections; the only failures worth a retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransportTimeout | Error::TransportConnectFailed { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TransportTimeout => write!(f, "gateway request timed out"),
            Error::TransportConnectFailed { addr, source } => {
                write!(f, "failed to connect to {addr}: {source}")
            }
            Error::Gateway(code) => write!(f, "gateway error: err={code}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::UnknownDevice(id) => write!(f, "unknown device: {id}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::TransportConnectFailed { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(format!("invalid JSON: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
