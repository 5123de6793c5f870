//! Error types for the shared-memory tensor store

use std::io;
use thiserror::Error;

use crate::device::Device;
use crate::id::ObjectId;

/// Shared-memory store errors
#[derive(Debug, Error)]
pub enum ShmError {
    /// Store endpoint unreachable, store not running, or connection unusable
    #[error("connection error: {0}")]
    Connection(String),

    /// Identifier unknown to the store (or not sealed yet)
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// Identifier already exists in the store
    #[error("object already exists: {0}")]
    DuplicateIdentifier(ObjectId),

    /// Store has no room for the object
    #[error("store capacity exceeded: requested {requested} bytes, available {available} bytes")]
    Capacity {
        /// Bytes requested
        requested: u64,
        /// Bytes still available in the store
        available: u64,
    },

    /// Descriptor lives on a device the store cannot share
    #[error("device {device} is not host accessible and cannot be shared through the store")]
    DeviceIncompatible {
        /// Offending device
        device: Device,
    },

    /// Connect or round trip exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// Identifier rejected before reaching the store
    #[error("invalid object identifier: {0}")]
    InvalidIdentifier(String),

    /// Malformed tensor descriptor
    #[error("invalid tensor descriptor: {0}")]
    InvalidDescriptor(String),

    /// Layout the store cannot represent (non-contiguous strides)
    #[error("unsupported tensor layout: {0}")]
    InvalidLayout(String),

    /// Typed access with the wrong element type
    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DtypeMismatch {
        /// Dtype of the tensor
        expected: String,
        /// Dtype requested by the caller
        actual: String,
    },

    /// Malformed or unexpected frame on the store channel
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Encoding or decoding error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Spawned worker process failed
    #[error("worker failed: {0}")]
    Worker(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ShmError {
    /// Map an IO error from the store channel, folding deadline expiry into
    /// [`ShmError::Timeout`]
    pub(crate) fn from_channel_io(err: io::Error, op: &str) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                ShmError::Timeout(format!("{op}: {err}"))
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => {
                ShmError::Connection(format!("{op}: store closed the connection ({err})"))
            }
            _ => ShmError::Io(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for ShmError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ShmError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ShmError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ShmError::Serialization(err.to_string())
    }
}

/// Result type for store operations
pub type ShmResult<T> = Result<T, ShmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = ObjectId::new("test111").unwrap();
        let err = ShmError::NotFound(id);
        assert_eq!(err.to_string(), "object not found: test111");

        let err = ShmError::Capacity {
            requested: 4096,
            available: 1024,
        };
        assert_eq!(
            err.to_string(),
            "store capacity exceeded: requested 4096 bytes, available 1024 bytes"
        );
    }

    #[test]
    fn test_channel_io_mapping() {
        let err = ShmError::from_channel_io(io::Error::from(io::ErrorKind::WouldBlock), "get");
        assert!(matches!(err, ShmError::Timeout(_)));

        let err = ShmError::from_channel_io(io::Error::from(io::ErrorKind::UnexpectedEof), "get");
        assert!(matches!(err, ShmError::Connection(_)));

        let err = ShmError::from_channel_io(io::Error::from(io::ErrorKind::PermissionDenied), "get");
        assert!(matches!(err, ShmError::Io(_)));
    }
}
