//! Error types for the wallet core.

use thiserror::Error;

/// Main error type for wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Unknown transaction: {0}")]
    UnknownTransaction(crate::types::TxId),

    #[error("Missing mandatory parameter: {0:?}")]
    MissingParameter(crate::params::TxParameterId),

    #[error("General error: {0}")]
    General(String),
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data not found: {0}")]
    NotFound(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Elliptic-curve and key-derivation errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid scalar")]
    InvalidScalar,

    #[error("Invalid point")]
    InvalidPoint,

    #[error("Degenerate sum (point at infinity)")]
    DegenerateSum,

    #[error("Value not yet computed: {0}")]
    NotReady(&'static str),

    #[error("secp256k1 error: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Parameter-blob codec errors.
///
/// Blobs use the canonical layout: little-endian integers, 33-byte
/// compressed points, 32-byte big-endian scalars, length-prefixed vectors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Blob truncated: expected {expected} bytes, got {actual}")]
    UnexpectedLength { expected: usize, actual: usize },

    #[error("Invalid discriminant: {0}")]
    InvalidDiscriminant(u32),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

impl From<secp256k1::Error> for CodecError {
    fn from(e: secp256k1::Error) -> Self {
        CodecError::InvalidValue(e.to_string())
    }
}

/// Node-connection failures surfaced to the UI layer.
///
/// A closed enumeration mapped from transport error codes and node
/// disconnect reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NodeConnectionError {
    #[error("Node protocol violation")]
    NodeProtocolBase,

    #[error("Node protocol version is incompatible")]
    NodeProtocolIncompatible,

    #[error("System time is out of sync with the network")]
    TimeOutOfSync,

    #[error("Connection timed out")]
    ConnectionTimedOut,

    #[error("Connection refused")]
    ConnectionRefused,
}

impl NodeConnectionError {
    /// Map a transport error code to the UI-facing enumeration.
    ///
    /// Unknown codes collapse to the base protocol error.
    pub fn from_transport_code(code: i32) -> Self {
        match code {
            -110 => NodeConnectionError::ConnectionTimedOut,
            -111 => NodeConnectionError::ConnectionRefused,
            -2 => NodeConnectionError::TimeOutOfSync,
            -1 => NodeConnectionError::NodeProtocolIncompatible,
            _ => NodeConnectionError::NodeProtocolBase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_map_to_ui_errors() {
        assert_eq!(
            NodeConnectionError::from_transport_code(-110),
            NodeConnectionError::ConnectionTimedOut
        );
        assert_eq!(
            NodeConnectionError::from_transport_code(-111),
            NodeConnectionError::ConnectionRefused
        );
        assert_eq!(
            NodeConnectionError::from_transport_code(-2),
            NodeConnectionError::TimeOutOfSync
        );
        assert_eq!(
            NodeConnectionError::from_transport_code(12345),
            NodeConnectionError::NodeProtocolBase
        );
    }
}

/// Type alias for Result with WalletError.
pub type Result<T> = std::result::Result<T, WalletError>;

/// Type alias for storage operation results.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Type alias for crypto operation results.
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Type alias for codec operation results.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
