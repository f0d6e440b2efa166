//! Error types for the stratum server.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StratumError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, StratumError>;
