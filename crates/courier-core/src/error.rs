//! Error types for Courier
//!
//! Every failure the protocol core can produce falls into one of five
//! kinds. I/O errors are mapped explicitly at each call site, since the same
//! `std::io::Error` means something different coming from a socket than
//! coming from the local disk.

use crate::cipher::CipherError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer integrity error: expected {expected} bytes, moved {actual}")]
    TransferIntegrity { expected: u64, actual: u64 },

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Coarse classification of an [`Error`], used by callers that branch on
/// the kind of failure rather than its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Protocol,
    TransferIntegrity,
    Cipher,
    Filesystem,
}

impl Error {
    /// Wrap a socket-side I/O error
    pub fn connection(context: &str, err: std::io::Error) -> Self {
        Error::Connection(format!("{}: {}", context, err))
    }

    /// Wrap a disk-side I/O error
    pub fn filesystem(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        Error::Filesystem(format!("{}: {}", context, err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            // A stalled peer is indistinguishable from a dead one
            Error::Connection(_) | Error::Timeout(_) => ErrorKind::Connection,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::TransferIntegrity { .. } => ErrorKind::TransferIntegrity,
            Error::Cipher(_) => ErrorKind::Cipher,
            Error::Filesystem(_) => ErrorKind::Filesystem,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
