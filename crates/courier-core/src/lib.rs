//! Courier Core - wire protocol, transfer and cipher building blocks
//!
//! This crate provides everything the Courier client needs to talk to a
//! relay server without depending on any particular front end.

pub mod cipher;
pub mod error;
pub mod proto;
pub mod transfer;
pub mod transport;
pub mod types;

pub use cipher::{AesGcmCipher, CipherError, CipherOperation, CipherRequest, FileCipher, KdfParams, KeyLength};
pub use error::{Error, ErrorKind, Result};
pub use proto::{ControlLine, Framing};
pub use transport::{Dialer, FrameReader, TcpDialer};
pub use types::*;

/// Streaming chunk size: 64 KiB
pub const CHUNK_SIZE: usize = 64 * 1024;
