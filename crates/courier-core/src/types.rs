//! Core data types for Courier

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a client on the relay (a username)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap an identity.
    ///
    /// Identities travel as single lines and as members of a comma-joined
    /// directory listing, so they may not contain line terminators or commas.
    pub fn parse(identity: &str) -> Result<Self> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(Error::Protocol("empty identity".to_string()));
        }
        if identity.contains(['\n', '\r', crate::proto::PEER_DELIMITER]) {
            return Err(Error::Protocol(format!("invalid identity: {:?}", identity)));
        }
        Ok(Self(identity.to_string()))
    }

    /// Get the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Lifecycle of the persistent connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    fn rank(self) -> u8 {
        match self {
            TransferStatus::Pending => 0,
            TransferStatus::InProgress => 1,
            TransferStatus::Completed | TransferStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Whether moving to `next` keeps the status monotonic.
    /// Terminal states are final; anything else may fail at any point.
    pub fn can_advance_to(self, next: TransferStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Bookkeeping for one file moving over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferDescriptor {
    /// Bare file name (no directory components)
    pub file_name: String,
    /// Byte count announced before the payload
    pub declared_size: u64,
    pub direction: Direction,
    /// Recipient for outbound transfers; the relay for inbound ones
    pub peer: String,
    status: TransferStatus,
}

impl FileTransferDescriptor {
    pub fn new(
        file_name: impl Into<String>,
        declared_size: u64,
        direction: Direction,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            declared_size,
            direction,
            peer: peer.into(),
            status: TransferStatus::Pending,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Move to `next` if the transition is monotonic. Returns whether the
    /// status changed.
    pub fn advance(&mut self, next: TransferStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    pub fn start(&mut self) -> bool {
        self.advance(TransferStatus::InProgress)
    }

    pub fn complete(&mut self) -> bool {
        self.advance(TransferStatus::Completed)
    }

    pub fn fail(&mut self) -> bool {
        self.advance(TransferStatus::Failed)
    }
}

/// Reduce a wire-supplied file name to its final path component.
///
/// Returns `None` when nothing usable is left (empty, `.` or `..`).
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => None,
        other => Some(other.to_string()),
    }
}
