//! Notification channel toward the presentation layer
//!
//! Every worker reports through a cloned [`Notifier`]; the front end owns
//! the single receiving end and sees events in the order they were sent.

use courier_core::{Direction, FileTransferDescriptor, PeerId};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifies one unit of background work
pub type TaskId = u64;

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Get a unique task ID
pub fn next_task_id() -> TaskId {
    TASK_COUNTER.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Login line sent; the session is listening
    Connected { username: PeerId },
    /// A line from the relay
    Log(String),
    TransferStarted(FileTransferDescriptor),
    TransferProgress {
        file_name: String,
        direction: Direction,
        percent: u8,
    },
    TransferCompleted {
        transfer: FileTransferDescriptor,
        path: PathBuf,
    },
    TransferFailed {
        transfer: FileTransferDescriptor,
        reason: String,
    },
    PeersListed {
        task: TaskId,
        peers: BTreeSet<PeerId>,
    },
    SubmissionAcknowledged {
        task: TaskId,
        transfer: FileTransferDescriptor,
        response: String,
    },
    TaskFailed { task: TaskId, reason: String },
    TaskCancelled { task: TaskId },
    /// The session ended; `reason` is `None` for an explicit disconnect
    Disconnected { reason: Option<String> },
}

impl ClientEvent {
    /// One-line human-readable description
    pub fn describe(&self) -> String {
        match self {
            ClientEvent::Connected { username } => format!("Connected as {}", username),
            ClientEvent::Log(line) => format!("Server: {}", line),
            ClientEvent::TransferStarted(t) => match t.direction {
                Direction::Inbound => format!("A file named \"{}\" has been sent to you", t.file_name),
                Direction::Outbound => format!("Sending \"{}\" to {}", t.file_name, t.peer),
            },
            ClientEvent::TransferProgress {
                file_name,
                direction,
                percent,
            } => {
                let verb = match direction {
                    Direction::Inbound => "Receiving",
                    Direction::Outbound => "Sending",
                };
                format!("{} {}: {}%", verb, file_name, percent)
            }
            ClientEvent::TransferCompleted { transfer, path } => match transfer.direction {
                Direction::Inbound => format!("File {} received: {}", transfer.file_name, path.display()),
                Direction::Outbound => format!("File {} sent", transfer.file_name),
            },
            ClientEvent::TransferFailed { transfer, reason } => {
                format!("Transfer of {} failed: {}", transfer.file_name, reason)
            }
            ClientEvent::PeersListed { peers, .. } => {
                if peers.is_empty() {
                    "No clients online!".to_string()
                } else {
                    let names: Vec<&str> = peers.iter().map(PeerId::as_str).collect();
                    format!("Online: {}", names.join(", "))
                }
            }
            ClientEvent::SubmissionAcknowledged {
                transfer, response, ..
            } => format!(
                "File '{}' sent successfully! Server response: {}",
                transfer.file_name, response
            ),
            ClientEvent::TaskFailed { task, reason } => format!("Task {} failed: {}", task, reason),
            ClientEvent::TaskCancelled { task } => format!("Task {} cancelled", task),
            ClientEvent::Disconnected { reason: None } => "Disconnected".to_string(),
            ClientEvent::Disconnected { reason: Some(reason) } => {
                format!("Lost connection to the server: {}", reason)
            }
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<ClientEvent>;

/// Sending side of the notification channel
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<ClientEvent>,
}

impl Notifier {
    /// Create a notifier and the receiver the front end drains
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: ClientEvent) {
        tracing::trace!("event: {:?}", event);
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped; notification discarded");
        }
    }
}
